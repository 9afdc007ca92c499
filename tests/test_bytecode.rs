mod common;

use mutator::bytecode::{Instruction, LoadError, Module, OpCode, Operand, SequencePoint, HIDDEN_LINE};
use tempfile::TempDir;

#[test]
fn module_loads_with_and_without_symbols() {
    let dir = TempDir::new().unwrap();
    common::write_project(dir.path(), common::suite_json((3, 0, 3)));
    let path = dir.path().join("bin").join("Calc.json");

    let with = Module::load(&path, true).unwrap();
    assert!(common::body_of(&with, "Max").has_symbols());

    let without = Module::load(&path, false).unwrap();
    assert!(!common::body_of(&without, "Max").has_symbols());
    assert_eq!(with.methods.len(), without.methods.len());
}

#[test]
fn load_reports_missing_and_malformed_files() {
    let dir = TempDir::new().unwrap();
    let missing = Module::load(&dir.path().join("nope.json"), true).unwrap_err();
    assert!(matches!(missing, LoadError::Io { .. }));

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, "{ not json").unwrap();
    let err = Module::load(&broken, true).unwrap_err();
    assert!(matches!(err, LoadError::Parse { .. }));
    assert!(err.to_string().contains("broken.json"));
}

#[test]
fn save_then_load_preserves_module() {
    let dir = TempDir::new().unwrap();
    let module = common::calc_module();
    let path = dir.path().join("out.json");
    module.save(&path).unwrap();
    assert_eq!(Module::load(&path, true).unwrap(), module);
}

#[test]
fn simplify_leaves_no_short_forms() {
    let module = common::calc_module();
    for name in module.mutable_methods() {
        for instruction in &common::body_of(&module, &name).instructions {
            let (opcode, operand) = instruction.canonical();
            assert_eq!(instruction.opcode, opcode, "{}", instruction);
            assert_eq!(instruction.operand, operand, "{}", instruction);
        }
    }
    let max = common::body_of(&module, "Max");
    assert_eq!(max.instructions[3].opcode, OpCode::Brfalse);
    assert_eq!(max.instructions[3].operand, Operand::Target(6));
}

#[test]
fn mutable_methods_excludes_bodiless() {
    let module = common::calc_module();
    let methods = module.mutable_methods();
    assert_eq!(methods, vec!["Add", "Max", "Increment", "Double", "Mask"]);
}

#[test]
fn index_of_offset_uses_original_offsets() {
    let module = common::calc_module();
    let body = common::body_of(&module, "Increment");
    assert_eq!(body.index_of_offset(12), Some(4));
    assert_eq!(body.index_of_offset(13), None);
}

#[test]
fn sequence_point_lookup_walks_back_and_hides() {
    let module = common::calc_module();
    let body = common::body_of(&module, "Max");
    assert_eq!(body.sequence_point_for(2).unwrap().start_line, 20);
    assert_eq!(body.sequence_point_for(5).unwrap().start_line, 21);
    assert_eq!(body.sequence_point_for(99).unwrap().start_line, 22);

    let mut hidden = body.clone();
    hidden.instructions[4].sequence_point = Some(SequencePoint {
        document: "Calc.cs".into(),
        start_line: HIDDEN_LINE,
        start_column: 0,
        end_line: HIDDEN_LINE,
        end_column: 0,
    });
    assert!(hidden.sequence_point_for(5).is_none());
}

#[test]
fn call_stack_effect_follows_signature() {
    let module = common::calc_module();
    let call = Instruction::new(0, OpCode::Call, Operand::Method("Add".into()));
    assert_eq!(call.stack_effect(&module), (2, 1));
    let add = Instruction::new(0, OpCode::Add, Operand::None);
    assert_eq!(add.stack_effect(&module), (2, 1));
}

#[test]
fn instruction_display_shows_offset_and_operand() {
    let instruction = Instruction::new(0x1a, OpCode::Brtrue, Operand::Target(0x2c));
    assert_eq!(instruction.to_string(), "IL_001a: brtrue IL_002c");
    let plain = Instruction::new(3, OpCode::Ret, Operand::None);
    assert_eq!(plain.to_string(), "IL_0003: ret");
}
