mod common;

use std::time::{Duration, Instant};

use mutator::bytecode::{Instruction, Method, MethodBody, Module, OpCode, Operand, ParameterDef};
use mutator::interpreter::{Budget, Fault, Interpreter};

fn looping_module() -> Module {
    Module {
        name: "Loop".into(),
        fields: vec![],
        methods: vec![Method {
            name: "Spin".into(),
            parameters: vec![],
            returns: Some("int64".into()),
            body: Some(MethodBody {
                locals: vec![],
                instructions: vec![
                    Instruction::new(0, OpCode::Nop, Operand::None),
                    Instruction::new(1, OpCode::Br, Operand::Target(0)),
                ],
            }),
        }],
    }
}

fn caller_module() -> Module {
    let mut module = common::calc_module();
    module.methods.push(Method {
        name: "AddTwice".into(),
        parameters: vec![ParameterDef {
            name: "x".into(),
            ty: "int64".into(),
        }],
        returns: Some("int64".into()),
        body: Some(MethodBody {
            locals: vec![],
            instructions: vec![
                Instruction::new(0, OpCode::Ldarg, Operand::Arg(0)),
                Instruction::new(1, OpCode::Ldarg, Operand::Arg(0)),
                Instruction::new(2, OpCode::Call, Operand::Method("Add".into())),
                Instruction::new(7, OpCode::Ldarg, Operand::Arg(0)),
                Instruction::new(8, OpCode::Call, Operand::Method("Add".into())),
                Instruction::new(13, OpCode::Ret, Operand::None),
            ],
        }),
    });
    module
}

#[test]
fn evaluates_arithmetic_and_branches() {
    let module = common::calc_module();
    let mut vm = Interpreter::new(&module, Budget::default());
    assert_eq!(vm.invoke("Add", &[3, 4]), Ok(Some(7)));
    assert_eq!(vm.invoke("Max", &[1, 2]), Ok(Some(2)));
    assert_eq!(vm.invoke("Max", &[5, 3]), Ok(Some(5)));
    assert_eq!(vm.invoke("Double", &[21]), Ok(Some(42)));
    assert_eq!(vm.invoke("Mask", &[4]), Ok(Some(5)));
}

#[test]
fn static_fields_persist_until_reset() {
    let module = common::calc_module();
    let mut vm = Interpreter::new(&module, Budget::default());
    assert_eq!(vm.invoke("Increment", &[]), Ok(Some(1)));
    assert_eq!(vm.invoke("Increment", &[]), Ok(Some(2)));
    vm.reset_fields();
    assert_eq!(vm.invoke("Increment", &[]), Ok(Some(1)));
}

#[test]
fn calls_pass_arguments_in_order() {
    let module = caller_module();
    let mut vm = Interpreter::new(&module, Budget::default());
    assert_eq!(vm.invoke("AddTwice", &[5]), Ok(Some(15)));
}

#[test]
fn division_by_zero_faults() {
    let mut module = common::calc_module();
    let add = module.methods[0].body.as_mut().unwrap();
    add.instructions[2].opcode = OpCode::Div;
    let mut vm = Interpreter::new(&module, Budget::default());
    assert_eq!(vm.invoke("Add", &[3, 0]), Err(Fault::DivideByZero));
}

#[test]
fn argument_count_is_checked() {
    let module = common::calc_module();
    let mut vm = Interpreter::new(&module, Budget::default());
    assert!(matches!(
        vm.invoke("Add", &[1]),
        Err(Fault::ArgumentCount { expected: 2, actual: 1, .. })
    ));
    assert_eq!(vm.invoke("Extern", &[]), Err(Fault::NoBody("Extern".into())));
    assert_eq!(vm.invoke("Nope", &[]), Err(Fault::UnknownMethod("Nope".into())));
}

#[test]
fn step_limit_cancels_infinite_loop() {
    let module = looping_module();
    let mut vm = Interpreter::new(
        &module,
        Budget {
            deadline: None,
            max_steps: Some(10_000),
        },
    );
    assert_eq!(vm.invoke("Spin", &[]), Err(Fault::Cancelled));
    assert!(vm.steps() > 10_000);
}

#[test]
fn deadline_cancels_infinite_loop() {
    let module = looping_module();
    let started = Instant::now();
    let mut vm = Interpreter::new(
        &module,
        Budget {
            deadline: Some(started + Duration::from_millis(50)),
            max_steps: None,
        },
    );
    assert_eq!(vm.invoke("Spin", &[]), Err(Fault::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn unbounded_recursion_hits_depth_limit() {
    let module = Module {
        name: "Rec".into(),
        fields: vec![],
        methods: vec![Method {
            name: "Forever".into(),
            parameters: vec![],
            returns: Some("int64".into()),
            body: Some(MethodBody {
                locals: vec![],
                instructions: vec![
                    Instruction::new(0, OpCode::Call, Operand::Method("Forever".into())),
                    Instruction::new(5, OpCode::Ret, Operand::None),
                ],
            }),
        }],
    };
    let mut vm = Interpreter::new(&module, Budget::default());
    assert_eq!(vm.invoke("Forever", &[]), Err(Fault::CallDepth));
}
