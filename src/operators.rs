/// Opcode replacement tables for the rotation strategies.
/// Each table lists one category; an opcode rotates to every other entry,
/// in declaration order.
use crate::bytecode::{OpCode, Operand};

pub const ARITHMETIC: &[OpCode] = &[
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Rem,
];

pub const BITWISE: &[OpCode] = &[OpCode::Or, OpCode::And, OpCode::Xor];

/// Other members of `table`, or nothing when `opcode` is not in it.
pub fn rotations(table: &[OpCode], opcode: OpCode) -> Vec<OpCode> {
    if !table.contains(&opcode) {
        return vec![];
    }
    table.iter().copied().filter(|op| *op != opcode).collect()
}

/// A branch rewrite: the replacement opcode, whether the original target
/// operand is kept, and whether a `pop` of the condition precedes it.
pub struct BranchOp {
    pub replacement: OpCode,
    pub keeps_target: bool,
    pub pops_condition: bool,
}

/// Opposite condition, always branch, never branch.
pub fn branch_rotations(opcode: OpCode) -> Vec<BranchOp> {
    let opposite = match opcode {
        OpCode::Brtrue => OpCode::Brfalse,
        OpCode::Brfalse => OpCode::Brtrue,
        _ => return vec![],
    };
    vec![
        BranchOp {
            replacement: opposite,
            keeps_target: true,
            pops_condition: false,
        },
        // br consumes nothing, so the condition is dropped first
        BranchOp {
            replacement: OpCode::Br,
            keeps_target: true,
            pops_condition: true,
        },
        // never branching still has to consume the condition
        BranchOp {
            replacement: OpCode::Pop,
            keeps_target: false,
            pops_condition: false,
        },
    ]
}

/// `a < b` becomes `!(a > b)` and `a > b` becomes `!(a < b)`. Returns the
/// opposite comparison and the instruction sequence negating it.
pub fn boundary_inversion(opcode: OpCode) -> Option<(OpCode, Vec<(OpCode, Operand)>)> {
    let opposite = match opcode {
        OpCode::Clt => OpCode::Cgt,
        OpCode::Cgt => OpCode::Clt,
        _ => return None,
    };
    Some((
        opposite,
        vec![
            (opposite, Operand::None),
            (OpCode::Ldc, Operand::Int(0)),
            (OpCode::Ceq, Operand::None),
        ],
    ))
}
