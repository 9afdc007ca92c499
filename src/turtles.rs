//! Mutation strategies ("turtles") and the lazy mutant stream that drives them.
//!
//! A strategy only proposes [`Edit`]s for one instruction at a time, looking
//! at the unmodified body. [`MutantStream`] owns the cursor: it applies one
//! edit, materializes the module, hands out the [`Mutant`], and undoes the
//! edit before it looks at anything else.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::{Instruction, Method, MethodBody, Module, OpCode, Operand};
use crate::copy_tree::Materializer;
use crate::mutants::{Mutant, generate_diff};
use crate::operators;
use crate::variables::VariableTable;

#[derive(Debug, Error)]
#[error("failed to materialize mutant '{description}': {source}")]
pub struct MaterializeError {
    pub description: String,
    #[source]
    pub source: std::io::Error,
}

/// Splice replacing `remove` instructions at `index` with `insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub index: usize,
    pub remove: usize,
    pub insert: Vec<Instruction>,
    pub description: String,
}

impl Edit {
    pub fn replace(index: usize, instruction: Instruction, description: String) -> Self {
        Edit {
            index,
            remove: 1,
            insert: vec![instruction],
            description,
        }
    }
}

/// Read-only view of the method being mutated, in its original state.
pub struct MethodContext<'a> {
    pub module: &'a Module,
    pub method: &'a Method,
    pub body: &'a MethodBody,
    pub variables: &'a VariableTable,
}

pub trait MutationStrategy: Send + Sync {
    /// Category text used to group mutants in reports.
    fn description(&self) -> &'static str;

    /// Candidate edits anchored at instruction `index`.
    fn edits_at(&self, cx: &MethodContext<'_>, index: usize) -> Vec<Edit>;
}

impl<'s> dyn MutationStrategy + 's {
    /// Lazily enumerate mutants of `method`. `None` when the method does not
    /// exist or has no body.
    pub fn mutate<'a>(
        &'a self,
        module: &'a mut Module,
        method: &str,
        materializer: &'a Materializer,
    ) -> Option<MutantStream<'a>>
    where
        's: 'a,
    {
        let method_index = module.method_index(method)?;
        let target = &module.methods[method_index];
        let body = target.body.as_ref()?;
        let variables = VariableTable::analyze(module, target);
        let original_listing = body.listing();
        let len = body.instructions.len();
        Some(MutantStream {
            strategy: self,
            module,
            method_index,
            variables,
            materializer,
            original_listing,
            cursor: 0,
            len,
            pending: VecDeque::new(),
            applied: None,
            failed: false,
        })
    }
}

struct Applied {
    index: usize,
    inserted: usize,
    removed: Vec<Instruction>,
}

/// Forward-only stream of mutants. The method body is restored before each
/// step and when the stream is dropped, finished or not.
pub struct MutantStream<'a> {
    strategy: &'a dyn MutationStrategy,
    module: &'a mut Module,
    method_index: usize,
    variables: VariableTable,
    materializer: &'a Materializer,
    original_listing: String,
    cursor: usize,
    len: usize,
    pending: VecDeque<Edit>,
    applied: Option<Applied>,
    failed: bool,
}

impl MutantStream<'_> {
    fn revert(&mut self) {
        let Some(applied) = self.applied.take() else {
            return;
        };
        if let Some(body) = self.module.methods[self.method_index].body.as_mut() {
            body.instructions
                .splice(applied.index..applied.index + applied.inserted, applied.removed);
        }
    }

    fn apply(&mut self, edit: Edit) -> Option<Result<Mutant, MaterializeError>> {
        let method = &mut self.module.methods[self.method_index];
        let method_name = method.name.clone();
        let body = method.body.as_mut()?;
        if edit.index + edit.remove > body.instructions.len() {
            return None;
        }
        let offset = body.instructions[edit.index].offset;
        let sequence_point = body.sequence_point_for(edit.index).cloned();
        let inserted = edit.insert.len();
        let removed: Vec<Instruction> = body
            .instructions
            .splice(edit.index..edit.index + edit.remove, edit.insert)
            .collect();
        self.applied = Some(Applied {
            index: edit.index,
            inserted,
            removed,
        });
        let diff = generate_diff(&self.original_listing, &body.listing());

        log::debug!("{}: {}", method_name, edit.description);
        Some(match self.materializer.materialize(&*self.module) {
            Ok(scratch) => Ok(Mutant {
                method: method_name,
                description: edit.description,
                generic_description: self.strategy.description(),
                offset,
                sequence_point,
                diff,
                scratch,
            }),
            Err(source) => {
                self.failed = true;
                Err(MaterializeError {
                    description: edit.description,
                    source,
                })
            }
        })
    }
}

impl Iterator for MutantStream<'_> {
    type Item = Result<Mutant, MaterializeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.revert();
        if self.failed {
            return None;
        }
        loop {
            if let Some(edit) = self.pending.pop_front() {
                match self.apply(edit) {
                    Some(item) => return Some(item),
                    None => continue,
                }
            }
            if self.cursor >= self.len {
                return None;
            }
            let index = self.cursor;
            self.cursor += 1;

            let module: &Module = &*self.module;
            let method = &module.methods[self.method_index];
            let body = method.body.as_ref()?;
            let cx = MethodContext {
                module,
                method,
                body,
                variables: &self.variables,
            };
            self.pending.extend(self.strategy.edits_at(&cx, index));
        }
    }
}

impl Drop for MutantStream<'_> {
    fn drop(&mut self) {
        self.revert();
    }
}

/// Rotates an opcode through the other members of its category table.
pub struct OperatorRotation {
    description: &'static str,
    table: &'static [OpCode],
}

impl OperatorRotation {
    pub const ARITHMETIC: &'static str = "Arithmetic operator rotation";
    pub const BITWISE: &'static str = "Bitwise operator rotation";

    pub fn new(description: &'static str, table: &'static [OpCode]) -> Self {
        OperatorRotation { description, table }
    }

    pub fn arithmetic() -> Self {
        Self::new(Self::ARITHMETIC, operators::ARITHMETIC)
    }

    pub fn bitwise() -> Self {
        Self::new(Self::BITWISE, operators::BITWISE)
    }
}

impl MutationStrategy for OperatorRotation {
    fn description(&self) -> &'static str {
        self.description
    }

    fn edits_at(&self, cx: &MethodContext<'_>, index: usize) -> Vec<Edit> {
        let instruction = &cx.body.instructions[index];
        operators::rotations(self.table, instruction.opcode)
            .into_iter()
            .map(|to| {
                Edit::replace(
                    index,
                    instruction.replaced(to, Operand::None),
                    format!("{:04x}: {} => {}", instruction.offset, instruction.opcode, to),
                )
            })
            .collect()
    }
}

pub struct BranchConditionRotation;

impl BranchConditionRotation {
    pub const DESCRIPTION: &'static str = "Branch condition rotation";
}

impl MutationStrategy for BranchConditionRotation {
    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    fn edits_at(&self, cx: &MethodContext<'_>, index: usize) -> Vec<Edit> {
        let instruction = &cx.body.instructions[index];
        let (opcode, operand) = instruction.canonical();
        operators::branch_rotations(opcode)
            .into_iter()
            .map(|op| {
                let operand = if op.keeps_target { operand.clone() } else { Operand::None };
                let insert = if op.pops_condition {
                    vec![
                        instruction.replaced(OpCode::Pop, Operand::None),
                        Instruction::new(instruction.offset, op.replacement, operand),
                    ]
                } else {
                    vec![instruction.replaced(op.replacement, operand)]
                };
                Edit {
                    index,
                    remove: 1,
                    insert,
                    description: format!(
                        "{:04x}: {} => {}",
                        instruction.offset, opcode, op.replacement
                    ),
                }
            })
            .collect()
    }
}

pub struct ConditionalBoundary;

impl ConditionalBoundary {
    pub const DESCRIPTION: &'static str = "Conditional boundary";
}

impl MutationStrategy for ConditionalBoundary {
    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    fn edits_at(&self, cx: &MethodContext<'_>, index: usize) -> Vec<Edit> {
        let instruction = &cx.body.instructions[index];
        let Some((opposite, sequence)) = operators::boundary_inversion(instruction.opcode) else {
            return vec![];
        };
        let insert = sequence
            .into_iter()
            .enumerate()
            .map(|(i, (opcode, operand))| {
                if i == 0 {
                    instruction.replaced(opcode, operand)
                } else {
                    Instruction::new(instruction.offset, opcode, operand)
                }
            })
            .collect();
        vec![Edit {
            index,
            remove: 1,
            insert,
            description: format!(
                "{:04x}: {} => not {}",
                instruction.offset, instruction.opcode, opposite
            ),
        }]
    }
}

/// Blanks out every instruction attributed to one source line.
pub struct SequencePointDeletion;

impl SequencePointDeletion {
    pub const DESCRIPTION: &'static str = "Sequence point deletion";
}

impl MutationStrategy for SequencePointDeletion {
    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    fn edits_at(&self, cx: &MethodContext<'_>, index: usize) -> Vec<Edit> {
        let code = &cx.body.instructions;
        let Some(sp) = &code[index].sequence_point else {
            return vec![];
        };
        if sp.is_hidden() {
            return vec![];
        }
        let end = code[index + 1..]
            .iter()
            .position(|i| i.sequence_point.is_some())
            .map(|p| index + 1 + p)
            .unwrap_or(code.len());
        let group = &code[index..end];

        if group.iter().all(|i| i.opcode == OpCode::Nop) {
            return vec![];
        }
        // Removing the line must leave the evaluation stack as it was.
        let mut depth: isize = 0;
        for instruction in group {
            if instruction.canonical().0 == OpCode::Ret {
                return vec![];
            }
            let (pops, pushes) = instruction.stack_effect(cx.module);
            depth -= pops as isize;
            if depth < 0 {
                return vec![];
            }
            depth += pushes as isize;
        }
        if depth != 0 {
            return vec![];
        }

        let first = group[0].offset;
        let last = group[group.len() - 1].offset;
        vec![Edit {
            index,
            remove: group.len(),
            insert: group.iter().map(|i| i.replaced(OpCode::Nop, Operand::None)).collect(),
            description: format!("{:04x}-{:04x}: delete line {}", first, last, sp.start_line),
        }]
    }
}

pub struct VariableReadSubstitution;

impl VariableReadSubstitution {
    pub const DESCRIPTION: &'static str = "Variable read substitution";
}

impl MutationStrategy for VariableReadSubstitution {
    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    fn edits_at(&self, cx: &MethodContext<'_>, index: usize) -> Vec<Edit> {
        let vars = cx.variables;
        let Some(variable) = vars.read_at(cx.body, index) else {
            return vec![];
        };
        if vars.is_parameter_cache(variable)
            || vars.is_disposal(index, variable)
            || vars.is_return_load(index)
        {
            return vec![];
        }
        let instruction = &cx.body.instructions[index];
        vars.same_type(variable)
            .filter(|target| target.assigned && !vars.is_parameter_cache(target))
            .map(|target| {
                let (opcode, operand) = target.read_op();
                Edit::replace(
                    index,
                    instruction.replaced(opcode, operand),
                    format!(
                        "{:04x}: read substitution {}.{} => {}.{}",
                        instruction.offset, variable.ty, variable.name, target.ty, target.name
                    ),
                )
            })
            .collect()
    }
}

pub struct VariableWriteSubstitution;

impl VariableWriteSubstitution {
    pub const DESCRIPTION: &'static str = "Variable write substitution";
}

impl MutationStrategy for VariableWriteSubstitution {
    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    fn edits_at(&self, cx: &MethodContext<'_>, index: usize) -> Vec<Edit> {
        let vars = cx.variables;
        let Some(variable) = vars.write_at(cx.body, index) else {
            return vec![];
        };
        if vars.is_disposal(index, variable) {
            return vec![];
        }
        let target = vars
            .same_type(variable)
            .find(|t| !vars.is_disposal_local(t));
        let Some(target) = target else {
            return vec![];
        };
        let instruction = &cx.body.instructions[index];
        let (opcode, operand) = target.write_op();
        vec![Edit::replace(
            index,
            instruction.replaced(opcode, operand),
            format!(
                "{:04x}: write substitution {}.{} => {}.{}",
                instruction.offset, variable.ty, variable.name, target.ty, target.name
            ),
        )]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TurtleKind {
    Arithmetic,
    Bitwise,
    Branch,
    Boundary,
    SequencePoint,
    VariableRead,
    VariableWrite,
}

impl TurtleKind {
    pub const ALL: [TurtleKind; 7] = [
        TurtleKind::Arithmetic,
        TurtleKind::Bitwise,
        TurtleKind::Branch,
        TurtleKind::Boundary,
        TurtleKind::SequencePoint,
        TurtleKind::VariableRead,
        TurtleKind::VariableWrite,
    ];

    pub fn strategy(self) -> Box<dyn MutationStrategy> {
        match self {
            TurtleKind::Arithmetic => Box::new(OperatorRotation::arithmetic()),
            TurtleKind::Bitwise => Box::new(OperatorRotation::bitwise()),
            TurtleKind::Branch => Box::new(BranchConditionRotation),
            TurtleKind::Boundary => Box::new(ConditionalBoundary),
            TurtleKind::SequencePoint => Box::new(SequencePointDeletion),
            TurtleKind::VariableRead => Box::new(VariableReadSubstitution),
            TurtleKind::VariableWrite => Box::new(VariableWriteSubstitution),
        }
    }
}
