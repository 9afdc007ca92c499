//! Unified view over parameters, locals and static fields for the
//! substitution strategies, plus the compiler idioms they must not touch.

use std::collections::HashSet;

use crate::bytecode::{Instruction, Method, MethodBody, Module, OpCode, Operand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Parameter,
    Local,
    Field,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub kind: VariableKind,
    /// Parameter or local slot; position in the module's field list.
    pub index: usize,
    pub name: String,
    pub ty: String,
    /// Locals are only assigned if some store to them exists.
    pub assigned: bool,
}

impl Variable {
    pub fn read_op(&self) -> (OpCode, Operand) {
        match self.kind {
            VariableKind::Parameter => (OpCode::Ldarg, Operand::Arg(self.index as u16)),
            VariableKind::Local => (OpCode::Ldloc, Operand::Local(self.index as u16)),
            VariableKind::Field => (OpCode::Ldsfld, Operand::Field(self.name.clone())),
        }
    }

    pub fn write_op(&self) -> (OpCode, Operand) {
        match self.kind {
            VariableKind::Parameter => (OpCode::Starg, Operand::Arg(self.index as u16)),
            VariableKind::Local => (OpCode::Stloc, Operand::Local(self.index as u16)),
            VariableKind::Field => (OpCode::Stsfld, Operand::Field(self.name.clone())),
        }
    }
}

#[derive(Debug, Default)]
pub struct VariableTable {
    variables: Vec<Variable>,
    /// Locals holding a verbatim copy of a parameter.
    parameter_caches: HashSet<usize>,
    /// Locals whose value is handed to a `Dispose` call.
    disposal_locals: HashSet<usize>,
    /// Instruction indices of `ldloc` in a store-then-return sequence.
    return_loads: HashSet<usize>,
    dispose_calls: HashSet<usize>,
}

fn is_dispose_call(instruction: &Instruction) -> bool {
    let (opcode, operand) = instruction.canonical();
    matches!((opcode, operand), (OpCode::Call, Operand::Method(name)) if name.ends_with("Dispose"))
}

fn local_slot(instruction: &Instruction, opcode: OpCode) -> Option<usize> {
    match instruction.canonical() {
        (op, Operand::Local(slot)) if op == opcode => Some(slot as usize),
        _ => None,
    }
}

impl VariableTable {
    pub fn analyze(module: &Module, method: &Method) -> VariableTable {
        let Some(body) = &method.body else {
            return VariableTable::default();
        };
        let code = &body.instructions;

        let stored: HashSet<usize> = code
            .iter()
            .filter_map(|i| local_slot(i, OpCode::Stloc))
            .collect();

        let mut variables = Vec::new();
        for (index, p) in method.parameters.iter().enumerate() {
            variables.push(Variable {
                kind: VariableKind::Parameter,
                index,
                name: p.name.clone(),
                ty: p.ty.clone(),
                assigned: true,
            });
        }
        for (index, l) in body.locals.iter().enumerate() {
            variables.push(Variable {
                kind: VariableKind::Local,
                index,
                name: l.name.clone(),
                ty: l.ty.clone(),
                assigned: stored.contains(&index),
            });
        }
        for (index, f) in module.fields.iter().enumerate() {
            variables.push(Variable {
                kind: VariableKind::Field,
                index,
                name: f.name.clone(),
                ty: f.ty.clone(),
                assigned: true,
            });
        }

        let mut parameter_caches = HashSet::new();
        for window in code.windows(3) {
            let (OpCode::Ldarg, Operand::Arg(arg)) = window[0].canonical() else {
                continue;
            };
            let (Some(store), Some(load)) = (
                local_slot(&window[1], OpCode::Stloc),
                local_slot(&window[2], OpCode::Ldloc),
            ) else {
                continue;
            };
            let same_type = match (method.parameters.get(arg as usize), body.locals.get(store)) {
                (Some(p), Some(l)) => p.ty == l.ty,
                _ => false,
            };
            if store == load && same_type {
                parameter_caches.insert(store);
            }
        }

        let mut disposal_locals = HashSet::new();
        let mut dispose_calls = HashSet::new();
        for (i, instruction) in code.iter().enumerate() {
            if is_dispose_call(instruction) {
                dispose_calls.insert(i);
            }
            let Some(slot) = local_slot(instruction, OpCode::Ldloc) else {
                continue;
            };
            let direct = code.get(i + 1).is_some_and(is_dispose_call);
            let null_checked = code
                .get(i + 1)
                .is_some_and(|n| n.canonical().0 == OpCode::Brfalse)
                && code.get(i + 2).and_then(|n| local_slot(n, OpCode::Ldloc)) == Some(slot)
                && code.get(i + 3).is_some_and(is_dispose_call);
            if direct || null_checked {
                disposal_locals.insert(slot);
            }
        }

        let mut return_loads = HashSet::new();
        for (i, instruction) in code.iter().enumerate() {
            let Some(slot) = local_slot(instruction, OpCode::Ldloc) else {
                continue;
            };
            if !code.get(i + 1).is_some_and(|n| n.canonical().0 == OpCode::Ret) {
                continue;
            }
            let cached = code.iter().enumerate().any(|(k, store)| {
                if local_slot(store, OpCode::Stloc) != Some(slot) {
                    return false;
                }
                if k + 1 == i {
                    return true;
                }
                matches!(
                    code.get(k + 1).map(|n| n.canonical()),
                    Some((OpCode::Br, Operand::Target(t))) if t == instruction.offset
                )
            });
            if cached {
                return_loads.insert(i);
            }
        }

        VariableTable {
            variables,
            parameter_caches,
            disposal_locals,
            return_loads,
            dispose_calls,
        }
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn lookup(&self, kind: VariableKind, operand: &Operand) -> Option<&Variable> {
        self.variables.iter().find(|v| {
            v.kind == kind
                && match operand {
                    Operand::Arg(i) | Operand::Local(i) => v.index == *i as usize,
                    Operand::Field(name) => v.name == *name,
                    _ => false,
                }
        })
    }

    /// The variable read by the instruction at `index`, if it is a load.
    pub fn read_at(&self, body: &MethodBody, index: usize) -> Option<&Variable> {
        let (opcode, operand) = body.instructions.get(index)?.canonical();
        match opcode {
            OpCode::Ldarg => self.lookup(VariableKind::Parameter, &operand),
            OpCode::Ldloc => self.lookup(VariableKind::Local, &operand),
            OpCode::Ldsfld => self.lookup(VariableKind::Field, &operand),
            _ => None,
        }
    }

    /// The variable written by the instruction at `index`, if it is a store.
    pub fn write_at(&self, body: &MethodBody, index: usize) -> Option<&Variable> {
        let (opcode, operand) = body.instructions.get(index)?.canonical();
        match opcode {
            OpCode::Starg => self.lookup(VariableKind::Parameter, &operand),
            OpCode::Stloc => self.lookup(VariableKind::Local, &operand),
            OpCode::Stsfld => self.lookup(VariableKind::Field, &operand),
            _ => None,
        }
    }

    pub fn is_parameter_cache(&self, variable: &Variable) -> bool {
        variable.kind == VariableKind::Local && self.parameter_caches.contains(&variable.index)
    }

    pub fn is_disposal_local(&self, variable: &Variable) -> bool {
        variable.kind == VariableKind::Local && self.disposal_locals.contains(&variable.index)
    }

    /// Whether the access at `index` belongs to compiler-generated cleanup.
    pub fn is_disposal(&self, index: usize, variable: &Variable) -> bool {
        self.is_disposal_local(variable) || self.dispose_calls.contains(&(index + 1))
    }

    pub fn is_return_load(&self, index: usize) -> bool {
        self.return_loads.contains(&index)
    }

    /// Every other variable of the same declared type.
    pub fn same_type<'a>(
        &'a self,
        variable: &'a Variable,
    ) -> impl Iterator<Item = &'a Variable> + 'a {
        self.variables
            .iter()
            .filter(move |v| v.ty == variable.ty && *v != variable)
    }
}
