//! Instruction model: modules, methods and their instruction streams.
//!
//! Modules are stored as JSON documents. Instruction offsets are assigned at
//! disassembly time and never renumbered, so they stay usable as identities
//! for branch targets and report keys while a working copy is being edited.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Start line of a sequence point that the compiler marked as hidden.
pub const HIDDEN_LINE: u32 = 0x00FE_EFEE;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid module reference '{0}': must be a relative path inside the suite directory")]
    InvalidModulePath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    #[serde(rename = "nop")]
    Nop,
    #[serde(rename = "ldarg")]
    Ldarg,
    #[serde(rename = "ldarg.0")]
    Ldarg0,
    #[serde(rename = "ldarg.1")]
    Ldarg1,
    #[serde(rename = "ldarg.2")]
    Ldarg2,
    #[serde(rename = "ldarg.3")]
    Ldarg3,
    #[serde(rename = "ldarg.s")]
    LdargS,
    #[serde(rename = "starg")]
    Starg,
    #[serde(rename = "starg.s")]
    StargS,
    #[serde(rename = "ldloc")]
    Ldloc,
    #[serde(rename = "ldloc.0")]
    Ldloc0,
    #[serde(rename = "ldloc.1")]
    Ldloc1,
    #[serde(rename = "ldloc.2")]
    Ldloc2,
    #[serde(rename = "ldloc.3")]
    Ldloc3,
    #[serde(rename = "ldloc.s")]
    LdlocS,
    #[serde(rename = "stloc")]
    Stloc,
    #[serde(rename = "stloc.0")]
    Stloc0,
    #[serde(rename = "stloc.1")]
    Stloc1,
    #[serde(rename = "stloc.2")]
    Stloc2,
    #[serde(rename = "stloc.3")]
    Stloc3,
    #[serde(rename = "stloc.s")]
    StlocS,
    #[serde(rename = "ldsfld")]
    Ldsfld,
    #[serde(rename = "stsfld")]
    Stsfld,
    #[serde(rename = "ldc.i8")]
    Ldc,
    #[serde(rename = "ldc.i4.m1")]
    LdcM1,
    #[serde(rename = "ldc.i4.0")]
    Ldc0,
    #[serde(rename = "ldc.i4.1")]
    Ldc1,
    #[serde(rename = "ldc.i4.2")]
    Ldc2,
    #[serde(rename = "ldc.i4.3")]
    Ldc3,
    #[serde(rename = "ldc.i4.4")]
    Ldc4,
    #[serde(rename = "ldc.i4.5")]
    Ldc5,
    #[serde(rename = "ldc.i4.6")]
    Ldc6,
    #[serde(rename = "ldc.i4.7")]
    Ldc7,
    #[serde(rename = "ldc.i4.8")]
    Ldc8,
    #[serde(rename = "ldc.i4.s")]
    LdcS,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "sub")]
    Sub,
    #[serde(rename = "mul")]
    Mul,
    #[serde(rename = "div")]
    Div,
    #[serde(rename = "rem")]
    Rem,
    #[serde(rename = "and")]
    And,
    #[serde(rename = "or")]
    Or,
    #[serde(rename = "xor")]
    Xor,
    #[serde(rename = "ceq")]
    Ceq,
    #[serde(rename = "cgt")]
    Cgt,
    #[serde(rename = "clt")]
    Clt,
    #[serde(rename = "br")]
    Br,
    #[serde(rename = "br.s")]
    BrS,
    #[serde(rename = "brtrue")]
    Brtrue,
    #[serde(rename = "brtrue.s")]
    BrtrueS,
    #[serde(rename = "brfalse")]
    Brfalse,
    #[serde(rename = "brfalse.s")]
    BrfalseS,
    #[serde(rename = "dup")]
    Dup,
    #[serde(rename = "pop")]
    Pop,
    #[serde(rename = "call")]
    Call,
    #[serde(rename = "ret")]
    Ret,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Nop => "nop",
            OpCode::Ldarg => "ldarg",
            OpCode::Ldarg0 => "ldarg.0",
            OpCode::Ldarg1 => "ldarg.1",
            OpCode::Ldarg2 => "ldarg.2",
            OpCode::Ldarg3 => "ldarg.3",
            OpCode::LdargS => "ldarg.s",
            OpCode::Starg => "starg",
            OpCode::StargS => "starg.s",
            OpCode::Ldloc => "ldloc",
            OpCode::Ldloc0 => "ldloc.0",
            OpCode::Ldloc1 => "ldloc.1",
            OpCode::Ldloc2 => "ldloc.2",
            OpCode::Ldloc3 => "ldloc.3",
            OpCode::LdlocS => "ldloc.s",
            OpCode::Stloc => "stloc",
            OpCode::Stloc0 => "stloc.0",
            OpCode::Stloc1 => "stloc.1",
            OpCode::Stloc2 => "stloc.2",
            OpCode::Stloc3 => "stloc.3",
            OpCode::StlocS => "stloc.s",
            OpCode::Ldsfld => "ldsfld",
            OpCode::Stsfld => "stsfld",
            OpCode::Ldc => "ldc.i8",
            OpCode::LdcM1 => "ldc.i4.m1",
            OpCode::Ldc0 => "ldc.i4.0",
            OpCode::Ldc1 => "ldc.i4.1",
            OpCode::Ldc2 => "ldc.i4.2",
            OpCode::Ldc3 => "ldc.i4.3",
            OpCode::Ldc4 => "ldc.i4.4",
            OpCode::Ldc5 => "ldc.i4.5",
            OpCode::Ldc6 => "ldc.i4.6",
            OpCode::Ldc7 => "ldc.i4.7",
            OpCode::Ldc8 => "ldc.i4.8",
            OpCode::LdcS => "ldc.i4.s",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Rem => "rem",
            OpCode::And => "and",
            OpCode::Or => "or",
            OpCode::Xor => "xor",
            OpCode::Ceq => "ceq",
            OpCode::Cgt => "cgt",
            OpCode::Clt => "clt",
            OpCode::Br => "br",
            OpCode::BrS => "br.s",
            OpCode::Brtrue => "brtrue",
            OpCode::BrtrueS => "brtrue.s",
            OpCode::Brfalse => "brfalse",
            OpCode::BrfalseS => "brfalse.s",
            OpCode::Dup => "dup",
            OpCode::Pop => "pop",
            OpCode::Call => "call",
            OpCode::Ret => "ret",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    #[default]
    None,
    Int(i64),
    Arg(u16),
    Local(u16),
    Field(String),
    Target(u32),
    Method(String),
}

impl Operand {
    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int(v) => write!(f, "{}", v),
            Operand::Arg(i) => write!(f, "A_{}", i),
            Operand::Local(i) => write!(f, "V_{}", i),
            Operand::Field(name) => f.write_str(name),
            Operand::Target(offset) => write!(f, "IL_{:04x}", offset),
            Operand::Method(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequencePoint {
    pub document: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SequencePoint {
    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_LINE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: OpCode,
    #[serde(default, skip_serializing_if = "Operand::is_none")]
    pub operand: Operand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_point: Option<SequencePoint>,
}

impl Instruction {
    pub fn new(offset: u32, opcode: OpCode, operand: Operand) -> Self {
        Instruction {
            offset,
            opcode,
            operand,
            sequence_point: None,
        }
    }

    /// Same position and source mapping, different operation.
    pub fn replaced(&self, opcode: OpCode, operand: Operand) -> Self {
        Instruction {
            offset: self.offset,
            opcode,
            operand,
            sequence_point: self.sequence_point.clone(),
        }
    }

    /// The explicit form of a short or implicit-operand opcode.
    pub fn canonical(&self) -> (OpCode, Operand) {
        let op = &self.operand;
        match self.opcode {
            OpCode::Ldarg0 => (OpCode::Ldarg, Operand::Arg(0)),
            OpCode::Ldarg1 => (OpCode::Ldarg, Operand::Arg(1)),
            OpCode::Ldarg2 => (OpCode::Ldarg, Operand::Arg(2)),
            OpCode::Ldarg3 => (OpCode::Ldarg, Operand::Arg(3)),
            OpCode::LdargS => (OpCode::Ldarg, op.clone()),
            OpCode::StargS => (OpCode::Starg, op.clone()),
            OpCode::Ldloc0 => (OpCode::Ldloc, Operand::Local(0)),
            OpCode::Ldloc1 => (OpCode::Ldloc, Operand::Local(1)),
            OpCode::Ldloc2 => (OpCode::Ldloc, Operand::Local(2)),
            OpCode::Ldloc3 => (OpCode::Ldloc, Operand::Local(3)),
            OpCode::LdlocS => (OpCode::Ldloc, op.clone()),
            OpCode::Stloc0 => (OpCode::Stloc, Operand::Local(0)),
            OpCode::Stloc1 => (OpCode::Stloc, Operand::Local(1)),
            OpCode::Stloc2 => (OpCode::Stloc, Operand::Local(2)),
            OpCode::Stloc3 => (OpCode::Stloc, Operand::Local(3)),
            OpCode::StlocS => (OpCode::Stloc, op.clone()),
            OpCode::LdcM1 => (OpCode::Ldc, Operand::Int(-1)),
            OpCode::Ldc0 => (OpCode::Ldc, Operand::Int(0)),
            OpCode::Ldc1 => (OpCode::Ldc, Operand::Int(1)),
            OpCode::Ldc2 => (OpCode::Ldc, Operand::Int(2)),
            OpCode::Ldc3 => (OpCode::Ldc, Operand::Int(3)),
            OpCode::Ldc4 => (OpCode::Ldc, Operand::Int(4)),
            OpCode::Ldc5 => (OpCode::Ldc, Operand::Int(5)),
            OpCode::Ldc6 => (OpCode::Ldc, Operand::Int(6)),
            OpCode::Ldc7 => (OpCode::Ldc, Operand::Int(7)),
            OpCode::Ldc8 => (OpCode::Ldc, Operand::Int(8)),
            OpCode::LdcS => (OpCode::Ldc, op.clone()),
            OpCode::BrS => (OpCode::Br, op.clone()),
            OpCode::BrtrueS => (OpCode::Brtrue, op.clone()),
            OpCode::BrfalseS => (OpCode::Brfalse, op.clone()),
            other => (other, op.clone()),
        }
    }

    /// Values popped and pushed, in that order. Calls need the module to
    /// look up the callee's signature.
    pub fn stack_effect(&self, module: &Module) -> (usize, usize) {
        let (opcode, operand) = self.canonical();
        match opcode {
            OpCode::Nop | OpCode::Br => (0, 0),
            OpCode::Ldarg | OpCode::Ldloc | OpCode::Ldsfld | OpCode::Ldc => (0, 1),
            OpCode::Starg | OpCode::Stloc | OpCode::Stsfld | OpCode::Pop => (1, 0),
            OpCode::Brtrue | OpCode::Brfalse => (1, 0),
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Rem
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Ceq
            | OpCode::Cgt
            | OpCode::Clt => (2, 1),
            OpCode::Dup => (1, 2),
            OpCode::Ret => (1, 0),
            OpCode::Call => match &operand {
                Operand::Method(name) => match module.method(name) {
                    Some(m) => (m.parameters.len(), usize::from(m.returns.is_some())),
                    None => (0, 0),
                },
                _ => (0, 0),
            },
            _ => (0, 0),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode)?;
        if !self.operand.is_none() {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDef {
    pub name: String,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: String,
    #[serde(default)]
    pub initial: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBody {
    #[serde(default)]
    pub locals: Vec<LocalDef>,
    pub instructions: Vec<Instruction>,
}

impl MethodBody {
    /// Rewrite every short or implicit-operand form into its explicit one.
    /// Returns how many instructions changed.
    pub fn simplify(&mut self) -> usize {
        let mut changed = 0;
        for instruction in &mut self.instructions {
            let (opcode, operand) = instruction.canonical();
            if opcode != instruction.opcode || operand != instruction.operand {
                instruction.opcode = opcode;
                instruction.operand = operand;
                changed += 1;
            }
        }
        changed
    }

    /// First instruction carrying `offset`. Synthesized instructions share
    /// the offset of the instruction they replaced, so the first one wins.
    pub fn index_of_offset(&self, offset: u32) -> Option<usize> {
        self.instructions.iter().position(|i| i.offset == offset)
    }

    pub fn offset_map(&self) -> HashMap<u32, usize> {
        let mut map = HashMap::with_capacity(self.instructions.len());
        for (index, instruction) in self.instructions.iter().enumerate() {
            map.entry(instruction.offset).or_insert(index);
        }
        map
    }

    pub fn has_symbols(&self) -> bool {
        self.instructions.iter().any(|i| i.sequence_point.is_some())
    }

    /// The visible sequence point covering the instruction at `index`.
    pub fn sequence_point_for(&self, index: usize) -> Option<&SequencePoint> {
        let end = index.min(self.instructions.len().checked_sub(1)?);
        self.instructions[..=end]
            .iter()
            .rev()
            .find_map(|i| i.sequence_point.as_ref())
            .filter(|sp| !sp.is_hidden())
    }

    pub fn listing(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MethodBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    pub methods: Vec<Method>,
}

impl Module {
    /// Read a module. Without symbols every sequence point is dropped, the
    /// same as loading an assembly without its debug information.
    pub fn load(path: &Path, with_symbols: bool) -> Result<Module, LoadError> {
        let data = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut module: Module =
            serde_json::from_str(&data).map_err(|source| LoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if !with_symbols {
            module.strip_symbols();
        }
        Ok(module)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn strip_symbols(&mut self) {
        for method in &mut self.methods {
            if let Some(body) = &mut method.body {
                for instruction in &mut body.instructions {
                    instruction.sequence_point = None;
                }
            }
        }
    }

    /// Normalize all method bodies before mutation.
    pub fn simplify(&mut self) {
        for method in &mut self.methods {
            if let Some(body) = &mut method.body {
                body.simplify();
            }
        }
    }

    /// Names of methods with a body, in declaration order.
    pub fn mutable_methods(&self) -> Vec<String> {
        self.methods
            .iter()
            .filter(|m| m.body.is_some())
            .map(|m| m.name.clone())
            .collect()
    }
}
