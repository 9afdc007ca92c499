//! Stack machine that executes module methods for the test adapter.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use thiserror::Error;

use crate::bytecode::{Method, MethodBody, Module, OpCode, Operand};

const MAX_CALL_DEPTH: usize = 256;
// Deadline is only checked every this many steps.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("division by zero")]
    DivideByZero,
    #[error("arithmetic overflow")]
    Overflow,
    #[error("evaluation stack underflow in {0}")]
    StackUnderflow(String),
    #[error("unknown method {0}")]
    UnknownMethod(String),
    #[error("method {0} has no body")]
    NoBody(String),
    #[error("method {method} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },
    #[error("unknown field {0}")]
    UnknownField(String),
    #[error("branch to missing offset IL_{0:04x}")]
    BadTarget(u32),
    #[error("bad operand {operand:?} for {opcode}")]
    BadOperand { opcode: OpCode, operand: Operand },
    #[error("execution ran past the end of {0}")]
    FellOffEnd(String),
    #[error("call depth exceeded")]
    CallDepth,
    #[error("execution cancelled")]
    Cancelled,
}

/// Limits under which a run is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    pub deadline: Option<Instant>,
    pub max_steps: Option<u64>,
}

pub struct Interpreter<'m> {
    module: &'m Module,
    offsets: Rc<HashMap<&'m str, HashMap<u32, usize>>>,
    fields: HashMap<String, i64>,
    budget: Budget,
    steps: u64,
    depth: usize,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module, budget: Budget) -> Self {
        let offsets = module
            .methods
            .iter()
            .filter_map(|m| m.body.as_ref().map(|b| (m.name.as_str(), b.offset_map())))
            .collect::<HashMap<_, _>>();
        let mut interpreter = Interpreter {
            module,
            offsets: Rc::new(offsets),
            fields: HashMap::new(),
            budget,
            steps: 0,
            depth: 0,
        };
        interpreter.reset_fields();
        interpreter
    }

    /// Restore every static field to its declared initial value.
    pub fn reset_fields(&mut self) {
        self.fields = self
            .module
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.initial))
            .collect();
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn invoke(&mut self, name: &str, args: &[i64]) -> Result<Option<i64>, Fault> {
        let module = self.module;
        let method = module
            .method(name)
            .ok_or_else(|| Fault::UnknownMethod(name.to_string()))?;
        if method.parameters.len() != args.len() {
            return Err(Fault::ArgumentCount {
                method: name.to_string(),
                expected: method.parameters.len(),
                actual: args.len(),
            });
        }
        let body = method
            .body
            .as_ref()
            .ok_or_else(|| Fault::NoBody(name.to_string()))?;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Fault::CallDepth);
        }
        self.depth += 1;
        let result = self.execute(method, body, args);
        self.depth -= 1;
        result
    }

    fn execute(
        &mut self,
        method: &'m Method,
        body: &'m MethodBody,
        args: &[i64],
    ) -> Result<Option<i64>, Fault> {
        let module = self.module;
        let offsets = Rc::clone(&self.offsets);
        let offsets = offsets
            .get(method.name.as_str())
            .ok_or_else(|| Fault::NoBody(method.name.clone()))?;
        let name = method.name.as_str();
        let underflow = || Fault::StackUnderflow(name.to_string());

        let mut arguments = args.to_vec();
        let mut locals = vec![0i64; body.locals.len()];
        let mut stack: Vec<i64> = Vec::new();
        let mut pc = 0usize;

        loop {
            self.tick()?;
            let instruction = body
                .instructions
                .get(pc)
                .ok_or_else(|| Fault::FellOffEnd(name.to_string()))?;
            let (opcode, operand) = instruction.canonical();
            pc += 1;
            match (opcode, &operand) {
                (OpCode::Nop, _) => {}
                (OpCode::Ldarg, Operand::Arg(i)) => {
                    let v = *arguments.get(*i as usize).ok_or_else(|| bad(opcode, &operand))?;
                    stack.push(v);
                }
                (OpCode::Starg, Operand::Arg(i)) => {
                    let v = stack.pop().ok_or_else(underflow)?;
                    let slot = arguments.get_mut(*i as usize).ok_or_else(|| bad(opcode, &operand))?;
                    *slot = v;
                }
                (OpCode::Ldloc, Operand::Local(i)) => {
                    let v = *locals.get(*i as usize).ok_or_else(|| bad(opcode, &operand))?;
                    stack.push(v);
                }
                (OpCode::Stloc, Operand::Local(i)) => {
                    let v = stack.pop().ok_or_else(underflow)?;
                    let slot = locals.get_mut(*i as usize).ok_or_else(|| bad(opcode, &operand))?;
                    *slot = v;
                }
                (OpCode::Ldsfld, Operand::Field(f)) => {
                    let v = *self
                        .fields
                        .get(f)
                        .ok_or_else(|| Fault::UnknownField(f.clone()))?;
                    stack.push(v);
                }
                (OpCode::Stsfld, Operand::Field(f)) => {
                    let v = stack.pop().ok_or_else(underflow)?;
                    let slot = self
                        .fields
                        .get_mut(f)
                        .ok_or_else(|| Fault::UnknownField(f.clone()))?;
                    *slot = v;
                }
                (OpCode::Ldc, Operand::Int(v)) => stack.push(*v),
                (
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
                    | OpCode::Clt,
                    _,
                ) => {
                    let b = stack.pop().ok_or_else(underflow)?;
                    let a = stack.pop().ok_or_else(underflow)?;
                    stack.push(binary(opcode, a, b)?);
                }
                (OpCode::Br, Operand::Target(t)) => {
                    pc = *offsets.get(t).ok_or(Fault::BadTarget(*t))?;
                }
                (OpCode::Brtrue | OpCode::Brfalse, Operand::Target(t)) => {
                    let v = stack.pop().ok_or_else(underflow)?;
                    if (v != 0) == (opcode == OpCode::Brtrue) {
                        pc = *offsets.get(t).ok_or(Fault::BadTarget(*t))?;
                    }
                }
                (OpCode::Dup, _) => {
                    let v = *stack.last().ok_or_else(underflow)?;
                    stack.push(v);
                }
                (OpCode::Pop, _) => {
                    stack.pop().ok_or_else(underflow)?;
                }
                (OpCode::Call, Operand::Method(callee)) => {
                    let arity = module
                        .method(callee)
                        .map(|m| m.parameters.len())
                        .ok_or_else(|| Fault::UnknownMethod(callee.clone()))?;
                    if stack.len() < arity {
                        return Err(underflow());
                    }
                    let call_args = stack.split_off(stack.len() - arity);
                    if let Some(v) = self.invoke(callee, &call_args)? {
                        stack.push(v);
                    }
                }
                (OpCode::Ret, _) => {
                    return if method.returns.is_some() {
                        stack.pop().map(Some).ok_or_else(underflow)
                    } else {
                        Ok(None)
                    };
                }
                _ => return Err(bad(opcode, &operand)),
            }
        }
    }

    fn tick(&mut self) -> Result<(), Fault> {
        self.steps += 1;
        if let Some(max) = self.budget.max_steps {
            if self.steps > max {
                return Err(Fault::Cancelled);
            }
        }
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.budget.deadline {
                if Instant::now() >= deadline {
                    return Err(Fault::Cancelled);
                }
            }
        }
        Ok(())
    }
}

fn bad(opcode: OpCode, operand: &Operand) -> Fault {
    Fault::BadOperand {
        opcode,
        operand: operand.clone(),
    }
}

fn binary(opcode: OpCode, a: i64, b: i64) -> Result<i64, Fault> {
    Ok(match opcode {
        OpCode::Add => a.wrapping_add(b),
        OpCode::Sub => a.wrapping_sub(b),
        OpCode::Mul => a.wrapping_mul(b),
        OpCode::Div => {
            if b == 0 {
                return Err(Fault::DivideByZero);
            }
            a.checked_div(b).ok_or(Fault::Overflow)?
        }
        OpCode::Rem => {
            if b == 0 {
                return Err(Fault::DivideByZero);
            }
            a.checked_rem(b).ok_or(Fault::Overflow)?
        }
        OpCode::And => a & b,
        OpCode::Or => a | b,
        OpCode::Xor => a ^ b,
        OpCode::Ceq => i64::from(a == b),
        OpCode::Cgt => i64::from(a > b),
        OpCode::Clt => i64::from(a < b),
        _ => {
            return Err(Fault::BadOperand {
                opcode,
                operand: Operand::None,
            });
        }
    })
}
