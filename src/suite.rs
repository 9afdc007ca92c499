//! Test suites: the declarative test "assembly" run against a module, and
//! resolution of which tests exercise a given method.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bytecode::{LoadError, Module, OpCode, Operand};
use crate::interpreter::{Fault, Interpreter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    pub call: String,
    #[serde(default)]
    pub args: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub throws: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Methods this test declares it exercises. Empty means "derive from calls".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covers: Vec<String>,
    pub steps: Vec<TestStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    /// Module under test, relative to the suite file.
    pub module: String,
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    Cancelled,
}

impl TestSuite {
    pub fn load(path: &Path) -> Result<TestSuite, LoadError> {
        let data = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// The module reference as a path that cannot leave the suite directory.
    pub fn module_rel(&self) -> Result<PathBuf, LoadError> {
        let rel = PathBuf::from(&self.module);
        let escapes = rel.components().any(|c| {
            matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
        });
        if escapes || self.module.is_empty() {
            return Err(LoadError::InvalidModulePath(self.module.clone()));
        }
        Ok(rel)
    }

    pub fn module_path(&self, suite_path: &Path) -> Result<PathBuf, LoadError> {
        let rel = self.module_rel()?;
        Ok(match suite_path.parent() {
            Some(dir) => dir.join(rel),
            None => rel,
        })
    }

    pub fn test(&self, name: &str) -> Option<&TestCase> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Names of the tests that exercise `method`, in suite order.
    pub fn resolve_tests(&self, module: &Module, method: &str) -> Vec<String> {
        self.tests
            .iter()
            .filter(|t| t.exercises(module, method))
            .map(|t| t.name.clone())
            .collect()
    }
}

impl TestCase {
    /// Declared coverage wins; otherwise anything reachable from the steps.
    pub fn exercises(&self, module: &Module, method: &str) -> bool {
        if !self.covers.is_empty() {
            return self.covers.iter().any(|c| c == method);
        }
        reachable(module, self.steps.iter().map(|s| s.call.as_str())).contains(method)
    }

    pub fn run(&self, interpreter: &mut Interpreter<'_>) -> CaseOutcome {
        interpreter.reset_fields();
        for step in &self.steps {
            match (interpreter.invoke(&step.call, &step.args), step.throws) {
                (Err(Fault::Cancelled), _) => return CaseOutcome::Cancelled,
                (Err(_), true) => {}
                (Err(fault), false) => {
                    return CaseOutcome::Failed(format!("{}: {}", step.call, fault));
                }
                (Ok(value), true) => {
                    return CaseOutcome::Failed(format!(
                        "{}: expected a fault, returned {:?}",
                        step.call, value
                    ));
                }
                (Ok(value), false) => {
                    if let Some(expected) = step.expect {
                        if value != Some(expected) {
                            return CaseOutcome::Failed(format!(
                                "{}({:?}): expected {}, got {:?}",
                                step.call, step.args, expected, value
                            ));
                        }
                    }
                }
            }
        }
        CaseOutcome::Passed
    }
}

/// Transitive callees of `roots` through `call` instructions, roots included.
pub fn reachable<'a>(module: &Module, roots: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = roots.map(str::to_string).collect();
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let Some(body) = module.method(&name).and_then(|m| m.body.as_ref()) else {
            continue;
        };
        for instruction in &body.instructions {
            if let (OpCode::Call, Operand::Method(callee)) = instruction.canonical() {
                if !seen.contains(&callee) {
                    queue.push_back(callee);
                }
            }
        }
    }
    seen
}
