use serde::{Deserialize, Serialize};

use crate::bytecode::SequencePoint;
use crate::copy_tree::ScratchCopy;

/// One candidate change, materialized on disk until its verdict is in.
#[derive(Debug)]
pub struct Mutant {
    pub method: String,
    pub description: String,
    pub generic_description: &'static str,
    pub offset: u32,
    pub sequence_point: Option<SequencePoint>,
    pub diff: String,
    pub scratch: ScratchCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutantStatus {
    Killed,
    Survived,
    Timeout,
}

impl MutantStatus {
    pub fn from_verdict(tests_pass: bool, exited_in_time: bool) -> Self {
        if !exited_in_time {
            MutantStatus::Timeout
        } else if tests_pass {
            MutantStatus::Survived
        } else {
            MutantStatus::Killed
        }
    }

    /// Timeouts count as caught.
    pub fn is_killed(self) -> bool {
        self != MutantStatus::Survived
    }
}

#[derive(Debug, Clone)]
pub struct MutantResult {
    pub method: String,
    pub description: String,
    pub generic_description: &'static str,
    pub offset: u32,
    pub sequence_point: Option<SequencePoint>,
    pub status: MutantStatus,
    pub duration_ms: u64,
    pub diff: String,
}

impl MutantResult {
    pub fn new(mutant: &Mutant, status: MutantStatus, duration_ms: u64) -> Self {
        MutantResult {
            method: mutant.method.clone(),
            description: mutant.description.clone(),
            generic_description: mutant.generic_description,
            offset: mutant.offset,
            sequence_point: mutant.sequence_point.clone(),
            status,
            duration_ms,
            diff: mutant.diff.clone(),
        }
    }
}

pub fn generate_diff(original: &str, mutated: &str) -> String {
    use similar::TextDiff;
    let diff = TextDiff::from_lines(original, mutated);
    let mut output = String::new();
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Delete => {
                output.push_str(&format!("- {}", change));
            }
            similar::ChangeTag::Insert => {
                output.push_str(&format!("+ {}", change));
            }
            _ => {}
        }
    }
    output
}
