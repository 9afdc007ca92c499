use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::mutants::MutantStatus;
use crate::report::NO_SOURCE;
use crate::runner::RunOutcome;

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub score: f64,
    pub passed: bool,
    pub total: usize,
    /// Includes timeouts.
    pub killed: usize,
    pub survived: usize,
    pub timeout: usize,
    pub duration_ms: u64,
    #[serde(default)]
    pub methods_without_tests: Vec<String>,
    pub survived_mutants: Vec<SurvivedMutant>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SurvivedMutant {
    pub ref_id: String,
    pub method: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub offset: u32,
    pub turtle: String,
    pub description: String,
    pub diff: String,
}

impl RunResult {
    pub fn from_outcome(outcome: &RunOutcome) -> RunResult {
        let survived_mutants: Vec<SurvivedMutant> = outcome
            .results
            .iter()
            .filter(|r| r.status == MutantStatus::Survived)
            .enumerate()
            .map(|(i, r)| {
                let (file, line, column) = match &r.sequence_point {
                    Some(sp) => (sp.document.clone(), sp.start_line, sp.start_column),
                    None => (NO_SOURCE.to_string(), 0, 0),
                };
                SurvivedMutant {
                    ref_id: format!("m{}", i + 1),
                    method: r.method.clone(),
                    file,
                    line,
                    column,
                    offset: r.offset,
                    turtle: r.generic_description.to_string(),
                    description: r.description.clone(),
                    diff: r.diff.clone(),
                }
            })
            .collect();

        RunResult {
            score: outcome.score,
            passed: outcome.passed,
            total: outcome.attempted(),
            killed: outcome.killed(),
            survived: survived_mutants.len(),
            timeout: outcome.count(MutantStatus::Timeout),
            duration_ms: outcome.duration_ms,
            methods_without_tests: outcome
                .methods_without_tests()
                .into_iter()
                .map(str::to_string)
                .collect(),
            survived_mutants,
        }
    }

    pub fn find(&self, mutant_ref: &str) -> Option<&SurvivedMutant> {
        let ref_id = mutant_ref.trim_start_matches('@');
        self.survived_mutants.iter().find(|m| m.ref_id == ref_id)
    }
}

fn state_path() -> PathBuf {
    let dir = dirs_or_cwd();
    dir.join(".mutator-state.json")
}

fn dirs_or_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn save_last_run(result: &RunResult) {
    save_to_path(result, &state_path());
}

pub fn load_last_run() -> Option<RunResult> {
    load_from_path(&state_path())
}

pub fn save_to_path(result: &RunResult, path: &std::path::Path) {
    match serde_json::to_string(result) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                log::warn!("could not save run state to {}: {}", path.display(), e);
            }
        }
        Err(e) => log::warn!("could not serialize run state: {}", e),
    }
}

pub fn load_from_path(path: &std::path::Path) -> Option<RunResult> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}
