//! Aggregate mutation report: source files, their sequence points and the
//! mutants applied at each one.
//!
//! [`MutationReport`] is safe to share between threads. Lookups take the
//! read lock; an insert re-checks under the write lock, so a given
//! (sequence point, description) pair is stored once no matter how many
//! callers race to add it. The first record stored wins, and mutants at a
//! sequence point keep the order they were recorded in.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::SequencePoint;

/// Document used for mutants that have no visible sequence point.
pub const NO_SOURCE: &str = "<no source>";

/// Per-method document for mutants without a visible sequence point, so
/// equal descriptions from different methods stay apart.
pub fn no_source_url(method: &str) -> String {
    format!("{}/{}", NO_SOURCE, method)
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to access report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse report {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl From<&SequencePoint> for Span {
    fn from(sp: &SequencePoint) -> Self {
        Span {
            start_line: sp.start_line,
            start_column: sp.start_column,
            end_line: sp.end_line,
            end_column: sp.end_column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMutant {
    pub description: String,
    pub generic_description: String,
    pub killed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePointReport {
    #[serde(flatten)]
    pub span: Span,
    pub applied_mutants: Vec<AppliedMutant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileReport {
    pub url: String,
    pub sequence_points: Vec<SequencePointReport>,
}

/// Serialized form of a report. Merging two documents is a structural union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub source_files: Vec<SourceFileReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods_without_tests: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub killed: usize,
    pub survived: usize,
    pub score: f64,
}

/// Mutants at one sequence point in insertion order.
#[derive(Debug, Default)]
struct Mutants {
    ordered: Vec<AppliedMutant>,
    seen: HashSet<String>,
}

impl Mutants {
    fn contains(&self, description: &str) -> bool {
        self.seen.contains(description)
    }

    fn insert(&mut self, mutant: AppliedMutant) -> bool {
        if !self.seen.insert(mutant.description.clone()) {
            return false;
        }
        self.ordered.push(mutant);
        true
    }

    fn iter(&self) -> impl Iterator<Item = &AppliedMutant> {
        self.ordered.iter()
    }
}

#[derive(Debug, Default)]
struct ReportData {
    files: BTreeMap<String, BTreeMap<Span, Mutants>>,
    methods_without_tests: BTreeSet<String>,
}

impl ReportData {
    fn contains(&self, url: &str, span: &Span, description: &str) -> bool {
        self.files
            .get(url)
            .and_then(|points| points.get(span))
            .is_some_and(|mutants| mutants.contains(description))
    }
}

#[derive(Debug, Default)]
pub struct MutationReport {
    data: RwLock<ReportData>,
}

fn locate(method: &str, sequence_point: Option<&SequencePoint>) -> (String, Span) {
    match sequence_point.filter(|sp| !sp.is_hidden()) {
        Some(sp) => (sp.document.clone(), Span::from(sp)),
        None => (no_source_url(method), Span::default()),
    }
}

impl MutationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verdict for a mutant of `method`. Returns false when the
    /// description was already recorded at that sequence point.
    pub fn add_result(
        &self,
        method: &str,
        sequence_point: Option<&SequencePoint>,
        mutant: AppliedMutant,
    ) -> bool {
        let (url, span) = locate(method, sequence_point);
        self.insert(url, span, mutant)
    }

    fn insert(&self, url: String, span: Span, mutant: AppliedMutant) -> bool {
        if self.data.read().contains(&url, &span, &mutant.description) {
            return false;
        }
        let mut data = self.data.write();
        data.files
            .entry(url)
            .or_default()
            .entry(span)
            .or_default()
            .insert(mutant)
    }

    pub fn add_method_without_tests(&self, method: &str) -> bool {
        if self.data.read().methods_without_tests.contains(method) {
            return false;
        }
        self.data.write().methods_without_tests.insert(method.to_string())
    }

    pub fn methods_without_tests(&self) -> Vec<String> {
        self.data.read().methods_without_tests.iter().cloned().collect()
    }

    /// Fold a document in. Returns how many new mutant records were added.
    pub fn merge_document(&self, document: &ReportDocument) -> usize {
        let mut added = 0;
        for file in &document.source_files {
            for point in &file.sequence_points {
                for mutant in &point.applied_mutants {
                    if self.insert(file.url.clone(), point.span, mutant.clone()) {
                        added += 1;
                    }
                }
            }
        }
        for method in &document.methods_without_tests {
            self.add_method_without_tests(method);
        }
        added
    }

    /// Fold another report in. Merging a report into itself is a no-op.
    pub fn merge(&self, other: &MutationReport) -> usize {
        let snapshot = other.to_document();
        self.merge_document(&snapshot)
    }

    pub fn to_document(&self) -> ReportDocument {
        let data = self.data.read();
        let source_files = data
            .files
            .iter()
            .map(|(url, points)| SourceFileReport {
                url: url.clone(),
                sequence_points: points
                    .iter()
                    .map(|(span, mutants)| SequencePointReport {
                        span: *span,
                        applied_mutants: mutants.iter().cloned().collect(),
                    })
                    .collect(),
            })
            .collect();
        ReportDocument {
            source_files,
            methods_without_tests: data.methods_without_tests.iter().cloned().collect(),
        }
    }

    pub fn from_document(document: &ReportDocument) -> Self {
        let report = MutationReport::new();
        report.merge_document(document);
        report
    }

    pub fn len(&self) -> usize {
        self.data
            .read()
            .files
            .values()
            .flat_map(|points| points.values())
            .map(|mutants| mutants.ordered.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> ReportSummary {
        let data = self.data.read();
        let (mut total, mut killed) = (0, 0);
        for mutant in data.files.values().flat_map(|p| p.values()).flat_map(|m| m.iter()) {
            total += 1;
            if mutant.killed {
                killed += 1;
            }
        }
        let score = if total > 0 {
            killed as f64 / total as f64
        } else {
            1.0
        };
        ReportSummary {
            total,
            killed,
            survived: total - killed,
            score,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(&self.to_document())?;
        std::fs::write(path, json).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<MutationReport, ReportError> {
        let data = std::fs::read_to_string(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: ReportDocument =
            serde_json::from_str(&data).map_err(|source| ReportError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(MutationReport::from_document(&document))
    }
}
