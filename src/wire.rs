//! Line-delimited job framing shared by the console tool, the dispatcher
//! process and its workers.
//!
//! Every record travels as three lines: [`FRAME_START`], the JSON payload on
//! a single line, [`FRAME_END`]. Writers flush after each frame.

use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FRAME_START: &str = "<<<MUTATOR-FRAME";
pub const FRAME_END: &str = "MUTATOR-FRAME>>>";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    Closed,
    #[error("channel closed in the middle of a frame")]
    Truncated,
    #[error("expected frame end, got {0:?}")]
    MissingEnd(String),
    #[error("malformed frame payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One unit of dispatched work and, once returned, its verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescription {
    pub uid: String,
    /// Test suite to load. Its module reference resolves inside the
    /// mutant's scratch copy.
    pub assembly_path: String,
    /// Test names to run; empty runs the whole suite.
    #[serde(default)]
    pub tests_to_run: Vec<String>,
    /// Zero means no deadline.
    pub time_budget_ms: u64,
    #[serde(default)]
    pub exited_in_time: bool,
    #[serde(default)]
    pub tests_pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Set when the worker could not run the job at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestDescription {
    pub fn new(
        assembly_path: impl Into<String>,
        tests_to_run: Vec<String>,
        time_budget_ms: u64,
    ) -> Self {
        TestDescription {
            uid: new_uid(),
            assembly_path: assembly_path.into(),
            tests_to_run,
            time_budget_ms,
            exited_in_time: false,
            tests_pass: false,
            elapsed_ms: None,
            error: None,
        }
    }

    /// A failed verdict for this job, used when no worker could answer.
    pub fn failed(&self, exited_in_time: bool, error: Option<String>) -> Self {
        TestDescription {
            exited_in_time,
            tests_pass: false,
            error,
            ..self.clone()
        }
    }
}

pub fn new_uid() -> String {
    format!("{:016x}", fastrand::u64(..))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlCommand {
    Stop,
}

/// Anything the dispatcher may read on its inbound stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Command(ControlCommand),
    Job(TestDescription),
}

pub fn write_frame<W: Write + ?Sized, T: Serialize>(
    writer: &mut W,
    payload: &T,
) -> Result<(), WireError> {
    let line = serde_json::to_string(payload)?;
    writeln!(writer, "{}", FRAME_START)?;
    writeln!(writer, "{}", line)?;
    writeln!(writer, "{}", FRAME_END)?;
    writer.flush()?;
    Ok(())
}

fn read_line<R: BufRead + ?Sized>(reader: &mut R, buf: &mut String) -> Result<bool, WireError> {
    buf.clear();
    Ok(reader.read_line(buf)? > 0)
}

/// Read the next frame. Lines before a start sentinel are skipped.
pub fn read_frame<R: BufRead + ?Sized, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<T, WireError> {
    let mut line = String::new();
    loop {
        if !read_line(reader, &mut line)? {
            return Err(WireError::Closed);
        }
        if line.trim_end() == FRAME_START {
            break;
        }
        log::trace!("skipping unframed line {:?}", line.trim_end());
    }

    if !read_line(reader, &mut line)? {
        return Err(WireError::Truncated);
    }
    let payload = line.trim_end().to_string();

    if !read_line(reader, &mut line)? {
        return Err(WireError::Truncated);
    }
    if line.trim_end() != FRAME_END {
        return Err(WireError::MissingEnd(line.trim_end().to_string()));
    }
    Ok(serde_json::from_str(&payload)?)
}
