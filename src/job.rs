//! Job records and status transitions for the slicing queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{JobError, JobResult};

/// Prefix of input model objects in the bucket.
const MODEL_KEY_PREFIX: &str = "models";

/// Prefix of produced toolpath objects in the bucket.
const GCODE_KEY_PREFIX: &str = "gcode";

/// A slicing job as it travels through the input and output queues.
///
/// The wire shape is fixed by producers:
/// `{"id": 7, "slicerName": "acme", "filename": "part.stl", "status": "pending"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    #[serde(rename = "slicerName")]
    pub converter_name: String,
    #[serde(rename = "filename")]
    pub input_filename: String,
    #[serde(default)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Done,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl JobRecord {
    pub fn new(id: i64, converter_name: impl Into<String>, input_filename: impl Into<String>) -> Self {
        Self {
            id,
            converter_name: converter_name.into(),
            input_filename: input_filename.into(),
            status: JobStatus::Pending,
        }
    }

    /// Parses a queue message body.
    pub fn decode(body: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn encode(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks the fields the pipeline depends on. Converter resolution is
    /// checked separately against the registry.
    pub fn validate(&self) -> JobResult<()> {
        if self.input_filename.is_empty() {
            return Err(JobError::validation("filename is empty"));
        }
        if self.converter_name.is_empty() {
            return Err(JobError::validation("slicerName is empty"));
        }
        self.scratch_filename()?;
        Ok(())
    }

    /// Object key of the input model: `models/{id}-{filename}`.
    pub fn input_key(&self) -> String {
        format!("{}/{}-{}", MODEL_KEY_PREFIX, self.id, self.input_filename)
    }

    /// Object key of the produced toolpath: `gcode/{id}.gcode`.
    pub fn output_key(&self) -> String {
        format!("{}/{}.gcode", GCODE_KEY_PREFIX, self.id)
    }

    /// Local file name for the fetched model. Only the final path component
    /// is kept so a filename cannot escape the job's scratch directory.
    pub fn scratch_filename(&self) -> JobResult<&str> {
        Path::new(&self.input_filename)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                JobError::validation(format!(
                    "filename {:?} has no usable file name",
                    self.input_filename
                ))
            })
    }

    pub fn start_processing(&mut self) -> JobResult<()> {
        self.transition(JobStatus::Pending, JobStatus::Processing)
    }

    pub fn mark_done(&mut self) -> JobResult<()> {
        self.transition(JobStatus::Processing, JobStatus::Done)
    }

    pub fn mark_failed(&mut self) -> JobResult<()> {
        self.transition(JobStatus::Processing, JobStatus::Failed)
    }

    fn transition(&mut self, expected: JobStatus, next: JobStatus) -> JobResult<()> {
        if self.status != expected {
            return Err(JobError::Transition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
