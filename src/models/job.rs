use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TranscodeError;

/// Immutable description of one transcode request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    id: Uuid,
    input_path: PathBuf,
    output_path: PathBuf,
    arguments: Vec<String>,
    created_at: DateTime<Utc>,
}

impl JobSpec {
    /// Build and validate a spec. The input file must exist at this point.
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        arguments: Vec<String>,
    ) -> Result<Self, TranscodeError> {
        let mut spec = Self {
            id: Uuid::now_v7(),
            input_path: input_path.into(),
            output_path: output_path.into(),
            arguments,
            created_at: Utc::now(),
        };
        spec.validate()?;
        // Registry comparisons see one spelling per destination
        spec.output_path = std::path::absolute(&spec.output_path).map_err(|e| {
            TranscodeError::InvalidSpec(format!(
                "output path '{}' cannot be resolved: {}",
                spec.output_path.display(),
                e
            ))
        })?;
        Ok(spec)
    }

    /// Re-check the spec against the filesystem.
    pub fn validate(&self) -> Result<(), TranscodeError> {
        if self.output_path.as_os_str().is_empty() {
            return Err(TranscodeError::InvalidSpec(
                "output path cannot be empty".to_string(),
            ));
        }

        if self.arguments.is_empty() {
            return Err(TranscodeError::InvalidSpec(
                "arguments cannot be empty".to_string(),
            ));
        }

        if !self.input_path.is_file() {
            return Err(TranscodeError::InvalidSpec(format!(
                "input file '{}' does not exist",
                self.input_path.display()
            )));
        }

        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Arguments passed to the tool.
    ///
    /// With `insert_input`, `-i <input>` is put first unless the arguments
    /// already name the input. With `append_output`, the destination is
    /// added last unless the caller already put it there.
    pub fn command_arguments(&self, insert_input: bool, append_output: bool) -> Vec<String> {
        let mut args = Vec::with_capacity(self.arguments.len() + 3);
        if insert_input {
            let input = self.input_path.to_string_lossy().to_string();
            if !self.arguments.contains(&input) {
                args.push("-i".to_string());
                args.push(input);
            }
        }
        args.extend(self.arguments.iter().cloned());
        if append_output {
            let output = self.output_path.to_string_lossy().to_string();
            if args.last() != Some(&output) {
                args.push(output);
            }
        }
        args
    }
}
