//! Experiment definitions on disk (one TOML file per experiment).
//!
//! ```toml
//! name = "checkout cpu burn"
//! kind = "CPU_STRESS"
//! environment = "staging"
//! schedule_at = "2026-01-01T03:00:00Z"
//!
//! [selector]
//! service = "checkout"
//!
//! [parameters]
//! cpu_percent = 70
//! duration_secs = 120
//! ```

use chaos_common::{Experiment, ExperimentId, ExperimentKind, TargetScope};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExperimentFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid schedule_at '{value}': {message}")]
    Schedule { value: String, message: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub kind: ExperimentKind,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// RFC 3339 start time; the daemon schedules the experiment for it.
    #[serde(default)]
    pub schedule_at: Option<String>,
}

fn default_environment() -> String {
    "default".to_string()
}

impl ExperimentFile {
    pub fn load(path: &Path) -> Result<Self, ExperimentFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| ExperimentFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|message| ExperimentFileError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn schedule(&self) -> Result<Option<DateTime<Utc>>, ExperimentFileError> {
        self.schedule_at
            .as_deref()
            .map(|value| {
                DateTime::parse_from_rfc3339(value)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|e| ExperimentFileError::Schedule {
                        value: value.to_string(),
                        message: e.to_string(),
                    })
            })
            .transpose()
    }

    /// A DRAFT experiment record for this definition.
    pub fn to_experiment(&self) -> Experiment {
        let target = TargetScope {
            environment: self.environment.clone(),
            selector: self.selector.clone(),
        };
        let mut experiment = Experiment::new(self.name.clone(), self.kind, target);
        if let Some(id) = &self.id {
            experiment.id = ExperimentId::new(id.clone());
        }
        experiment.parameters = self.parameters.clone();
        experiment
    }
}

/// Every `*.toml` file in `dir`, sorted by path, each with its parse result.
pub fn load_dir(
    dir: &Path,
) -> Result<Vec<(PathBuf, Result<ExperimentFile, ExperimentFileError>)>, ExperimentFileError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ExperimentFileError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();
    debug!(dir = %dir.display(), files = paths.len(), "loading experiment definitions");

    Ok(paths
        .into_iter()
        .map(|path| {
            let parsed = ExperimentFile::load(&path);
            (path, parsed)
        })
        .collect())
}
