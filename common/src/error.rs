use chrono::NaiveDate;
use thiserror::Error;

use crate::job::JobId;

/// Errores de validación de la petición (antes de crear el job).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("start date {start} must be before end date {end}")]
    DateRange { start: NaiveDate, end: NaiveDate },

    #[error("invalid time step {0}h: must divide 24 (1, 2, 3, 4, 6, 8, 12 or 24)")]
    TimeStep(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("dependency cycle between stages: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    AlreadyExists(JobId),
}

/// Fallos de la propia contabilidad del executor (no de las etapas).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("working directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no collaborator registered for stage '{0}'")]
    MissingCollaborator(String),

    #[error("stage task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("queue admission task failed: {0}")]
    Join(String),
}
