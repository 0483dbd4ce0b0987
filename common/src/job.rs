use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ValidationError;

pub type JobId = String;

/// Pasos de tiempo aceptados (en horas): todos los divisores de 24.
pub const VALID_TIME_STEPS: [u32; 8] = [1, 2, 3, 4, 6, 8, 12, 24];

/// Clase de recurso exclusivo. Sólo un job de cada clase puede estar en Processing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKind(pub String);

impl ServiceKind {
    pub const MODEL_PACKAGE: &'static str = "model_package";

    /// Paquete de entrada del modelo (cuenca + forzantes climáticos).
    pub fn model_package() -> Self {
        Self(Self::MODEL_PACKAGE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InQueue,
    Processing,
    Success,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error)
    }
}

/// Parámetros con los que el cliente pide un paquete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,

    /// Paso de tiempo de los forzantes, en horas.
    pub time_step_hours: u32,

    /// Parámetros opacos que se pasan tal cual a los scripts (outlet, epsg, etc.).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl PackageRequest {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate, time_step_hours: u32) -> Self {
        Self {
            start_date,
            end_date,
            time_step_hours,
            params: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.start_date >= self.end_date {
            return Err(ValidationError::DateRange {
                start: self.start_date,
                end: self.end_date,
            });
        }
        if !VALID_TIME_STEPS.contains(&self.time_step_hours) {
            return Err(ValidationError::TimeStep(self.time_step_hours));
        }
        Ok(())
    }
}

/// Registro persistido de un job. Sólo lo muta la cola.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub service_kind: ServiceKind,
    pub run_status: RunStatus,
    pub request: PackageRequest,

    pub call_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    /// Job recién aceptado, todavía en cola.
    pub fn new_queued(kind: ServiceKind, request: PackageRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_kind: kind,
            run_status: RunStatus::InQueue,
            request,
            call_time: now,
            start_time: None,
            finish_time: None,
            error_message: None,
        }
    }
}
