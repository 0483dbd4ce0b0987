use serde::{Deserialize, Serialize};

/// Mensaje fijo de una etapa que no se ejecutó por cancelación.
pub const CANCELLED_MESSAGE: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatusCode {
    Ok,
    BadRequest,
    NotFound,
    InternalServerError,
}

/// Resultado inmutable de una etapa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatusCode,
    pub message: String,
}

impl StageResult {
    pub fn new(status: StageStatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(StageStatusCode::Ok, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StageStatusCode::NotFound, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(StageStatusCode::InternalServerError, message)
    }

    pub fn cancelled() -> Self {
        Self::new(StageStatusCode::BadRequest, CANCELLED_MESSAGE)
    }

    pub fn is_ok(&self) -> bool {
        self.status == StageStatusCode::Ok
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == StageStatusCode::BadRequest && self.message == CANCELLED_MESSAGE
    }
}
