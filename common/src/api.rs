use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::status::{JobStatusView, TaskStatus};
use crate::task::TaskKey;

/* --------- Mensajes entre client y master --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_key: TaskKey,
    pub message: String,
    #[serde(flatten)]
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub message: String,
    #[serde(flatten)]
    pub status: JobStatusView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNextResponse {
    pub started: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
