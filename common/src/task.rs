use serde::{Deserialize, Serialize};

/// Clave de una tarea en el TaskStore. Para etapas: "<job_id>:<etapa>".
/// La tarea del job completo usa el propio JobId.
pub type TaskKey = String;

pub fn stage_task_key(job_id: &str, stage: &str) -> TaskKey {
    format!("{}:{}", job_id, stage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Faulted,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Faulted | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub key: TaskKey,
    pub state: TaskState,
}

impl TaskHandle {
    pub fn new(key: impl Into<TaskKey>, state: TaskState) -> Self {
        Self {
            key: key.into(),
            state,
        }
    }

    pub fn pending(key: impl Into<TaskKey>) -> Self {
        Self::new(key, TaskState::Pending)
    }
}
