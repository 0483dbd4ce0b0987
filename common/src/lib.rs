pub mod api;
pub mod clock;
pub mod dag;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod results;
pub mod stage;
pub mod status;
pub mod store;
pub mod task;
pub mod task_store;
pub mod workspace;

pub use api::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dag::{package_stage, watershed_package_dag, Dag, StageNode, PACKAGE_ARTIFACT, PACKAGE_STAGE};
pub use error::{DagError, JobStoreError, PipelineError, QueueError, ValidationError};
pub use job::{Job, JobId, PackageRequest, RunStatus, ServiceKind};
pub use pipeline::{ExecutionStrategy, PipelineExecutor, RunOutcome, RunState, StageRegistry};
pub use queue::{JobQueueManager, STALE_JOB_REASON};
pub use results::{StageResult, StageStatusCode};
pub use stage::{CancelFlag, Collaborator, CollaboratorOutput, ScriptCollaborator, StageContext, StageRunner};
pub use status::{JobStatusView, StatusReporter, TaskStatus};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use task::{stage_task_key, TaskHandle, TaskKey, TaskState};
pub use task_store::TaskStore;
pub use workspace::JobWorkspace;
