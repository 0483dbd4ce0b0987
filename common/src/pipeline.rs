use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dag::{package_stage, Dag, StageNode};
use crate::error::{DagError, PipelineError};
use crate::job::{Job, JobId, PackageRequest};
use crate::results::{StageResult, StageStatusCode};
use crate::stage::{CancelFlag, Collaborator, ScriptCollaborator, StageContext, StageRunner};
use crate::task::{stage_task_key, TaskHandle, TaskKey, TaskState};
use crate::task_store::TaskStore;
use crate::workspace::JobWorkspace;

/// Cómo se recorre el grafo. Serial es el modo canónico.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    #[default]
    Serial,
    Parallel { max_concurrency: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Resultado final de una corrida.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    /// Primera etapa que devolvió algo distinto de OK.
    pub failed_stage: Option<String>,
    /// Código de esa etapa; Ok si la corrida terminó bien.
    pub status: StageStatusCode,
    pub message: String,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Succeeded
    }
}

/// Colaborador de cada etapa, por nombre.
#[derive(Clone, Default)]
pub struct StageRegistry {
    collaborators: HashMap<String, Arc<dyn Collaborator>>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<&String> = self.collaborators.keys().collect();
        stages.sort();
        f.debug_struct("StageRegistry").field("stages", &stages).finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: &str, collaborator: Arc<dyn Collaborator>) {
        self.collaborators.insert(stage.to_string(), collaborator);
    }

    pub fn with(mut self, stage: &str, collaborator: Arc<dyn Collaborator>) -> Self {
        self.register(stage, collaborator);
        self
    }

    pub fn get(&self, stage: &str) -> Option<Arc<dyn Collaborator>> {
        self.collaborators.get(stage).cloned()
    }

    /// Un script por etapa del grafo más el de empaquetado.
    pub fn scripts(interpreter: &str, scripts_dir: &Path, dag: &Dag) -> Self {
        let mut registry = Self::new();
        let package = package_stage(dag);
        for node in dag.nodes.iter().chain(std::iter::once(&package)) {
            registry.register(
                &node.id,
                Arc::new(ScriptCollaborator::for_stage(interpreter, scripts_dir, &node.id)),
            );
        }
        registry
    }
}

/// Estado de una corrida concreta, compartido entre sus etapas.
#[derive(Debug, Clone)]
struct Run {
    job_id: JobId,
    request: PackageRequest,
    workspace: JobWorkspace,
    cancel: CancelFlag,
    first_failure: Arc<Mutex<Option<(String, StageResult)>>>,
}

impl Run {
    fn record_failure(&self, stage: &str, result: &StageResult) {
        self.cancel.raise();
        let mut slot = self.first_failure.lock();
        if slot.is_none() {
            *slot = Some((stage.to_string(), result.clone()));
        }
    }

    fn failure(&self) -> Option<(String, StageResult)> {
        self.first_failure.lock().clone()
    }
}

/// Recorre el grafo de etapas de un job, registra cada etapa en el TaskStore,
/// propaga la cancelación y al final empaqueta o limpia.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    dag: Arc<Dag>,
    package: StageNode,
    registry: Arc<StageRegistry>,
    tasks: Arc<TaskStore>,
    runner: StageRunner,
    strategy: ExecutionStrategy,
    data_dir: PathBuf,
}

impl PipelineExecutor {
    pub fn new(
        dag: Dag,
        registry: StageRegistry,
        tasks: Arc<TaskStore>,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, DagError> {
        dag.validate()?;
        let package = package_stage(&dag);
        if dag.node(&package.id).is_some() {
            return Err(DagError::DuplicateStage(package.id));
        }
        Ok(Self {
            dag: Arc::new(dag),
            package,
            registry: Arc::new(registry),
            tasks,
            runner: StageRunner::default(),
            strategy: ExecutionStrategy::default(),
            data_dir: data_dir.into(),
        })
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.runner = StageRunner::new(timeout);
        self
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn workspace_for(&self, job_id: &str) -> JobWorkspace {
        JobWorkspace::for_job(&self.data_dir, job_id)
    }

    /// Claves de todas las etapas de un job, incluida la de empaquetado.
    pub fn stage_keys(&self, job_id: &str) -> Vec<TaskKey> {
        self.dag
            .nodes
            .iter()
            .chain(std::iter::once(&self.package))
            .map(|n| stage_task_key(job_id, &n.id))
            .collect()
    }

    /// Corre el pipeline completo de un job. Nunca falla: cualquier error de
    /// contabilidad se traduce en RunState::Failed (y limpieza).
    pub async fn run(&self, job: &Job) -> RunOutcome {
        let run = Run {
            job_id: job.id.clone(),
            request: job.request.clone(),
            workspace: self.workspace_for(&job.id),
            cancel: CancelFlag::new(),
            first_failure: Arc::new(Mutex::new(None)),
        };

        self.register(&run.job_id);
        info!(
            "job {}: iniciando pipeline ({} etapas, {:?})",
            run.job_id,
            self.dag.nodes.len() + 1,
            self.strategy
        );

        let outcome = match self.drive(&run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("job {}: fallo inesperado del executor: {}", run.job_id, e);
                run.cancel.raise();
                if let Err(io) = run.workspace.remove().await {
                    warn!("job {}: no se pudo limpiar {}: {}", run.job_id, run.workspace.root.display(), io);
                }
                RunOutcome {
                    state: RunState::Failed,
                    failed_stage: run.failure().map(|(stage, _)| stage),
                    status: StageStatusCode::InternalServerError,
                    message: format!("pipeline failed: {}", e),
                }
            }
        };

        self.sweep_unfinished(&run.job_id);
        self.finish_job_task(&run.job_id, &outcome);

        info!("job {}: pipeline terminó en {:?}", run.job_id, outcome.state);
        outcome
    }

    /// Handle del job (padre) y uno Pending por etapa (hijos).
    fn register(&self, job_id: &str) {
        self.tasks
            .set(job_id, TaskHandle::new(job_id, TaskState::Running));
        for key in self.stage_keys(job_id) {
            self.tasks.set(&key, TaskHandle::pending(key.clone()));
            self.tasks.link_child(job_id, &key);
        }
    }

    async fn drive(&self, run: &Run) -> Result<RunOutcome, PipelineError> {
        run.workspace.prepare().await?;

        match self.strategy {
            ExecutionStrategy::Serial => self.run_serial(run).await?,
            ExecutionStrategy::Parallel { max_concurrency } => {
                self.run_parallel(run, max_concurrency.max(1)).await?
            }
        }

        // empaquetar sólo si nada levantó la bandera
        if !run.cancel.is_raised() {
            self.run_stage(&self.package, run).await?;
        } else {
            self.cancel_stage(&self.package, run);
        }

        if let Some((stage, result)) = run.failure() {
            info!("job {}: limpiando artefactos parciales tras fallo en {}", run.job_id, stage);
            run.workspace.remove().await?;
            return Ok(RunOutcome {
                state: RunState::Cancelled,
                status: result.status,
                message: format!("pipeline stopped at stage '{}': {}", stage, result.message),
                failed_stage: Some(stage),
            });
        }

        run.workspace.clear_intermediate().await?;
        Ok(RunOutcome {
            state: RunState::Succeeded,
            failed_stage: None,
            status: StageStatusCode::Ok,
            message: "package ready".to_string(),
        })
    }

    async fn run_serial(&self, run: &Run) -> Result<(), PipelineError> {
        for node in self.dag.topological_order()? {
            self.run_stage(node, run).await?;
        }
        Ok(())
    }

    /// Cada etapa espera el estado terminal de sus dependencias; las que no
    /// dependen entre sí corren a la vez, hasta `max_concurrency`.
    async fn run_parallel(&self, run: &Run, max_concurrency: usize) -> Result<(), PipelineError> {
        let order: Vec<StageNode> = self.dag.topological_order()?.into_iter().cloned().collect();

        let mut senders: HashMap<String, watch::Sender<Option<TaskState>>> = HashMap::new();
        let mut receivers: HashMap<String, watch::Receiver<Option<TaskState>>> = HashMap::new();
        for node in &order {
            let (tx, rx) = watch::channel(None);
            senders.insert(node.id.clone(), tx);
            receivers.insert(node.id.clone(), rx);
        }

        let sem = Arc::new(Semaphore::new(max_concurrency));
        let mut set = JoinSet::new();

        for node in order {
            let deps: Vec<watch::Receiver<Option<TaskState>>> = self
                .dag
                .dependencies_of(&node.id)
                .into_iter()
                .filter_map(|d| receivers.get(d).cloned())
                .collect();
            let Some(tx) = senders.remove(&node.id) else {
                continue;
            };
            let this = self.clone();
            let run = run.clone();
            let sem = sem.clone();

            set.spawn(async move {
                let mut deps_ok = true;
                for mut rx in deps {
                    let state = match rx.wait_for(|s| s.is_some()).await {
                        Ok(state) => *state,
                        Err(_) => None, // la dependencia murió sin publicar estado
                    };
                    if state != Some(TaskState::Completed) {
                        deps_ok = false;
                    }
                }

                let state = if deps_ok {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::Join(e.to_string()))?;
                    this.run_stage(&node, &run).await?
                } else {
                    this.cancel_stage(&node, &run)
                };

                let _ = tx.send(Some(state));
                Ok::<(), PipelineError>(())
            });
        }

        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| PipelineError::Join(e.to_string()))??;
        }
        Ok(())
    }

    /// Corre una etapa y deja su estado terminal en el TaskStore.
    async fn run_stage(&self, node: &StageNode, run: &Run) -> Result<TaskState, PipelineError> {
        if run.cancel.is_raised() {
            return Ok(self.cancel_stage(node, run));
        }

        let collaborator = self
            .registry
            .get(&node.id)
            .ok_or_else(|| PipelineError::MissingCollaborator(node.id.clone()))?;

        let key = stage_task_key(&run.job_id, &node.id);
        self.tasks.set_state(&key, TaskState::Running);
        debug!("job {}: etapa {} en ejecución", run.job_id, node.id);

        let ctx = StageContext {
            job_id: run.job_id.clone(),
            node: node.clone(),
            request: run.request.clone(),
            workspace: run.workspace.clone(),
            cancel: run.cancel.clone(),
        };
        let result = self.runner.run(collaborator, ctx).await;

        let state = if result.is_cancelled() {
            TaskState::Cancelled
        } else if result.is_ok() {
            info!("job {}: etapa {} OK", run.job_id, node.id);
            TaskState::Completed
        } else {
            error!(
                "job {}: etapa {} terminó en {:?}: {}; cancelando el resto",
                run.job_id, node.id, result.status, result.message
            );
            run.record_failure(&node.id, &result);
            TaskState::Faulted
        };

        self.tasks.finish(&key, state, result);
        Ok(state)
    }

    fn cancel_stage(&self, node: &StageNode, run: &Run) -> TaskState {
        debug!("job {}: etapa {} cancelada sin ejecutar", run.job_id, node.id);
        let key = stage_task_key(&run.job_id, &node.id);
        self.tasks
            .finish(&key, TaskState::Cancelled, StageResult::cancelled());
        TaskState::Cancelled
    }

    /// Ninguna etapa queda Pending/Running después de terminar la corrida.
    fn sweep_unfinished(&self, job_id: &str) {
        for key in self.stage_keys(job_id) {
            if let Some(handle) = self.tasks.get(&key) {
                if !handle.state.is_terminal() {
                    self.tasks
                        .finish(&key, TaskState::Cancelled, StageResult::cancelled());
                }
            }
        }
    }

    fn finish_job_task(&self, job_id: &str, outcome: &RunOutcome) {
        let state = match outcome.state {
            RunState::Succeeded => TaskState::Completed,
            _ => TaskState::Faulted,
        };
        let result = StageResult::new(outcome.status, outcome.message.clone());
        self.tasks.finish(job_id, state, result);
    }
}
