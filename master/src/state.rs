// master/src/state.rs

use std::sync::Arc;

use common::{
    watershed_package_dag, Clock, FileJobStore, JobQueueManager, JobStore, PipelineError,
    PipelineExecutor, ServiceKind, StageRegistry, StatusReporter, SystemClock, TaskStore,
};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<JobQueueManager>,
    pub reporter: StatusReporter,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Arma el estado con el job store en archivo y los scripts reales.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let jobs: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.jobs_db)?);
        let dag = watershed_package_dag();
        let registry = StageRegistry::scripts(&config.interpreter, &config.scripts_dir, &dag);
        Ok(Self::new(config, jobs, registry, Arc::new(SystemClock))?)
    }

    pub fn new(
        config: Config,
        jobs: Arc<dyn JobStore>,
        registry: StageRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        // handles y resultados de tareas vivas (job + etapas)
        let tasks = Arc::new(TaskStore::new());
        let executor = PipelineExecutor::new(
            watershed_package_dag(),
            registry,
            tasks.clone(),
            config.data_dir.clone(),
        )?
        .with_strategy(config.strategy)
        .with_stage_timeout(config.stage_timeout);

        let queue = Arc::new(JobQueueManager::new(
            ServiceKind::model_package(),
            jobs.clone(),
            executor,
            clock.clone(),
            config.staleness,
        ));
        let reporter = StatusReporter::new(tasks.clone(), jobs.clone(), config.data_dir.clone());

        Ok(Self {
            jobs,
            queue,
            reporter,
            clock,
            config: Arc::new(config),
        })
    }
}
