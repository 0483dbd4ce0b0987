use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::job::{Job, JobId, RunStatus, ServiceKind};
use crate::pipeline::{PipelineExecutor, RunOutcome};
use crate::results::StageResult;
use crate::store::JobStore;
use crate::task::TaskState;

/// Motivo con el que se cierra un job que quedó colgado en Processing.
pub const STALE_JOB_REASON: &str = "processing took too long";

/// Admisión single-flight sobre la cola persistida de una clase exclusiva.
pub struct JobQueueManager {
    kind: ServiceKind,
    jobs: Arc<dyn JobStore>,
    executor: PipelineExecutor,
    clock: Arc<dyn Clock>,
    staleness: ChronoDuration,

    // chequeo + marcado de Processing bajo el mismo lock
    admission: Mutex<()>,
    // corridas y limpiezas lanzadas, por job
    running: Mutex<Vec<(JobId, JoinHandle<()>)>>,
}

impl JobQueueManager {
    pub fn new(
        kind: ServiceKind,
        jobs: Arc<dyn JobStore>,
        executor: PipelineExecutor,
        clock: Arc<dyn Clock>,
        staleness: Duration,
    ) -> Self {
        let staleness =
            ChronoDuration::from_std(staleness).unwrap_or_else(|_| ChronoDuration::days(36_500));
        Self {
            kind,
            jobs,
            executor,
            clock,
            staleness,
            admission: Mutex::new(()),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Admite como mucho un job y lanza su pipeline en segundo plano.
    /// Devuelve cuántos jobs arrancó (0 o 1). Hay que llamarlo dentro de un
    /// runtime de tokio.
    pub fn try_run_next(&self) -> Result<usize, QueueError> {
        let _admission = self.admission.lock();
        let now = self.clock.now();

        // 1) ¿hay otro job procesando? si está vencido, se cierra y se sigue
        while let Some(mut active) = self.jobs.oldest_processing(&self.kind)? {
            let started = active.start_time.unwrap_or(active.call_time);
            let age = now - started;
            if age < self.staleness {
                debug!(
                    "job {} sigue en Processing ({}s), admisión denegada",
                    active.id,
                    age.num_seconds()
                );
                return Ok(0);
            }

            warn!(
                "job {} lleva {}s en Processing (límite {}s), marcándolo como Error",
                active.id,
                age.num_seconds(),
                self.staleness.num_seconds()
            );
            active.run_status = RunStatus::Error;
            active.error_message = Some(STALE_JOB_REASON.to_string());
            active.finish_time = Some(now);
            self.jobs.update(&active)?;

            // sin corrida viva nadie más va a limpiar su directorio
            if !self.has_live_run(&active.id) {
                let executor = self.executor.clone();
                let id = active.id.clone();
                let cleanup = tokio::spawn(async move { discard_run(&executor, &id).await });
                self.track(active.id, cleanup);
            }
        }

        // 2) el más viejo en cola
        let Some(mut job) = self.jobs.oldest_queued(&self.kind)? else {
            return Ok(0);
        };

        job.run_status = RunStatus::Processing;
        job.start_time = Some(now);
        self.jobs.update(&job)?;
        info!("job {} admitido ({}), lanzando pipeline", job.id, self.kind);

        self.spawn_run(job);
        Ok(1)
    }

    /// `try_run_next` fuera de los hilos del runtime: el job store puede
    /// escribir a disco con el lock de admisión tomado.
    pub async fn try_run_next_blocking(self: Arc<Self>) -> Result<usize, QueueError> {
        tokio::task::spawn_blocking(move || self.try_run_next())
            .await
            .map_err(|e| QueueError::Join(e.to_string()))?
    }

    fn spawn_run(&self, job: Job) {
        let executor = self.executor.clone();
        let jobs = self.jobs.clone();
        let clock = self.clock.clone();
        let id = job.id.clone();

        let handle = tokio::spawn(async move {
            let outcome = executor.run(&job).await;
            record_outcome(jobs.as_ref(), clock.as_ref(), &executor, &job, &outcome).await;
        });
        self.track(id, handle);
    }

    fn track(&self, job_id: JobId, handle: JoinHandle<()>) {
        let mut running = self.running.lock();
        running.retain(|(_, h)| !h.is_finished());
        running.push((job_id, handle));
    }

    fn has_live_run(&self, job_id: &str) -> bool {
        self.running
            .lock()
            .iter()
            .any(|(id, h)| id == job_id && !h.is_finished())
    }

    /// Espera a que terminen las corridas lanzadas hasta ahora.
    pub async fn wait_for_running(&self) {
        let handles = std::mem::take(&mut *self.running.lock());
        for (job_id, handle) in handles {
            if let Err(e) = handle.await {
                error!("corrida del job {} abortada: {:?}", job_id, e);
            }
        }
    }
}

/// Persiste el estado terminal, salvo que el job ya no sea el que se lanzó
/// (por ejemplo, se cerró por vencido mientras corría). En ese caso se
/// descarta lo que haya producido la corrida.
async fn record_outcome(
    jobs: &dyn JobStore,
    clock: &dyn Clock,
    executor: &PipelineExecutor,
    launched: &Job,
    outcome: &RunOutcome,
) {
    let mut current = match jobs.get(&launched.id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!("job {} ya no existe, se descarta su resultado", launched.id);
            discard_run(executor, &launched.id).await;
            return;
        }
        Err(e) => {
            error!("no se pudo leer job {} al terminar: {}", launched.id, e);
            return;
        }
    };

    if current.run_status != RunStatus::Processing || current.start_time != launched.start_time {
        warn!(
            "job {} ya no está en la corrida lanzada (estado {:?}), se descarta el resultado {:?}",
            current.id, current.run_status, outcome.state
        );
        discard_run(executor, &launched.id).await;
        return;
    }

    current.finish_time = Some(clock.now());
    if outcome.is_success() {
        current.run_status = RunStatus::Success;
        current.error_message = None;
        info!("job {} terminó OK", current.id);
    } else {
        current.run_status = RunStatus::Error;
        current.error_message = Some(outcome.message.clone());
        error!("job {} terminó con error: {}", current.id, outcome.message);
    }

    if let Err(e) = jobs.update(&current) {
        error!("no se pudo persistir el final del job {}: {}", current.id, e);
    }
}

/// Deja el handle del job en Faulted y borra su directorio.
async fn discard_run(executor: &PipelineExecutor, job_id: &str) {
    executor.tasks().finish(
        job_id,
        TaskState::Faulted,
        StageResult::internal_error(STALE_JOB_REASON),
    );
    let workspace = executor.workspace_for(job_id);
    match workspace.remove().await {
        Ok(()) => debug!("directorio del job {} descartado", job_id),
        Err(e) => warn!(
            "no se pudo borrar {} del job {}: {}",
            workspace.root.display(),
            job_id,
            e
        ),
    }
}
