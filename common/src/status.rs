use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::JobStoreError;
use crate::job::{Job, JobId, RunStatus};
use crate::results::StageResult;
use crate::store::JobStore;
use crate::task::TaskState;
use crate::task_store::TaskStore;
use crate::workspace::JobWorkspace;

/// Estado de una tarea tal como lo ve el cliente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// No existe o ya se entregó.
    Unknown,
    InProgress,
    Completed { result: StageResult },
    Faulted { result: StageResult },
    Cancelled,
}

impl TaskStatus {
    pub fn describe(&self) -> &'static str {
        match self {
            TaskStatus::Unknown => "unknown or already consumed",
            TaskStatus::InProgress => "in progress",
            TaskStatus::Completed { .. } => "completed",
            TaskStatus::Faulted { .. } => "faulted",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Estado persistido de un job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatusView {
    NoSuchJob,
    InQueue,
    Processing,
    Success { artifact_available: bool },
    Error { reason: String },
}

impl JobStatusView {
    pub fn describe(&self) -> &'static str {
        match self {
            JobStatusView::NoSuchJob => "no such job",
            JobStatusView::InQueue => "in queue",
            JobStatusView::Processing => "processing",
            JobStatusView::Success { .. } => "success",
            JobStatusView::Error { .. } => "error",
        }
    }
}

/// Respuestas a los polls de los clientes.
#[derive(Clone)]
pub struct StatusReporter {
    tasks: Arc<TaskStore>,
    jobs: Arc<dyn JobStore>,
    data_dir: PathBuf,
}

impl StatusReporter {
    pub fn new(tasks: Arc<TaskStore>, jobs: Arc<dyn JobStore>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks,
            jobs,
            data_dir: data_dir.into(),
        }
    }

    /// Estado de una tarea. Los estados terminales se entregan una sola vez:
    /// quien consigue sacar el handle se lleva el resultado.
    pub fn task_status(&self, key: &str) -> TaskStatus {
        let Some(handle) = self.tasks.get(key) else {
            return TaskStatus::Unknown;
        };

        match handle.state {
            TaskState::Pending | TaskState::Running => TaskStatus::InProgress,
            terminal => {
                if self.tasks.remove_handle(key).is_none() {
                    // otro poll lo consumió entre el get y el remove
                    return TaskStatus::Unknown;
                }
                let result = self.tasks.remove_result(key);
                debug!("tarea {} entregada en estado {:?}", key, terminal);

                match terminal {
                    TaskState::Completed => TaskStatus::Completed {
                        result: result.unwrap_or_else(|| StageResult::ok("completed")),
                    },
                    TaskState::Faulted => TaskStatus::Faulted {
                        result: result.unwrap_or_else(|| StageResult::internal_error("faulted")),
                    },
                    _ => TaskStatus::Cancelled,
                }
            }
        }
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobStatusView, JobStoreError> {
        let Some(job) = self.jobs.get(job_id)? else {
            return Ok(JobStatusView::NoSuchJob);
        };

        Ok(match job.run_status {
            RunStatus::InQueue => JobStatusView::InQueue,
            RunStatus::Processing => JobStatusView::Processing,
            RunStatus::Success => JobStatusView::Success {
                artifact_available: !self.workspace(job_id).package_files()?.is_empty(),
            },
            RunStatus::Error => JobStatusView::Error {
                reason: job.error_message.unwrap_or_default(),
            },
        })
    }

    pub fn workspace(&self, job_id: &str) -> JobWorkspace {
        JobWorkspace::for_job(&self.data_dir, job_id)
    }

    /// Borra todo rastro de un job: registro, directorio y tareas (el job y
    /// sus etapas). Devuelve el registro si existía.
    pub async fn purge_job(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        let removed = self.jobs.remove(job_id)?;

        let children = self.tasks.remove_with_children(job_id);
        self.tasks.remove_result(job_id);
        for child in &children {
            self.tasks.remove_result(child);
        }

        if let Err(e) = self.workspace(job_id).remove().await {
            warn!("no se pudo borrar el directorio del job {}: {}", job_id, e);
        }

        if removed.is_some() {
            info!("job {} purgado ({} tareas)", job_id, children.len());
        }
        Ok(removed)
    }

    /// Purga los jobs en Error que terminaron hace más de `retention`.
    /// Devuelve los ids purgados.
    pub async fn purge_expired_errors(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let Ok(retention) = ChronoDuration::from_std(retention) else {
            return Ok(Vec::new());
        };

        let expired: Vec<JobId> = self
            .jobs
            .list()?
            .into_iter()
            .filter(|job| job.run_status == RunStatus::Error)
            .filter(|job| {
                let ended = job.finish_time.or(job.start_time).unwrap_or(job.call_time);
                now - ended > retention
            })
            .map(|job| job.id)
            .collect();

        for id in &expired {
            self.purge_job(id).await?;
        }
        if !expired.is_empty() {
            info!("{} jobs en Error purgados por retención", expired.len());
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dag::{watershed_package_dag, PACKAGE_STAGE};
    use crate::pipeline::tests::{registry_for, sample_job, temp_dir, FakeScripts};
    use crate::pipeline::PipelineExecutor;
    use crate::queue::JobQueueManager;
    use crate::store::MemoryJobStore;
    use crate::task::{stage_task_key, TaskHandle};
    use chrono::Utc;
    use std::time::Duration;

    fn reporter(sub: &str) -> (StatusReporter, Arc<TaskStore>, Arc<MemoryJobStore>) {
        let tasks = Arc::new(TaskStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let r = StatusReporter::new(tasks.clone(), jobs.clone(), temp_dir(sub));
        (r, tasks, jobs)
    }

    #[test]
    fn poll_doble_tras_completar_entrega_una_sola_vez() {
        let (r, tasks, _) = reporter("twice");
        tasks.set("job:dem", TaskHandle::pending("job:dem"));
        assert_eq!(r.task_status("job:dem"), TaskStatus::InProgress);

        tasks.set_state("job:dem", TaskState::Running);
        assert_eq!(r.task_status("job:dem"), TaskStatus::InProgress);

        tasks.finish("job:dem", TaskState::Completed, StageResult::ok("dem listo"));
        assert_eq!(
            r.task_status("job:dem"),
            TaskStatus::Completed {
                result: StageResult::ok("dem listo")
            }
        );
        assert_eq!(r.task_status("job:dem"), TaskStatus::Unknown);
        assert!(tasks.get_result("job:dem").is_none());
    }

    #[test]
    fn faulted_y_cancelled_tambien_se_consumen() {
        let (r, tasks, _) = reporter("faulted");
        tasks.set("a", TaskHandle::pending("a"));
        tasks.set("b", TaskHandle::pending("b"));
        tasks.finish("a", TaskState::Faulted, StageResult::internal_error("boom"));
        tasks.finish("b", TaskState::Cancelled, StageResult::cancelled());

        match r.task_status("a") {
            TaskStatus::Faulted { result } => assert_eq!(result.message, "boom"),
            other => panic!("se esperaba Faulted, vino {:?}", other),
        }
        assert_eq!(r.task_status("b"), TaskStatus::Cancelled);
        assert_eq!(r.task_status("a"), TaskStatus::Unknown);
        assert_eq!(r.task_status("b"), TaskStatus::Unknown);
        assert_eq!(tasks.result_count(), 0);
    }

    #[test]
    fn job_status_refleja_el_registro() {
        let (r, _, jobs) = reporter("job_status");
        assert_eq!(r.job_status("nope").unwrap(), JobStatusView::NoSuchJob);

        let mut job = sample_job();
        jobs.insert(job.clone()).unwrap();
        assert_eq!(r.job_status(&job.id).unwrap(), JobStatusView::InQueue);

        job.run_status = RunStatus::Error;
        job.error_message = Some("processing took too long".into());
        jobs.update(&job).unwrap();
        assert_eq!(
            r.job_status(&job.id).unwrap(),
            JobStatusView::Error {
                reason: "processing took too long".into()
            }
        );
    }

    #[tokio::test]
    async fn purge_expired_errors_solo_borra_errores_viejos() {
        let (r, tasks, jobs) = reporter("retention");
        let now = Utc::now();

        let mut old_error = sample_job();
        old_error.run_status = RunStatus::Error;
        old_error.finish_time = Some(now - chrono::Duration::hours(3));
        jobs.insert(old_error.clone()).unwrap();
        tasks.set(&old_error.id, TaskHandle::new(old_error.id.clone(), TaskState::Faulted));
        let ws = r.workspace(&old_error.id);
        ws.prepare().await.unwrap();

        let mut fresh_error = sample_job();
        fresh_error.run_status = RunStatus::Error;
        fresh_error.finish_time = Some(now - chrono::Duration::minutes(10));
        jobs.insert(fresh_error.clone()).unwrap();

        let mut old_success = sample_job();
        old_success.run_status = RunStatus::Success;
        old_success.finish_time = Some(now - chrono::Duration::hours(3));
        jobs.insert(old_success.clone()).unwrap();

        let purged = r
            .purge_expired_errors(now, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(purged, vec![old_error.id.clone()]);
        assert!(jobs.get(&old_error.id).unwrap().is_none());
        assert!(tasks.get(&old_error.id).is_none());
        assert!(!ws.root.exists());
        assert!(jobs.get(&fresh_error.id).unwrap().is_some());
        assert!(jobs.get(&old_success.id).unwrap().is_some());
    }

    #[test]
    fn task_status_se_serializa_con_tag() {
        let json = serde_json::to_value(TaskStatus::Completed {
            result: StageResult::ok("ok"),
        })
        .unwrap();
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["result"]["status"], "OK");
    }

    /// Escenario completo: un job de 2013-01-01 a 2013-01-10 cada 6h con
    /// fallo inyectado en slope, y otro igual sin fallos.
    #[tokio::test]
    async fn escenario_fallo_en_slope_y_escenario_exitoso() {
        let data_dir = temp_dir("scenario");
        let dag = watershed_package_dag();
        let tasks = Arc::new(TaskStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let clock = ManualClock::new(Utc::now());

        let failing = Arc::new(FakeScripts::failing(&["slope"]));
        let executor =
            PipelineExecutor::new(dag.clone(), registry_for(&dag, failing), tasks.clone(), &data_dir)
                .unwrap();
        let queue = JobQueueManager::new(
            crate::job::ServiceKind::model_package(),
            jobs.clone(),
            executor.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(600),
        );
        let r = StatusReporter::new(tasks.clone(), jobs.clone(), &data_dir);

        let job = sample_job();
        jobs.insert(job.clone()).unwrap();
        assert_eq!(queue.try_run_next().unwrap(), 1);
        queue.wait_for_running().await;

        match r.job_status(&job.id).unwrap() {
            JobStatusView::Error { reason } => assert!(reason.contains("slope")),
            other => panic!("se esperaba Error, vino {:?}", other),
        }
        assert!(!r.workspace(&job.id).root.exists());

        let order: Vec<String> = dag
            .topological_order()
            .unwrap()
            .iter()
            .map(|n| n.id.clone())
            .collect();
        let slope_at = order.iter().position(|s| s == "slope").unwrap();
        for stage in order.iter().skip(slope_at + 1).chain(std::iter::once(&PACKAGE_STAGE.to_string())) {
            assert_eq!(
                r.task_status(&stage_task_key(&job.id, stage)),
                TaskStatus::Cancelled,
                "{}",
                stage
            );
        }

        // mismo job sin fallos
        let ok = Arc::new(FakeScripts::default());
        let executor =
            PipelineExecutor::new(dag.clone(), registry_for(&dag, ok), tasks.clone(), &data_dir)
                .unwrap();
        let queue = JobQueueManager::new(
            crate::job::ServiceKind::model_package(),
            jobs.clone(),
            executor,
            Arc::new(clock.clone()),
            Duration::from_secs(600),
        );

        let job = sample_job();
        jobs.insert(job.clone()).unwrap();
        assert_eq!(queue.try_run_next().unwrap(), 1);
        queue.wait_for_running().await;

        assert_eq!(
            r.job_status(&job.id).unwrap(),
            JobStatusView::Success {
                artifact_available: true
            }
        );
        assert_eq!(r.workspace(&job.id).package_files().unwrap().len(), 1);

        // retirar el artefacto purga el job
        assert!(r.purge_job(&job.id).await.unwrap().is_some());
        assert_eq!(r.job_status(&job.id).unwrap(), JobStatusView::NoSuchJob);
        assert!(!r.workspace(&job.id).root.exists());
        assert_eq!(
            r.task_status(&stage_task_key(&job.id, "dem")),
            TaskStatus::Unknown
        );
        assert_eq!(r.task_status(&job.id), TaskStatus::Unknown);
    }
}
