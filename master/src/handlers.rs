use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    ErrorResponse, Job, JobStatusResponse, JobStatusView, PackageRequest, RunNextResponse,
    RunStatus, TaskStatus, TaskStatusResponse,
};
use glob::glob;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(code: StatusCode, msg: impl Into<String>) -> ApiError {
    (code, Json(ErrorResponse { error: msg.into() }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:id/package", get(download_package))
        .route("/api/v1/job-status/:id", get(job_status))
        .route("/api/v1/task-status/:key", get(task_status))
        .route("/api/v1/queue/next", post(run_next))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Valida la petición, deja el job en cola y le da un empujón a la cola
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<PackageRequest>,
) -> Result<Json<Job>, ApiError> {
    if let Err(e) = req.validate() {
        warn!("petición rechazada: {}", e);
        return Err(api_error(StatusCode::BAD_REQUEST, e.to_string()));
    }

    let job = Job::new_queued(state.queue.kind().clone(), req, state.clock.now());
    state.jobs.insert(job.clone()).map_err(|e| {
        error!("no se pudo guardar el job {}: {}", job.id, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    info!(
        "job {} en cola ({} a {}, paso {}h)",
        job.id, job.request.start_date, job.request.end_date, job.request.time_step_hours
    );

    // si no hay otro procesando arranca ya; si no, lo levanta el scheduler
    if let Err(e) = state.queue.clone().try_run_next_blocking().await {
        warn!("try_run_next tras crear job {}: {}", job.id, e);
    }

    Ok(Json(job))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    state
        .jobs
        .list()
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Estado persistido del job (lectura idempotente)
async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobStatusResponse>), ApiError> {
    let view = state
        .reporter
        .job_status(&id)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let code = match view {
        JobStatusView::NoSuchJob => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok((
        code,
        Json(JobStatusResponse {
            job_id: id,
            message: view.describe().to_string(),
            status: view,
        }),
    ))
}

// Estado de una tarea; los estados terminales se consumen al leerlos
async fn task_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> (StatusCode, Json<TaskStatusResponse>) {
    let status = state.reporter.task_status(&key);
    let code = match &status {
        TaskStatus::Unknown => StatusCode::NOT_FOUND,
        TaskStatus::InProgress => StatusCode::ACCEPTED,
        TaskStatus::Completed { .. } => StatusCode::OK,
        TaskStatus::Faulted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        TaskStatus::Cancelled => StatusCode::CONFLICT,
    };
    (
        code,
        Json(TaskStatusResponse {
            task_key: key,
            message: status.describe().to_string(),
            status,
        }),
    )
}

// Entrega el paquete de un job terminado y purga todo lo del job
async fn download_package(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .jobs
        .get(&id)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no such job {}", id)))?;

    if job.run_status != RunStatus::Success {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("job {} is {:?}, no package available", id, job.run_status),
        ));
    }

    let artifact = find_artifact(&state, &id)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("job {} has no package", id)))?;
    let bytes = tokio::fs::read(&artifact)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    // quien purga primero se lo lleva
    let purged = state
        .reporter
        .purge_job(&id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if purged.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("no such job {}", id)));
    }

    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "package.zip".to_string());
    info!("paquete {} del job {} entregado ({} bytes)", file_name, id, bytes.len());

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        bytes,
    )
        .into_response())
}

fn find_artifact(state: &AppState, job_id: &str) -> Result<Option<PathBuf>, ApiError> {
    let package_dir = state.reporter.workspace(job_id).package;
    let pattern = format!("{}/*", package_dir.display());
    let entries = glob(&pattern)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut files: Vec<PathBuf> = entries.flatten().filter(|p| p.is_file()).collect();
    files.sort();
    if files.len() > 1 {
        warn!("job {} tiene {} archivos en el paquete, entrego el primero", job_id, files.len());
    }
    Ok(files.into_iter().next())
}

async fn run_next(State(state): State<AppState>) -> Result<Json<RunNextResponse>, ApiError> {
    let started = state
        .queue
        .clone()
        .try_run_next_blocking()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(RunNextResponse { started }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use common::{
        stage_task_key, watershed_package_dag, Collaborator, CollaboratorOutput, MemoryJobStore,
        StageContext, StageRegistry, SystemClock, PACKAGE_STAGE,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Etapa falsa: escribe los archivos que produce, o falla si se le pide.
    struct FakeStage {
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Collaborator for FakeStage {
        async fn invoke(&self, ctx: &StageContext) -> anyhow::Result<CollaboratorOutput> {
            if self.fail_on == Some(ctx.stage()) {
                return Ok(CollaboratorOutput::failed(Some(1), "falla inyectada"));
            }
            let dir = if ctx.stage() == PACKAGE_STAGE {
                &ctx.workspace.package
            } else {
                &ctx.workspace.intermediate
            };
            for file in &ctx.node.produces {
                tokio::fs::write(dir.join(file), ctx.stage()).await?;
            }
            Ok(CollaboratorOutput::succeeded("ok"))
        }
    }

    fn test_state(fail_on: Option<&'static str>) -> AppState {
        let data_dir = std::env::temp_dir()
            .join("master_handlers_tests")
            .join(uuid::Uuid::new_v4().to_string());
        let data = data_dir.to_string_lossy().to_string();
        let config = Config::from_lookup(|k| match k {
            "DATA_DIR" => Some(data.clone()),
            "STAGE_TIMEOUT_SECS" => Some("0".to_string()),
            _ => None,
        });

        let dag = watershed_package_dag();
        let fake: Arc<dyn Collaborator> = Arc::new(FakeStage { fail_on });
        let mut registry = StageRegistry::new();
        registry.register(PACKAGE_STAGE, fake.clone());
        for node in &dag.nodes {
            registry.register(&node.id, fake.clone());
        }

        AppState::new(
            config,
            Arc::new(MemoryJobStore::new()),
            registry,
            Arc::new(SystemClock),
        )
        .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let code = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (code, body.to_vec())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (code, body) = send(app, req).await;
        (code, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn submit(app: &Router, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/jobs")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (code, body) = send(app, req).await;
        (code, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn scenario_request() -> Value {
        json!({"start_date": "2013-01-01", "end_date": "2013-01-10", "time_step_hours": 6})
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let app = build_router(test_state(None));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (code, body) = send(&app, req).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn create_job_rechaza_fechas_y_paso_invalidos() {
        let app = build_router(test_state(None));

        let (code, body) = submit(
            &app,
            json!({"start_date": "2013-01-10", "end_date": "2013-01-01", "time_step_hours": 6}),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (code, _) = submit(
            &app,
            json!({"start_date": "2013-01-01", "end_date": "2013-01-10", "time_step_hours": 5}),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, body) = get_json(&app, "/api/v1/jobs").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn task_desconocida_da_404() {
        let app = build_router(test_state(None));
        let (code, st) = get_json(&app, "/api/v1/task-status/nada:dem").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(st["status"], "UNKNOWN");
        assert_eq!(st["task_key"], "nada:dem");
    }

    #[tokio::test]
    async fn flujo_completo_exitoso_con_descarga_y_purga() {
        let state = test_state(None);
        let app = build_router(state.clone());

        let (code, job) = submit(&app, scenario_request()).await;
        assert_eq!(code, StatusCode::OK);
        let id = job["id"].as_str().unwrap().to_string();

        state.queue.wait_for_running().await;

        let (code, st) = get_json(&app, &format!("/api/v1/job-status/{}", id)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(st["status"], "SUCCESS");
        assert_eq!(st["artifact_available"], true);

        let dem = format!("/api/v1/task-status/{}", stage_task_key(&id, "dem"));
        let (code, st) = get_json(&app, &dem).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(st["status"], "COMPLETED");
        let (code, st) = get_json(&app, &dem).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(st["status"], "UNKNOWN");

        let req = Request::builder()
            .uri(format!("/api/v1/jobs/{}/package", id))
            .body(Body::empty())
            .unwrap();
        let (code, bytes) = send(&app, req).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(bytes, PACKAGE_STAGE.as_bytes());

        let (code, st) = get_json(&app, &format!("/api/v1/job-status/{}", id)).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(st["status"], "NO_SUCH_JOB");
        assert!(!state.reporter.workspace(&id).root.exists());

        // cola vacía: no arranca nada
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/queue/next")
            .body(Body::empty())
            .unwrap();
        let (code, body) = send(&app, req).await;
        assert_eq!(code, StatusCode::OK);
        let started: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(started["started"], 0);
    }

    #[tokio::test]
    async fn fallo_en_slope_reporta_error_y_etapas_canceladas() {
        let state = test_state(Some("slope"));
        let app = build_router(state.clone());

        let (_, job) = submit(&app, scenario_request()).await;
        let id = job["id"].as_str().unwrap().to_string();
        state.queue.wait_for_running().await;

        let (_, st) = get_json(&app, &format!("/api/v1/job-status/{}", id)).await;
        assert_eq!(st["status"], "ERROR");
        assert!(st["reason"].as_str().unwrap().contains("slope"));

        let slope = format!("/api/v1/task-status/{}", stage_task_key(&id, "slope"));
        let (code, st) = get_json(&app, &slope).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(st["status"], "FAULTED");

        let rh = format!("/api/v1/task-status/{}", stage_task_key(&id, "rh_grid"));
        let (code, st) = get_json(&app, &rh).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(st["status"], "CANCELLED");

        let req = Request::builder()
            .uri(format!("/api/v1/jobs/{}/package", id))
            .body(Body::empty())
            .unwrap();
        let (code, _) = send(&app, req).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert!(!state.reporter.workspace(&id).root.exists());
    }
}
