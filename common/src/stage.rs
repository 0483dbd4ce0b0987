use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::dag::StageNode;
use crate::job::{JobId, PackageRequest};
use crate::results::StageResult;
use crate::workspace::JobWorkspace;

/// Cuántos caracteres del final de stderr van al mensaje de error.
const STDERR_TAIL_CHARS: usize = 400;

/// Bandera de cancelación compartida por toda una corrida.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Levanta la bandera. Devuelve true sólo para quien la levantó primero.
    pub fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Todo lo que una etapa necesita para ejecutarse.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    pub node: StageNode,
    pub request: PackageRequest,
    pub workspace: JobWorkspace,
    pub cancel: CancelFlag,
}

impl StageContext {
    pub fn stage(&self) -> &str {
        &self.node.id
    }
}

/// Lo que devuelve el colaborador externo. El éxito lo decide el estado de
/// salida; stdout/stderr quedan sólo para diagnóstico.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CollaboratorOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn stderr_tail(&self) -> &str {
        let s = self.stderr.trim_end();
        if s.chars().count() <= STDERR_TAIL_CHARS {
            return s;
        }
        let skip = s.chars().count() - STDERR_TAIL_CHARS;
        match s.char_indices().nth(skip) {
            Some((idx, _)) => &s[idx..],
            None => s,
        }
    }
}

/// Colaborador externo de una etapa (script, proceso nativo, etc.).
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn invoke(&self, ctx: &StageContext) -> anyhow::Result<CollaboratorOutput>;
}

/// Ejecuta `<interpreter> <script> --stage ... --work-dir ...` y captura su salida.
#[derive(Debug, Clone)]
pub struct ScriptCollaborator {
    interpreter: String,
    script: PathBuf,
}

impl ScriptCollaborator {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }

    /// Convención: un script `<etapa>.py` por etapa dentro de `scripts_dir`.
    pub fn for_stage(interpreter: &str, scripts_dir: &Path, stage: &str) -> Self {
        Self::new(interpreter, scripts_dir.join(format!("{}.py", stage)))
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    fn args(&self, ctx: &StageContext) -> Vec<String> {
        let req = &ctx.request;
        let mut args = vec![
            self.script.to_string_lossy().to_string(),
            "--stage".to_string(),
            ctx.stage().to_string(),
            "--work-dir".to_string(),
            ctx.workspace.intermediate.to_string_lossy().to_string(),
            "--package-dir".to_string(),
            ctx.workspace.package.to_string_lossy().to_string(),
            "--start-date".to_string(),
            req.start_date.to_string(),
            "--end-date".to_string(),
            req.end_date.to_string(),
            "--time-step".to_string(),
            req.time_step_hours.to_string(),
        ];
        for (k, v) in &req.params {
            args.push(format!("--{}", k));
            args.push(v.clone());
        }
        args
    }
}

#[async_trait]
impl Collaborator for ScriptCollaborator {
    async fn invoke(&self, ctx: &StageContext) -> anyhow::Result<CollaboratorOutput> {
        let args = self.args(ctx);
        debug!("lanzando {} {:?}", self.interpreter, args);

        // kill_on_drop: si la etapa se aborta por timeout, el proceso muere con ella
        let output = Command::new(&self.interpreter)
            .args(&args)
            .current_dir(&ctx.workspace.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CollaboratorOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Ejecuta una etapa: cancelación, precondiciones, una invocación externa y
/// clasificación del resultado. Nunca propaga errores: todo sale como StageResult.
#[derive(Debug, Clone, Default)]
pub struct StageRunner {
    timeout: Option<Duration>,
}

impl StageRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn run(&self, collaborator: Arc<dyn Collaborator>, ctx: StageContext) -> StageResult {
        let stage = ctx.stage().to_string();
        let job_id = ctx.job_id.clone();

        // 1) cancelación primero, sin efectos
        if ctx.cancel.is_raised() {
            debug!("etapa {} del job {} cancelada antes de empezar", stage, job_id);
            return StageResult::cancelled();
        }

        // 2) precondiciones: lo que la etapa necesita de etapas anteriores
        for required in &ctx.node.requires {
            let path = ctx.workspace.intermediate.join(required);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                warn!(
                    "etapa {} del job {}: falta precondición {}",
                    stage,
                    job_id,
                    path.display()
                );
                return StageResult::not_found(format!(
                    "stage '{}' requires '{}' which was not found",
                    stage, required
                ));
            }
        }

        // 3) una sola invocación externa, en su propia tarea para aislar panics
        let handle = tokio::spawn(async move { collaborator.invoke(&ctx).await });
        let joined = match self.timeout {
            Some(limit) => {
                let abort = handle.abort_handle();
                match tokio::time::timeout(limit, handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        error!(
                            "etapa {} del job {} superó el timeout de {:?}, abortada",
                            stage, job_id, limit
                        );
                        return StageResult::internal_error(format!(
                            "stage '{}' timed out after {}s",
                            stage,
                            limit.as_secs()
                        ));
                    }
                }
            }
            None => handle.await,
        };

        // 4) clasificación según el estado de salida
        match joined {
            Ok(Ok(out)) if out.success => StageResult::ok(format!("stage '{}' completed", stage)),
            Ok(Ok(out)) => {
                error!(
                    "etapa {} del job {} falló (exit={:?}): {}",
                    stage,
                    job_id,
                    out.exit_code,
                    out.stderr_tail()
                );
                let code = out
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                StageResult::internal_error(format!(
                    "stage '{}' failed (exit {}): {}",
                    stage,
                    code,
                    out.stderr_tail()
                ))
            }
            Ok(Err(e)) => {
                error!("etapa {} del job {}: error invocando colaborador: {:#}", stage, job_id, e);
                StageResult::internal_error(format!("stage '{}' failed: {:#}", stage, e))
            }
            Err(e) => {
                error!("panic o join error en etapa {} del job {}: {:?}", stage, job_id, e);
                StageResult::internal_error(format!("stage '{}' aborted: {}", stage, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::StageStatusCode;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicUsize;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir()
            .join("stage_tests")
            .join(sub)
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&base).unwrap();
        base
    }

    async fn context(sub: &str, node: StageNode) -> StageContext {
        let ws = JobWorkspace::for_job(&temp_dir(sub), "job-1");
        ws.prepare().await.unwrap();
        StageContext {
            job_id: "job-1".to_string(),
            node,
            request: PackageRequest::new(
                NaiveDate::from_ymd_opt(2013, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2013, 1, 10).unwrap(),
                6,
            ),
            workspace: ws,
            cancel: CancelFlag::new(),
        }
    }

    struct Counting {
        calls: AtomicUsize,
        output: CollaboratorOutput,
    }

    impl Counting {
        fn new(output: CollaboratorOutput) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                output,
            })
        }
    }

    #[async_trait]
    impl Collaborator for Counting {
        async fn invoke(&self, _ctx: &StageContext) -> anyhow::Result<CollaboratorOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl Collaborator for Failing {
        async fn invoke(&self, _ctx: &StageContext) -> anyhow::Result<CollaboratorOutput> {
            anyhow::bail!("gdal no disponible")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Collaborator for Panicking {
        async fn invoke(&self, _ctx: &StageContext) -> anyhow::Result<CollaboratorOutput> {
            panic!("boom")
        }
    }

    struct Sleeping;

    #[async_trait]
    impl Collaborator for Sleeping {
        async fn invoke(&self, _ctx: &StageContext) -> anyhow::Result<CollaboratorOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(CollaboratorOutput::succeeded(""))
        }
    }

    #[test]
    fn cancel_flag_solo_el_primero_gana() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!flag.is_raised());
        assert!(other.raise());
        assert!(!flag.raise());
        assert!(flag.is_raised());
    }

    #[test]
    fn stderr_tail_recorta_el_principio() {
        let long = "x".repeat(1000) + "final";
        let out = CollaboratorOutput::failed(Some(1), long);
        let tail = out.stderr_tail();
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
        assert!(tail.ends_with("final"));
    }

    #[tokio::test]
    async fn cancelada_no_invoca_al_colaborador() {
        let ctx = context("cancel", StageNode::new("slope", &[], &[])).await;
        ctx.cancel.raise();
        let collab = Counting::new(CollaboratorOutput::succeeded(""));

        let result = StageRunner::default().run(collab.clone(), ctx).await;

        assert!(result.is_cancelled());
        assert_eq!(result.status, StageStatusCode::BadRequest);
        assert_eq!(collab.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn precondicion_faltante_es_not_found() {
        let ctx = context("precond", StageNode::new("slope", &["dem.tif"], &[])).await;
        let collab = Counting::new(CollaboratorOutput::succeeded(""));

        let result = StageRunner::default().run(collab.clone(), ctx).await;

        assert_eq!(result.status, StageStatusCode::NotFound);
        assert!(result.message.contains("dem.tif"));
        assert_eq!(collab.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn salida_exitosa_es_ok_aunque_stdout_diga_exception() {
        let ctx = context("ok", StageNode::new("dem", &[], &["dem.tif"])).await;
        let collab = Counting::new(CollaboratorOutput::succeeded("Exception ignorada por el script"));

        let result = StageRunner::default().run(collab.clone(), ctx).await;

        assert!(result.is_ok());
        assert_eq!(collab.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn salida_con_error_es_internal_server_error() {
        let ctx = context("exit", StageNode::new("slope", &[], &[])).await;
        let collab = Counting::new(CollaboratorOutput::failed(Some(2), "Traceback: sin memoria"));

        let result = StageRunner::default().run(collab, ctx).await;

        assert_eq!(result.status, StageStatusCode::InternalServerError);
        assert!(result.message.contains("slope"));
        assert!(result.message.contains("sin memoria"));
    }

    #[tokio::test]
    async fn errores_y_panics_del_colaborador_no_escapan() {
        let ctx = context("err", StageNode::new("wind_point", &[], &[])).await;
        let result = StageRunner::default().run(Arc::new(Failing), ctx).await;
        assert_eq!(result.status, StageStatusCode::InternalServerError);
        assert!(result.message.contains("gdal no disponible"));

        let ctx = context("panic", StageNode::new("wind_point", &[], &[])).await;
        let result = StageRunner::default().run(Arc::new(Panicking), ctx).await;
        assert_eq!(result.status, StageStatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn timeout_aborta_la_etapa() {
        let ctx = context("timeout", StageNode::new("dem", &[], &[])).await;
        let runner = StageRunner::new(Some(Duration::from_millis(50)));

        let result = runner.run(Arc::new(Sleeping), ctx).await;

        assert_eq!(result.status, StageStatusCode::InternalServerError);
        assert!(result.message.contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_mata_el_proceso_del_script() {
        let dir = temp_dir("script_timeout");
        let marker = dir.join("terminado");
        let script = dir.join("lento.sh");
        std::fs::write(&script, format!("sleep 1\ntouch '{}'\n", marker.display())).unwrap();

        let ctx = context("script_timeout_ctx", StageNode::new("dem", &[], &[])).await;
        let runner = StageRunner::new(Some(Duration::from_millis(100)));
        let result = runner
            .run(Arc::new(ScriptCollaborator::new("sh", &script)), ctx)
            .await;

        assert_eq!(result.status, StageStatusCode::InternalServerError);
        assert!(result.message.contains("timed out"));

        // si el proceso siguiera vivo, el marcador aparecería al segundo
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_collaborator_usa_el_codigo_de_salida() {
        let dir = temp_dir("script");
        let ok_script = dir.join("ok.sh");
        let bad_script = dir.join("bad.sh");
        std::fs::write(&ok_script, "echo \"stage=$2\"\n").unwrap();
        std::fs::write(&bad_script, "echo roto >&2\nexit 3\n").unwrap();

        let ctx = context("script_ok", StageNode::new("dem", &[], &[])).await;
        let out = ScriptCollaborator::new("sh", &ok_script)
            .invoke(&ctx)
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "stage=dem");

        let ctx = context("script_bad", StageNode::new("dem", &[], &[])).await;
        let out = ScriptCollaborator::new("sh", &bad_script)
            .invoke(&ctx)
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "roto");
    }

    #[test]
    fn for_stage_arma_la_ruta_del_script() {
        let c = ScriptCollaborator::for_stage("python3", Path::new("/opt/scripts"), "slope");
        assert_eq!(c.script(), Path::new("/opt/scripts/slope.py"));
    }
}
