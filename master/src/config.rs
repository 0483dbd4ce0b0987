use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use common::ExecutionStrategy;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DATA_DIR: &str = "/data/jobs";
const DEFAULT_SCRIPTS_DIR: &str = "/opt/hydro/scripts";
const DEFAULT_INTERPRETER: &str = "python3";
const DEFAULT_STALENESS_SECS: u64 = 7200;
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 10;
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_PARALLELISM: usize = 4;
const DEFAULT_ERROR_RETENTION_SECS: u64 = 7 * 24 * 3600;

/// Configuración del master, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub jobs_db: PathBuf,
    pub scripts_dir: PathBuf,
    pub interpreter: String,
    pub staleness: Duration,
    pub scheduler_interval: Duration,
    /// None = sin timeout por etapa.
    pub stage_timeout: Option<Duration>,
    pub strategy: ExecutionStrategy,
    /// Cuánto se conservan los jobs en Error; None = para siempre.
    pub error_retention: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una función de búsqueda (para tests).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(
            lookup("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
        );
        let jobs_db = lookup("JOBS_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("jobs.json"));

        let stage_timeout_secs: u64 =
            parse_or(&lookup, "STAGE_TIMEOUT_SECS", DEFAULT_STAGE_TIMEOUT_SECS);
        let parallelism: usize = parse_or(&lookup, "PARALLELISM", DEFAULT_PARALLELISM);
        let error_retention_secs: u64 =
            parse_or(&lookup, "ERROR_RETENTION_SECS", DEFAULT_ERROR_RETENTION_SECS);

        let strategy = match lookup("EXECUTION_MODE").as_deref() {
            None | Some("serial") => ExecutionStrategy::Serial,
            Some("parallel") => ExecutionStrategy::Parallel {
                max_concurrency: parallelism.max(1),
            },
            Some(other) => {
                warn!("EXECUTION_MODE={} no reconocido, uso serial", other);
                ExecutionStrategy::Serial
            }
        };

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            jobs_db,
            data_dir,
            scripts_dir: PathBuf::from(
                lookup("SCRIPTS_DIR").unwrap_or_else(|| DEFAULT_SCRIPTS_DIR.to_string()),
            ),
            interpreter: lookup("SCRIPT_INTERPRETER")
                .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string()),
            staleness: Duration::from_secs(parse_or(
                &lookup,
                "STALENESS_SECS",
                DEFAULT_STALENESS_SECS,
            )),
            scheduler_interval: Duration::from_secs(
                parse_or(&lookup, "SCHEDULER_INTERVAL_SECS", DEFAULT_SCHEDULER_INTERVAL_SECS)
                    .max(1),
            ),
            stage_timeout: (stage_timeout_secs > 0).then(|| Duration::from_secs(stage_timeout_secs)),
            strategy,
            error_retention: (error_retention_secs > 0)
                .then(|| Duration::from_secs(error_retention_secs)),
        }
    }
}

/// Lee y parsea una variable; si falta o es inválida, usa el default.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{}={} inválido, uso el valor por defecto", key, raw);
            default
        }),
        None => default,
    }
}
