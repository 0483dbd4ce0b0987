use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use common::{
    ErrorResponse, Job, JobStatusResponse, JobStatusView, PackageRequest, RunNextResponse,
    TaskStatus, TaskStatusResponse,
};
use reqwest::{Client, Response};
use std::env;
use std::path::PathBuf;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master de paquetes de modelo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pide un paquete de modelo nuevo
    Submit {
        /// Fecha de inicio (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Fecha de fin (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,
        /// Paso temporal en horas (divisor de 24)
        #[arg(long, default_value_t = 6)]
        time_step: u32,
        /// Parámetros extra para los scripts, como clave=valor
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Lista los jobs conocidos
    Jobs,
    /// Consulta el estado persistido de un job
    JobStatus {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Consulta el estado de una tarea (se consume al terminar)
    TaskStatus {
        #[arg(value_name = "TASK_KEY")]
        key: String,
    },
    /// Descarga el paquete de un job terminado (y lo purga del master)
    Download {
        #[arg(value_name = "JOB_ID")]
        id: String,
        /// Archivo de salida
        #[arg(long, default_value = "model_package.zip")]
        output: PathBuf,
    },
    /// Le pide al master que admita el siguiente job de la cola
    RunNext,
}

/// Parsea `clave=valor`.
fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("parámetro inválido '{}', se espera clave=valor", raw)),
    }
}

async fn error_text(resp: Response) -> String {
    let status = resp.status();
    match resp.json::<ErrorResponse>().await {
        Ok(e) => format!("{} ({})", e.error, status),
        Err(_) => format!("status {}", status),
    }
}

fn print_job(job: &Job) {
    println!("  id: {}", job.id);
    println!("  servicio: {}", job.service_kind);
    println!("  estado: {:?}", job.run_status);
    println!(
        "  rango: {} a {} cada {}h",
        job.request.start_date, job.request.end_date, job.request.time_step_hours
    );
    for (k, v) in &job.request.params {
        println!("  param {}: {}", k, v);
    }
    println!("  call_time: {}", job.call_time);
    if let Some(ref started) = job.start_time {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finish_time {
        println!("  finalizado: {}", done);
    }
    if let Some(ref msg) = job.error_message {
        println!("  error: {}", msg);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            start,
            end,
            time_step,
            params,
        } => {
            let mut req = PackageRequest::new(start, end, time_step);
            req.params.extend(params);
            // mismo chequeo que hace el master, para fallar antes de llamar
            req.validate().map_err(|e| anyhow!("petición inválida: {}", e))?;

            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                return Err(anyhow!("el master rechazó el job: {}", error_text(resp).await));
            }
            let job: Job = resp.json().await?;
            println!("Job creado:");
            print_job(&job);
        }

        Commands::Jobs => {
            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                return Err(anyhow!("error listando jobs: {}", error_text(resp).await));
            }
            let jobs: Vec<Job> = resp.json().await?;
            if jobs.is_empty() {
                println!("No hay jobs.");
            }
            for job in &jobs {
                println!("Job {}", job.id);
                print_job(job);
                println!();
            }
        }

        Commands::JobStatus { id } => {
            let url = format!("{}/api/v1/job-status/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            let status: JobStatusResponse = resp.json().await?;
            println!("Job {}: {}", status.job_id, status.message);
            match status.status {
                JobStatusView::Success { artifact_available } => {
                    println!("  paquete disponible: {}", artifact_available)
                }
                JobStatusView::Error { reason } => println!("  motivo: {}", reason),
                _ => {}
            }
        }

        Commands::TaskStatus { key } => {
            let url = format!("{}/api/v1/task-status/{}", base_url, key);
            let resp = client.get(&url).send().await?;
            let status: TaskStatusResponse = resp.json().await?;
            println!("Tarea {}: {}", status.task_key, status.message);
            match status.status {
                TaskStatus::Completed { result } | TaskStatus::Faulted { result } => {
                    println!("  resultado: {:?} {}", result.status, result.message)
                }
                _ => {}
            }
        }

        Commands::Download { id, output } => {
            let url = format!("{}/api/v1/jobs/{}/package", base_url, id);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                return Err(anyhow!("no se pudo descargar el paquete: {}", error_text(resp).await));
            }
            let bytes = resp.bytes().await?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("escribiendo {}", output.display()))?;
            println!(
                "Paquete del job {} guardado en {} ({} bytes)",
                id,
                output.display(),
                bytes.len()
            );
        }

        Commands::RunNext => {
            let url = format!("{}/api/v1/queue/next", base_url);
            let resp = client.post(&url).send().await?;
            if !resp.status().is_success() {
                return Err(anyhow!("error en run-next: {}", error_text(resp).await));
            }
            let next: RunNextResponse = resp.json().await?;
            println!("Jobs arrancados: {}", next.started);
        }
    }

    Ok(())
}
