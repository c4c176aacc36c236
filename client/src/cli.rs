use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use sumflow::config::env_string;
use sumflow::{
    ErrorBody, ErrorKind, SegmentRecord, SubmitRequest, SubmitResponse, TaskSnapshot,
};

#[derive(Parser)]
#[command(name = "sumflow")]
#[command(about = "CLI para enviar y seguir tareas del master")]
struct Cli {
    /// URL del master (por defecto MASTER_URL o http://localhost:8080)
    #[arg(long, global = true)]
    master: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una fuente (ruta o URL) para procesar
    Submit {
        #[arg(value_name = "SOURCE")]
        source: String,
    },
    /// Estado y progreso de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Estado de cada segmento
    Segments {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Imprime el resumen final
    Result {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Cancela una tarea en curso
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Espera a que la tarea termine
    Wait {
        #[arg(value_name = "TASK_ID")]
        id: String,

        /// Segundos entre consultas
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let base_url = cli
        .master
        .unwrap_or_else(|| env_string("MASTER_URL", "http://localhost:8080"));
    let base_url = base_url.trim_end_matches('/').to_string();
    let client = Client::new();

    match cli.command {
        Commands::Submit { source } => {
            let resp = client
                .post(format!("{}/api/v1/tasks", base_url))
                .json(&SubmitRequest { source_ref: source })
                .send()
                .await?;
            let SubmitResponse { task_id } = parse(resp).await?;
            println!("Tarea creada: {}", task_id);
        }
        Commands::Status { id } => {
            let snap = status(&client, &base_url, &id).await?;
            print_status(&snap);
        }
        Commands::Segments { id } => {
            let resp = client
                .get(format!("{}/api/v1/tasks/{}/segments", base_url, id))
                .send()
                .await?;
            let segments: Vec<SegmentRecord> = parse(resp).await?;
            println!("{:>6}  {:<10}  {:>8}  resultado / error", "índice", "estado", "intentos");
            for s in segments {
                let detail = s.result_ref.or(s.error).unwrap_or_default();
                println!(
                    "{:>6}  {:<10}  {:>8}  {}",
                    s.segment_index,
                    format!("{:?}", s.status).to_uppercase(),
                    s.attempts,
                    detail
                );
            }
        }
        Commands::Result { id } => {
            let resp = client
                .get(format!("{}/api/v1/tasks/{}/summary", base_url, id))
                .send()
                .await?;
            if resp.status().is_success() {
                print!("{}", resp.text().await?);
            } else {
                let err: ErrorBody = resp.json().await?;
                if err.kind == ErrorKind::NotReady {
                    println!("Todavía no está listo: {}", err.message);
                } else {
                    bail!("{}", err.message);
                }
            }
        }
        Commands::Cancel { id } => {
            let resp = client
                .post(format!("{}/api/v1/tasks/{}/cancel", base_url, id))
                .send()
                .await?;
            let snap: TaskSnapshot = parse(resp).await?;
            println!("Tarea {} -> {:?}", snap.task.task_id, snap.task.status);
        }
        Commands::Wait { id, interval } => loop {
            let snap = status(&client, &base_url, &id).await?;
            if snap.task.status.is_terminal() {
                print_status(&snap);
                break;
            }
            println!(
                "{:?} {}/{}",
                snap.task.status,
                snap.task.processed_count,
                snap.task
                    .segment_count
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".into())
            );
            tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
        },
    }

    Ok(())
}

async fn status(client: &Client, base_url: &str, id: &str) -> Result<TaskSnapshot> {
    let resp = client
        .get(format!("{}/api/v1/tasks/{}", base_url, id))
        .send()
        .await?;
    parse(resp).await
}

/// JSON si la respuesta es 2xx; si no, el mensaje de error del master.
async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    match resp.json::<ErrorBody>().await {
        Ok(err) => bail!("{}", err.message),
        Err(_) => bail!("el master respondió {}", status),
    }
}

fn print_status(snap: &TaskSnapshot) {
    let t = &snap.task;
    println!("Tarea:");
    println!("  id: {}", t.task_id);
    println!("  fuente: {}", t.source_ref);
    println!("  estado: {:?}", t.status);
    match (t.segment_count, snap.progress_percent) {
        (Some(n), Some(p)) => println!("  progreso: {}/{} ({:.1}%)", t.processed_count, n, p),
        _ => println!("  progreso: -"),
    }
    println!("  enviada: {}", t.submitted_at);
    if let Some(s) = t.started_at {
        println!("  iniciada: {}", s);
    }
    if let Some(f) = t.finished_at {
        println!("  terminada: {}", f);
    }
    if let Some(r) = &t.result_ref {
        println!("  resultado: {}", r);
    }
    if let Some(e) = &t.error {
        println!("  error: {}", e);
    }
}
