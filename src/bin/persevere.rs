//! persevere CLI — operator interface to the job store.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use persevere::config::Config;
use persevere::engine::Engine;
use persevere::model::{Job, JobId, NewJob, Status};
use persevere::reclaimer::{Reclaimer, ReclaimerConfig};
use persevere::store::{JobStore, ListFilter, PgStore};
use persevere::task::TaskRegistry;
use persevere::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "persevere", about = "Durable task execution over Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Defer a job
    Defer {
        /// Task name a worker process has a handler registered for
        task_name: String,
        /// JSON arguments for the handler
        #[arg(long)]
        args: Option<String>,
        #[arg(long, default_value = "default")]
        queue: String,
        /// Lower value is served first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Refuse a second live job carrying the same lock
        #[arg(long)]
        lock: Option<String>,
        /// Delay eligibility by this many seconds
        #[arg(long, default_value_t = 0)]
        delay_secs: u64,
    },
    /// Show a job's status
    Status {
        id: i64,
    },
    /// Show a job in full
    Show {
        id: i64,
    },
    /// List jobs, newest first
    List {
        /// Filter by status (todo, doing, succeeded, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Cancel a job no worker has picked up yet
    Cancel {
        id: i64,
    },
    /// One-shot sweep returning stalled leases to the ready state
    Reclaim {
        /// Override the configured stall threshold
        #[arg(long)]
        threshold_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "persevere".to_string(),
    })?;

    let pg = Arc::new(PgStore::connect(config.database_url.expose_secret()).await?);
    let store: Arc<dyn JobStore> = Arc::clone(&pg) as Arc<dyn JobStore>;
    // The CLI registers no handlers; it only drives the store side.
    let engine = Engine::new(store, Arc::new(TaskRegistry::new()), config.engine.clone());

    match cli.command {
        Command::Migrate => {
            pg.migrate().await?;
            println!("migrations applied");
        }
        Command::Defer {
            task_name,
            args,
            queue,
            priority,
            lock,
            delay_secs,
        } => {
            let mut new = NewJob::new(task_name).queue(queue).priority(priority);
            if let Some(args) = args {
                new = new.args(serde_json::from_str(&args)?);
            }
            if let Some(lock) = lock {
                new = new.queueing_lock(lock);
            }
            if delay_secs > 0 {
                new = new.schedule_at(
                    chrono::Utc::now() + chrono::Duration::seconds(delay_secs as i64),
                );
            }
            let id = engine.defer(new).await?;
            println!("deferred job {id}");
        }
        Command::Status { id } => {
            let status = engine.get_status(JobId(id)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Show { id } => {
            let job = engine.get(JobId(id)).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::List {
            status,
            queue,
            limit,
        } => {
            let status = status.map(|raw| raw.parse::<Status>()).transpose()?;
            let jobs = engine
                .list(ListFilter {
                    status,
                    queue,
                    limit: Some(limit),
                })
                .await?;
            for job in jobs {
                print_job_line(&job);
            }
        }
        Command::Cancel { id } => {
            engine.cancel(JobId(id)).await?;
            println!("cancelled job {id}");
        }
        Command::Reclaim { threshold_secs } => {
            let reclaimer = Reclaimer::new(
                engine.store(),
                ReclaimerConfig {
                    interval: config.engine.reclaim_interval,
                    stall_threshold: threshold_secs
                        .map(Duration::from_secs)
                        .unwrap_or(config.engine.stall_threshold),
                },
            );
            let reclaimed = reclaimer.sweep().await?;
            println!("reclaimed {} stalled job(s)", reclaimed.len());
        }
    }

    Ok(())
}

fn print_job_line(job: &Job) {
    println!(
        "{:>8}  {:<9}  {:<12}  {}  attempts={} scheduled_at={}",
        job.id.0, job.status, job.queue, job.task_name, job.attempts, job.scheduled_at
    );
}
