//! Jotter CLI entry point.
//!
//! Every subcommand opens the local database, starts the service and runs
//! one dispatcher operation by name. `watch` keeps the service running,
//! turning each stdin line into an entry and printing every event frame.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use jotter::config::Config;
use jotter::dispatch::{DispatchResponse, Dispatcher, Operation};
use jotter::hub::frame::parse_event_frame;
use jotter::hub::EventHub;
use jotter::logs::LogAggregator;
use jotter::pipeline::Collaborators;
use jotter::providers::analyzer::OllamaAnalyzer;
use jotter::providers::diagnostic::OllamaDiagnosticModel;
use jotter::providers::embedder::OllamaEmbedder;
use jotter::providers::fetcher::HttpFetcher;
use jotter::service::JournalService;
use jotter::store::{SqliteStore, Store};
use jotter::types::Stage;

/// Jotter: journal entries enriched by local AI models.
#[derive(Parser)]
#[command(name = "jotter", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create an entry and process it.
    Create {
        /// Entry text.
        content: String,
        /// Print stage events while the entry is processed.
        #[arg(long)]
        follow: bool,
    },
    /// Re-run processing for an entry.
    Retry {
        /// Entry id.
        id: Uuid,
        /// Print stage events while the entry is processed.
        #[arg(long)]
        follow: bool,
    },
    /// Show one entry.
    Show {
        /// Entry id.
        id: Uuid,
    },
    /// List recent entries.
    List {
        /// Maximum number of entries.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show an entry's processing logs.
    Logs {
        /// Entry id.
        id: Uuid,
        /// Only records written at this stage.
        #[arg(long)]
        stage: Option<Stage>,
    },
    /// Diagnose why an entry failed.
    Analyze {
        /// Entry id.
        id: Uuid,
    },
    /// Run until interrupted: each stdin line becomes an entry, every
    /// event is printed as an SSE frame.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    let _logging_guard = match cli.command {
        Command::Watch => Some(jotter::logging::init_production(
            &config.paths.logs_dir,
            &config.runtime.log_level,
        )?),
        _ => {
            jotter::logging::init_cli(&config.runtime.log_level);
            None
        }
    };

    let service = build_service(&config).await?;
    let dispatcher = Dispatcher::new(Arc::clone(&service)).context("invalid operation table")?;

    let outcome = run(&cli.command, &dispatcher, &service).await;
    service.shutdown().await;
    outcome
}

/// Open the store and wire every component.
async fn build_service(config: &Config) -> Result<Arc<JournalService>> {
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.paths.database)
            .await
            .with_context(|| format!("failed to open {}", config.paths.database.display()))?,
    );
    let hub = Arc::new(EventHub::new(config.hub_config()));
    let logs = Arc::new(LogAggregator::new(
        Arc::clone(&store),
        config.aggregator_config(),
    ));

    let models = &config.models;
    let collaborators = Collaborators {
        analyzer: Arc::new(
            OllamaAnalyzer::new(&models.analysis_model, &models.base_url)
                .with_max_links(config.pipeline.max_links),
        ),
        fetcher: Arc::new(
            HttpFetcher::new(Duration::from_secs(config.pipeline.fetch_timeout_secs))
                .with_max_chars(config.pipeline.max_fetched_chars),
        ),
        embedder: Arc::new(OllamaEmbedder::with_base_url(
            &models.embedding_model,
            &models.base_url,
            models.embedding_dims,
        )),
    };
    let diagnostic = Arc::new(OllamaDiagnosticModel::new(
        &models.diagnosis_model,
        &models.base_url,
    ));

    let service = Arc::new(JournalService::new(
        store,
        hub,
        logs,
        collaborators,
        diagnostic,
        config.service_config(),
    ));
    service.start();
    info!(database = %config.paths.database.display(), "jotter ready");
    Ok(service)
}

async fn run(command: &Command, dispatcher: &Dispatcher, service: &JournalService) -> Result<()> {
    match command {
        Command::Create { content, follow } => {
            let params = json!({ "content": content });
            process(dispatcher, service, Operation::CreateEntry, params, *follow).await
        }
        Command::Retry { id, follow } => {
            let params = json!({ "id": id });
            process(dispatcher, service, Operation::RetryProcessing, params, *follow).await
        }
        Command::Show { id } => print_json(dispatcher, Operation::GetEntry, json!({ "id": id })).await,
        Command::List { limit } => {
            print_json(dispatcher, Operation::ListEntries, json!({ "limit": limit })).await
        }
        Command::Logs { id, stage } => {
            let params = json!({ "id": id, "stage": stage });
            print_json(dispatcher, Operation::QueryLogs, params).await
        }
        Command::Analyze { id } => {
            print_json(dispatcher, Operation::AnalyzeFailure, json!({ "id": id })).await
        }
        Command::Watch => watch(dispatcher).await,
    }
}

async fn call_json(dispatcher: &Dispatcher, op: Operation, params: Value) -> Result<Value> {
    match dispatcher.dispatch(op.name(), params).await? {
        DispatchResponse::Json(value) => Ok(value),
        DispatchResponse::Stream(_) => bail!("{op} returned a stream"),
    }
}

async fn print_json(dispatcher: &Dispatcher, op: Operation, params: Value) -> Result<()> {
    let value = call_json(dispatcher, op, params).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Start processing, optionally echo the entry's frames, wait for the task
/// and print the final entry.
async fn process(
    dispatcher: &Dispatcher,
    service: &JournalService,
    op: Operation,
    params: Value,
    follow: bool,
) -> Result<()> {
    let frames = if follow {
        match dispatcher.dispatch(Operation::Subscribe.name(), Value::Null).await? {
            DispatchResponse::Stream(frames) => Some(frames),
            DispatchResponse::Json(_) => bail!("subscribe returned a document"),
        }
    } else {
        None
    };

    let entry = call_json(dispatcher, op, params).await?;
    let id: Uuid = serde_json::from_value(entry.get("id").cloned().unwrap_or(Value::Null))
        .context("response carried no entry id")?;

    if let Some(mut frames) = frames {
        while let Some(frame) = frames.next().await {
            let Some(event) = parse_event_frame(&frame) else {
                continue;
            };
            if event.entry_id != Some(id) {
                continue;
            }
            print!("{frame}");
            if event.is_terminal() {
                break;
            }
        }
    }
    service.wait_idle().await;

    print_json(dispatcher, Operation::GetEntry, json!({ "id": id })).await
}

async fn watch(dispatcher: &Dispatcher) -> Result<()> {
    let mut frames = match dispatcher.dispatch(Operation::Subscribe.name(), Value::Null).await? {
        DispatchResponse::Stream(frames) => frames,
        DispatchResponse::Json(_) => bail!("subscribe returned a document"),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    info!("watching; each stdin line creates an entry, ctrl-c to stop");

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => print!("{frame}"),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = call_json(dispatcher, Operation::CreateEntry, json!({ "content": line })).await {
                        warn!(error = %e, "entry rejected");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}
