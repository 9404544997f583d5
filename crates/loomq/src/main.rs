mod cli;
mod shutdown;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use loomq_core::Config;
use loomq_engine::{start_supervisor, SupervisorConfig, SupervisorEvent};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

/// Exit code for a configuration error (malformed or missing config file).
const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for an unrecoverable broker error encountered at startup.
const EXIT_BROKER_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => match Config::default_path() {
            Ok(path) => path,
            Err(err) => {
                eprintln!("error: could not determine a default config path: {err}");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        },
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: failed to load configuration from {}: {err}", config_path.display());
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Broker(err)) => {
            eprintln!("error: {err}");
            ExitCode::from(EXIT_BROKER_ERROR)
        }
        Err(RunError::Other(err)) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

enum RunError {
    Broker(loomq_engine::BrokerError),
    Other(anyhow::Error),
}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        RunError::Other(err)
    }
}

async fn run(config: Config) -> Result<(), RunError> {
    let supervisor_cfg = SupervisorConfig {
        broker_uri: config.amqp_uri(),
        input_queue: config.queue_details.read_queue_name.clone(),
        output_queue: config.queue_details.write_queue_name.clone(),
        error_queue: config.queue_details.error_queue_name.clone(),
        max_worker_count: config.queue_details.max_queue_client_count,
        blocking_limit: config.queue_details.blocking_limit,
        tick_interval: SupervisorConfig::DEFAULT_TICK_INTERVAL,
        shutdown_grace: SupervisorConfig::DEFAULT_SHUTDOWN_GRACE,
    };

    let transform = demo_transform();

    let supervisor = start_supervisor(supervisor_cfg, transform)
        .await
        .map_err(RunError::Broker)?;

    println!(
        "loomq {} max_workers={} blocking_limit={}",
        env!("CARGO_PKG_VERSION"),
        config.queue_details.max_queue_client_count,
        config.queue_details.blocking_limit,
    );

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    let mut events = supervisor.subscribe();
    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("Stop requested — draining workers before exiting (press CTRL+C again to exit immediately).");
                        supervisor.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again — exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    SupervisorEvent::Started => {}
                    SupervisorEvent::Ticked { snapshot } => {
                        println!(
                            "workers={} throughput={:.1}/s action={}",
                            snapshot.live_count, snapshot.throughput_per_sec, snapshot.action
                        );
                    }
                    SupervisorEvent::Warning { message } => eprintln!("warning: {message}"),
                    SupervisorEvent::Error { message } => eprintln!("error: {message}"),
                    SupervisorEvent::Stopped => break,
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    supervisor.wait().await.context("supervisor task failed")?;
    Ok(())
}

/// Placeholder transform used when `loomq` is run standalone. A host application embedding
/// `loomq-engine` directly supplies its own [`loomq_core::Transform`] implementation instead of
/// going through this binary.
fn demo_transform() -> Arc<dyn loomq_core::Transform> {
    Arc::new(PassthroughTransform)
}

struct PassthroughTransform;

#[async_trait::async_trait]
impl loomq_core::Transform for PassthroughTransform {
    async fn process(&self, message: &[u8]) -> loomq_core::TransformOutcome {
        loomq_core::TransformOutcome::ok(message.to_vec())
    }
}
