//! The Consumer binary: a fixed pool of workers draining `scan_priority`
//! and `scan_normal`, a background HA coordinator keeping clamd on the
//! cluster's target epoch, and the shared `/metrics`+`/health` surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use virusscan_clamd::ClamdClient;
use virusscan_config::{exit_code, ConsumerArgs, SharedArgs};
use virusscan_ha::{Coordinator, CoordinatorConfig, ReloadTarget};
use virusscan_observability::Metrics;
use virusscan_proto::keys::KeySpace;
use virusscan_queue::TaskQueue;
use virusscan_redis::PooledRedis;

use virusscan_consumer::{ClamdHealth, Worker, WorkerConfig};

/// Scans the body of every task on `scan_priority`/`scan_normal` through
/// clamd and keeps this node's engine current with the cluster.
#[derive(Parser, Debug)]
#[command(about, version)]
struct Cli {
    #[command(flatten)]
    shared: SharedArgs,
    #[command(flatten)]
    consumer: ConsumerArgs,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the fully-resolved configuration (env + flags merged, secrets
    /// redacted) as JSON and exit.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Print,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    virusscan_observability::install_tracing();
    let cli = Cli::parse();

    if let Some(Command::Config { action: ConfigAction::Print }) = &cli.command {
        let merged = serde_json::json!({ "shared": cli.shared, "consumer": cli.consumer });
        println!("{}", serde_json::to_string_pretty(&virusscan_config::redact_secrets(merged))?);
        return Ok(());
    }

    let redis = match PooledRedis::connect(&cli.shared.redis_url()) {
        Ok(redis) => redis,
        Err(err) => {
            tracing::error!(error = %err, "failed to build the redis pool");
            std::process::exit(exit_code::DEPENDENCY_UNREACHABLE);
        }
    };
    let redis: Arc<dyn virusscan_redis::RedisLike> = Arc::new(redis);
    let keys = KeySpace::new(cli.shared.redis_key_prefix.clone());
    let metrics = Arc::new(Metrics::new());
    let queue = Arc::new(TaskQueue::new(redis.clone(), keys.clone()));

    let clamd = match ClamdClient::from_url(&cli.shared.clamd_url) {
        Ok(clamd) => Arc::new(clamd),
        Err(err) => {
            tracing::error!(error = %err, "invalid clamd URL");
            std::process::exit(exit_code::CONFIG_ERROR);
        }
    };
    if let Err(err) = clamd.ping().await {
        tracing::error!(error = %err, "clamd unreachable at startup");
        std::process::exit(exit_code::DEPENDENCY_UNREACHABLE);
    }

    let node_id = cli.shared.node_id();
    let cancel = CancellationToken::new();

    let worker_config = Arc::new(WorkerConfig {
        queue_poll_timeout: Duration::from_secs(cli.consumer.queue_poll_timeout_secs),
        chunk_move_timeout: Duration::from_secs(cli.consumer.chunk_move_timeout_secs),
        drain_timeout: Duration::from_secs(cli.consumer.drain_timeout_secs),
    });

    let worker_count = cli.consumer.worker_count();
    tracing::info!(worker_count, %node_id, "starting virusscan-consumer");

    let mut worker_tasks = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let worker = Worker::new(
            id,
            redis.clone(),
            keys.clone(),
            queue.clone(),
            clamd.clone(),
            metrics.clone(),
            worker_config.clone(),
        );
        let worker_cancel = cancel.clone();
        worker_tasks.push(tokio::spawn(async move { worker.run(worker_cancel).await }));
    }

    let ha_config = CoordinatorConfig {
        node_id: node_id.clone(),
        check_interval: Duration::from_secs(cli.consumer.ha_check_interval_secs),
        reload_timeout: Duration::from_secs(cli.consumer.reload_timeout_secs),
        ping_poll_interval: Duration::from_secs(1),
    };
    let reload_target: Arc<dyn ReloadTarget> = clamd.clone();
    let coordinator = Coordinator::new(redis.clone(), keys.clone(), reload_target, ha_config);
    let mut epoch_rx = coordinator.epoch_receiver();
    let reload_epoch_gauge = metrics.reload_epoch.clone();
    tokio::spawn(async move {
        loop {
            if epoch_rx.changed().await.is_err() {
                break;
            }
            let epoch = epoch_rx.borrow().clone();
            let numeric: i64 = epoch
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            reload_epoch_gauge.set(numeric);
        }
    });
    let ha_cancel = cancel.clone();
    let ha_task = tokio::spawn(async move { coordinator.run(ha_cancel).await });

    let health: Arc<dyn virusscan_observability::HealthCheck> = Arc::new(ClamdHealth::new(clamd.clone()));
    let observability_addr = format!("[::]:{}", cli.shared.observability_port)
        .parse()
        .context("invalid observability bind address")?;
    let observability_metrics = metrics.clone();
    let observability_cancel = cancel.clone();
    let observability_task = tokio::spawn(async move {
        tokio::select! {
            result = virusscan_observability::serve(observability_addr, observability_metrics, health) => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "observability server exited");
                }
            }
            _ = observability_cancel.cancelled() => {}
        }
    });

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        signal_terminate().await;
        tracing::info!("shutdown signal received, draining in-flight tasks");
        shutdown_cancel.cancel();
    });

    for task in worker_tasks {
        let _ = task.await;
    }
    let _ = ha_task.await;
    let _ = observability_task.await;

    Ok(())
}

/// Waits for SIGTERM (Kubernetes' drain signal) or Ctrl-C, whichever comes
/// first.
async fn signal_terminate() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
