//! The Producer binary: terminates the proxy's external-processing stream
//! (gRPC ext_proc, and optionally ICAP), drives a `Session` per intercepted
//! request/response, and enqueues scan tasks for the Consumer pool.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use virusscan_cache::{CacheConfig, IntelligentCache};
use virusscan_config::{exit_code, CacheArgs, ProducerArgs, SharedArgs};
use virusscan_dataprovider::SharedRedis;
use virusscan_observability::Metrics;
use virusscan_proto::ext_proc::external_processor_server::ExternalProcessorServer;
use virusscan_proto::keys::KeySpace;
use virusscan_queue::TaskQueue;
use virusscan_redis::PooledRedis;

use virusscan_producer::{ExtProcService, IcapServer, SessionConfig};

/// Scans request/response bodies proxied through it before admitting or
/// blocking them, handing the body off to the Consumer pool for the actual
/// AV scan.
#[derive(Parser, Debug)]
#[command(about, version)]
struct Cli {
    #[command(flatten)]
    shared: SharedArgs,
    #[command(flatten)]
    producer: ProducerArgs,
    #[command(flatten)]
    cache: CacheArgs,
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
        let merged = serde_json::json!({
            "shared": cli.shared,
            "producer": cli.producer,
            "cache": cli.cache,
        });
        println!("{}", serde_json::to_string_pretty(&virusscan_config::redact_secrets(merged))?);
        return Ok(());
    }

    if cli.producer.buffer_threshold_bytes as u64 > cli.producer.max_body_bytes {
        tracing::error!("buffer_threshold_bytes must not exceed max_body_bytes");
        std::process::exit(exit_code::CONFIG_ERROR);
    }

    let redis = match PooledRedis::connect(&cli.shared.redis_url()) {
        Ok(redis) => redis,
        Err(err) => {
            tracing::error!(error = %err, "failed to build the redis pool");
            std::process::exit(exit_code::DEPENDENCY_UNREACHABLE);
        }
    };
    let redis: SharedRedis = Arc::new(redis);
    let keys = KeySpace::new(cli.shared.redis_key_prefix.clone());
    let metrics = Arc::new(Metrics::new());
    let queue = Arc::new(TaskQueue::new(redis.clone(), keys.clone()));

    let cache_config = CacheConfig::with_additions(
        cli.cache.trusted_hosts.clone(),
        cli.cache.bypass_hosts.clone(),
        cli.cache.ttl_seconds,
    );
    let cache = Arc::new(IntelligentCache::new(redis.clone(), keys.clone(), cache_config));

    let session_config = Arc::new(SessionConfig {
        inline_threshold_bytes: cli.producer.buffer_threshold_bytes as u64,
        shared_disk_dir: Some(cli.shared.scan_tmp_dir.clone()),
        processing_timeout: cli.producer.processing_timeout,
        failure_mode_allow: cli.producer.failure_mode_allow,
        block_status_code: cli.producer.block_status_code,
    });

    let cancel = CancellationToken::new();

    tracing::info!(
        producer_port = cli.producer.producer_port,
        icap_port = ?cli.producer.icap_port,
        "starting virusscan-producer"
    );

    let ext_proc_service = ExtProcService::new(
        redis.clone(),
        keys.clone(),
        cache.clone(),
        queue.clone(),
        metrics.clone(),
        session_config.clone(),
    );
    let ext_proc_addr = format!("[::]:{}", cli.producer.producer_port)
        .parse()
        .context("invalid ext_proc bind address")?;
    let ext_proc_cancel = cancel.clone();
    let ext_proc_task = tokio::spawn(async move {
        let result = Server::builder()
            .add_service(ExternalProcessorServer::new(ext_proc_service))
            .serve_with_shutdown(ext_proc_addr, ext_proc_cancel.cancelled())
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "ext_proc server exited");
        }
    });

    let icap_task = cli.producer.icap_port.map(|port| {
        let icap_server = Arc::new(IcapServer::new(
            redis.clone(),
            keys.clone(),
            cache.clone(),
            queue.clone(),
            metrics.clone(),
            session_config.clone(),
        ));
        let icap_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = icap_server.run(port, icap_cancel).await {
                tracing::error!(error = %err, "ICAP server exited");
            }
        })
    });

    let health: Arc<dyn virusscan_observability::HealthCheck> =
        Arc::new(RedisHealth { redis: redis.clone(), keys: keys.clone() });
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

    let queue_depth_redis = redis.clone();
    let queue_depth_keys = keys.clone();
    let queue_depth_metrics = metrics.clone();
    let queue_depth_cancel = cancel.clone();
    let queue_depth_task = tokio::spawn(async move {
        sample_queue_depth(queue_depth_redis, queue_depth_keys, queue_depth_metrics, queue_depth_cancel).await;
    });

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        signal_terminate().await;
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    let _ = ext_proc_task.await;
    if let Some(icap_task) = icap_task {
        let _ = icap_task.await;
    }
    let _ = observability_task.await;
    let _ = queue_depth_task.await;

    Ok(())
}

/// Periodically samples `LLEN` on both queues so `virusscan_queue_depth`
/// reflects backlog rather than reading zero forever (it is only ever
/// set here, never incremented per-task).
async fn sample_queue_depth(
    redis: SharedRedis,
    keys: KeySpace,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }
        match redis.llen(&keys.scan_priority()).await {
            Ok(depth) => metrics.queue_depth.with_label_values(&["scan_priority"]).set(depth),
            Err(err) => tracing::warn!(error = %err, queue = "scan_priority", "failed to sample queue depth"),
        }
        match redis.llen(&keys.scan_normal()).await {
            Ok(depth) => metrics.queue_depth.with_label_values(&["scan_normal"]).set(depth),
            Err(err) => tracing::warn!(error = %err, queue = "scan_normal", "failed to sample queue depth"),
        }
    }
}

/// The Producer never talks to clamd directly, so its health check is
/// Redis-only: a cheap `LLEN` against a real list key.
struct RedisHealth {
    redis: SharedRedis,
    keys: KeySpace,
}

#[async_trait::async_trait]
impl virusscan_observability::HealthCheck for RedisHealth {
    async fn healthy(&self) -> bool {
        self.redis.llen(&self.keys.scan_normal()).await.is_ok()
    }
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
