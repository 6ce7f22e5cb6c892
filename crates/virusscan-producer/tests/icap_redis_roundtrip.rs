//! End-to-end ICAP roundtrip against a live Redis and clamd, driving a real
//! `virusscan-consumer::Worker` on the other end of the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use virusscan_cache::{CacheConfig, IntelligentCache};
use virusscan_clamd::ClamdClient;
use virusscan_consumer::{Worker, WorkerConfig};
use virusscan_dataprovider::SharedRedis;
use virusscan_observability::Metrics;
use virusscan_producer::{IcapServer, SessionConfig};
use virusscan_proto::keys::KeySpace;
use virusscan_queue::TaskQueue;
use virusscan_redis::PooledRedis;

fn env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("missing {name} environment variable"))
}

/// Requires local stack: a reachable Redis (`TEST_REDIS_URL`) and clamd
/// (`TEST_CLAMD_URL`).
#[ignore] // Requires local stack: live Redis + clamd
#[tokio::test]
async fn eicar_over_icap_is_blocked_and_clean_body_is_admitted() -> anyhow::Result<()> {
    virusscan_observability::install_tracing();

    let redis_url = env_var("TEST_REDIS_URL");
    let clamd_url = env_var("TEST_CLAMD_URL");

    let redis: SharedRedis = Arc::new(PooledRedis::connect(&redis_url)?);
    let keys = KeySpace::new(format!("icap-test-{}", uuid::Uuid::new_v4()));
    let metrics = Arc::new(Metrics::new());
    let queue = Arc::new(TaskQueue::new(redis.clone(), keys.clone()));
    let cache = Arc::new(IntelligentCache::new(redis.clone(), keys.clone(), CacheConfig::default()));

    let session_config = Arc::new(SessionConfig {
        inline_threshold_bytes: 64 * 1024,
        shared_disk_dir: None,
        processing_timeout: Duration::from_secs(5),
        failure_mode_allow: false,
        block_status_code: 406,
    });
    let icap_server = Arc::new(IcapServer::new(
        redis.clone(),
        keys.clone(),
        cache.clone(),
        queue.clone(),
        metrics.clone(),
        session_config,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let accept_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((socket, _)) = accepted else { continue };
                    let server = icap_server.clone();
                    tokio::spawn(async move { let _ = server.handle_connection(socket).await; });
                }
            }
        }
    });

    let clamd = Arc::new(ClamdClient::from_url(&clamd_url)?);
    clamd.ping().await?;
    let worker = Worker::new(
        0,
        redis.clone(),
        keys.clone(),
        queue.clone(),
        clamd,
        metrics.clone(),
        Arc::new(WorkerConfig {
            queue_poll_timeout: Duration::from_secs(1),
            chunk_move_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }),
    );
    let worker_cancel = cancel.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_cancel).await });

    // Clean body: admitted with 204.
    let clean_response = send_reqmod(addr, b"just a harmless file").await?;
    assert_eq!(clean_response, b"ICAP/1.0 204 No Content\r\n\r\n");

    // EICAR test string: blocked with an encapsulated HTTP response.
    const EICAR: &[u8] =
        br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";
    let blocked_response = send_reqmod(addr, EICAR).await?;
    let blocked_response = String::from_utf8_lossy(&blocked_response);
    assert!(blocked_response.starts_with("ICAP/1.0 200 OK"));
    assert!(blocked_response.contains("X-Virus-Infected") || blocked_response.contains("HTTP/1.1"));

    cancel.cancel();
    worker_task.abort();
    Ok(())
}

async fn send_reqmod(addr: std::net::SocketAddr, body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let header = "GET https://example.com/file.bin HTTP/1.1\r\nContent-Type: application/octet-stream\r\n\r\n";
    let mut request = format!(
        "REQMOD icap://example/avscan ICAP/1.0\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n{header}",
        header.len(),
    )
    .into_bytes();
    request.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
    request.extend_from_slice(body);
    request.extend_from_slice(b"\r\n0\r\n\r\n");

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(&request).await?;
    client.shutdown().await?;
    let mut response = Vec::new();
    client.read_to_end(&mut response).await?;
    Ok(response)
}
