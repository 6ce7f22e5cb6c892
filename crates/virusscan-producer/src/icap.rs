//! A minimal ICAP (RFC 3507) REQMOD/RESPMOD adapter, reusing the same
//! `Session` state machine as the ext_proc adapter.
//!
//! This is a deliberately reduced ICAP surface, not a full implementation of
//! the RFC: no `Preview`/`100 Continue` negotiation (a client offering a
//! preview must send the whole body up front; the server never asks for
//! more), and no `OPTIONS` method beyond what a caller needs to discover
//! `REQMOD`/`RESPMOD` support. A connection is accepted, one ICAP
//! transaction is read and answered, and the connection is closed — there is
//! no keep-alive pipelining.
//!
//! Body framing follows RFC 3507's chunked encapsulation for the HTTP
//! portion (hex-length-prefixed chunks, a zero-length chunk terminates), and
//! the `Encapsulated` header's `req-hdr`/`req-body`/`null-body` offsets are
//! read for logging only — the HTTP headers between the ICAP header block
//! and the first body chunk are parsed just far enough to extract a request
//! line, `Host`, and `Content-Type`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use virusscan_cache::IntelligentCache;
use virusscan_dataprovider::SharedRedis;
use virusscan_proto::keys::KeySpace;
use virusscan_proto::{Priority, RequestMetadata};
use virusscan_queue::TaskQueue;

use crate::state_machine::{Decision, Session, SessionConfig};

#[derive(Debug, thiserror::Error)]
pub enum IcapError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed ICAP request: {0}")]
    Malformed(&'static str),
    #[error("session error: {0}")]
    Session(#[from] crate::state_machine::SessionError),
}

pub struct IcapServer {
    redis: SharedRedis,
    keys: KeySpace,
    cache: Arc<IntelligentCache>,
    queue: Arc<TaskQueue>,
    metrics: Arc<virusscan_observability::Metrics>,
    session_config: Arc<SessionConfig>,
}

impl IcapServer {
    pub fn new(
        redis: SharedRedis,
        keys: KeySpace,
        cache: Arc<IntelligentCache>,
        queue: Arc<TaskQueue>,
        metrics: Arc<virusscan_observability::Metrics>,
        session_config: Arc<SessionConfig>,
    ) -> Self {
        IcapServer { redis, keys, cache, queue, metrics, session_config }
    }

    fn new_session(&self) -> Session {
        Session::new(
            self.redis.clone(),
            self.keys.clone(),
            self.cache.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            self.session_config.clone(),
        )
    }

    /// Accepts connections until `cancel` fires, one scan session per
    /// connection, mirroring the ext_proc adapter's `Session` usage.
    pub async fn run(self: Arc<Self>, port: u16, cancel: CancellationToken) -> Result<(), IcapError> {
        let listener = TcpListener::bind(format!("[::]:{port}")).await?;
        tracing::info!(port, "ICAP server listening");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                accept = listener.accept() => {
                    let Ok((socket, addr)) = accept else { continue };
                    let server = self.clone();
                    let conn_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            result = server.handle_connection(socket) => {
                                if let Err(err) = result {
                                    tracing::warn!(%addr, error = %err, "ICAP connection failed");
                                }
                            }
                            _ = conn_cancel.cancelled() => {}
                        }
                    });
                }
            }
        }
    }

    /// Reads and answers exactly one ICAP transaction on `socket`.
    pub async fn handle_connection(&self, socket: TcpStream) -> Result<(), IcapError> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let request_line = read_line(&mut reader).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(IcapError::Malformed("empty request line"))?.to_string();

        let mut headers = Vec::new();
        loop {
            let line = read_line(&mut reader).await?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        tracing::debug!(method = %method, header_count = headers.len(), "ICAP request");

        if method.eq_ignore_ascii_case("OPTIONS") {
            write_half
                .write_all(
                    b"ICAP/1.0 200 OK\r\n\
                      Methods: REQMOD, RESPMOD\r\n\
                      Allow: 204\r\n\
                      Preview: 0\r\n\
                      Transfer-Complete: *\r\n\
                      \r\n",
                )
                .await?;
            return Ok(());
        }

        // The encapsulated HTTP header block, if present, ends at its own
        // blank line before the chunked body begins.
        let mut origin_uri = String::new();
        let mut content_type = None;
        loop {
            let line = read_line(&mut reader).await?;
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix("GET ").or_else(|| line.strip_prefix("POST ")) {
                origin_uri = rest.split_whitespace().next().unwrap_or_default().to_string();
            } else if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-type") {
                    content_type = Some(value.trim().to_string());
                }
            }
        }

        let body = read_chunked_body(&mut reader).await?;

        let metadata = RequestMetadata {
            origin_uri,
            content_type,
            tenant_id: None,
        };

        let mut session = self.new_session();
        let header_decision = session.on_request_headers(metadata, false, Priority::Normal);
        let decision = match header_decision {
            Decision::Continue => session.on_request_body(&body, true).await?,
            other => other,
        };

        let response = match decision {
            Decision::Continue | Decision::Admit { .. } => b"ICAP/1.0 204 No Content\r\n\r\n".to_vec(),
            Decision::Block { status, body, .. } => {
                let http_header = format!("HTTP/1.1 {status} Blocked\r\nContent-Length: {}\r\n\r\n", body.len());
                let mut response = format!(
                    "ICAP/1.0 200 OK\r\nEncapsulated: res-hdr=0, res-body={}\r\n\r\n{http_header}",
                    http_header.len(),
                )
                .into_bytes();
                response.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
                response.extend_from_slice(&body);
                response.extend_from_slice(b"\r\n0\r\n\r\n");
                response
            }
        };

        write_half.write_all(&response).await?;
        Ok(())
    }
}


async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, IcapError> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Reads RFC 3507's chunked body framing: `<hex-size>\r\n<bytes>\r\n`,
/// repeated until a zero-size chunk.
async fn read_chunked_body<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, IcapError> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(reader).await?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        if size_hex.is_empty() {
            return Err(IcapError::Malformed("missing chunk size"));
        }
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| IcapError::Malformed("invalid chunk size"))?;
        if size == 0 {
            // Trailing CRLF after the terminating zero chunk.
            let _ = read_line(reader).await?;
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        let _ = read_line(reader).await?; // chunk-terminating CRLF
    }
    Ok(body)
}
