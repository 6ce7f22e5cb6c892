//! A client for clamd's line protocol: `INSTREAM` (chunked, length-prefixed
//! streaming scan), `PING`, `VERSION`, `RELOAD`. Framing follows clamd's own
//! wire format (a 4-byte big-endian chunk length, zero-length chunk as
//! terminator), the same "length-prefix, then payload" shape the teacher
//! uses for its own connector-init codec, just clamd's specific byte order
//! and a line-oriented reply instead of a second length-prefixed message.

mod conn;

pub use conn::ClamdAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, thiserror::Error)]
pub enum ClamdError {
    #[error("invalid clamd address {0:?}, expected tcp://host:port or unix:///path")]
    InvalidAddr(String),
    #[error("io error talking to clamd: {0}")]
    Io(#[from] std::io::Error),
    #[error("clamd returned an unparseable reply: {0:?}")]
    UnparseableReply(String),
}

/// Outcome of an `INSTREAM` scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    Infected { virus: String },
    Error { message: String },
}

pub struct ClamdClient {
    addr: ClamdAddr,
}

impl ClamdClient {
    pub fn new(addr: ClamdAddr) -> Self {
        ClamdClient { addr }
    }

    pub fn from_url(url: &str) -> Result<Self, ClamdError> {
        Ok(ClamdClient::new(ClamdAddr::parse(url)?))
    }

    /// `PING` -> expects `PONG`.
    pub async fn ping(&self) -> Result<(), ClamdError> {
        let reply = self.simple_command("PING").await?;
        if reply.trim() == "PONG" {
            Ok(())
        } else {
            Err(ClamdError::UnparseableReply(reply))
        }
    }

    /// `VERSION` -> a free-form version string.
    pub async fn version(&self) -> Result<String, ClamdError> {
        self.simple_command("VERSION").await
    }

    /// `RELOAD` -> clamd acknowledges immediately; the actual reload
    /// happens asynchronously in clamd and must be polled for via `ping`.
    pub async fn reload(&self) -> Result<(), ClamdError> {
        let reply = self.simple_command("RELOAD").await?;
        if reply.trim() == "RELOADING" {
            Ok(())
        } else {
            Err(ClamdError::UnparseableReply(reply))
        }
    }

    async fn simple_command(&self, command: &str) -> Result<String, ClamdError> {
        let mut stream = self.addr.connect().await?;
        stream.write_all(format!("z{command}\0").as_bytes()).await?;
        stream.flush().await?;
        read_reply_line(&mut stream).await
    }

    /// Stream chunks from `chunks` through clamd's `INSTREAM` command,
    /// terminate with the zero-length chunk, and parse the verdict line.
    pub async fn scan_stream<S>(&self, mut chunks: S) -> Result<ScanOutcome, ClamdError>
    where
        S: ChunkSource,
    {
        let mut stream = self.addr.connect().await?;
        stream.write_all(b"zINSTREAM\0").await?;

        while let Some(chunk) = chunks.next_chunk().await? {
            let len = (chunk.len() as u32).to_be_bytes();
            stream.write_all(&len).await?;
            stream.write_all(&chunk).await?;
        }
        // Zero-length chunk terminates the stream.
        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await?;

        let reply = read_reply_line(&mut stream).await?;
        Ok(parse_instream_reply(&reply))
    }
}

/// Source of chunks fed into `INSTREAM`. Implemented by
/// `virusscan-dataprovider::Reader` in the Consumer; kept as a trait here
/// so this crate has no dependency on the provider crate.
#[async_trait::async_trait]
pub trait ChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ClamdError>;
}

async fn read_reply_line<S>(stream: &mut S) -> Result<String, ClamdError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' || byte[0] == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).map_err(|e| ClamdError::UnparseableReply(e.to_string()))
}

fn parse_instream_reply(reply: &str) -> ScanOutcome {
    let reply = reply.trim();
    // Typical clamd replies:
    //   "stream: OK"
    //   "stream: Eicar-Test-Signature FOUND"
    //   "stream: <message> ERROR"
    let Some(rest) = reply.strip_prefix("stream:") else {
        return ScanOutcome::Error {
            message: reply.to_string(),
        };
    };
    let rest = rest.trim();
    if rest == "OK" {
        ScanOutcome::Clean
    } else if let Some(name) = rest.strip_suffix("FOUND").map(str::trim) {
        ScanOutcome::Infected {
            virus: name.to_string(),
        }
    } else {
        ScanOutcome::Error {
            message: rest.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    struct VecChunks(std::vec::IntoIter<Vec<u8>>);

    #[async_trait::async_trait]
    impl ChunkSource for VecChunks {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ClamdError> {
            Ok(self.0.next())
        }
    }

    /// Spins up a loopback TCP listener that speaks just enough of clamd's
    /// protocol to exercise the client: read one request, write back a fixed
    /// reply.
    async fn fake_clamd(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        sock.write_all(reply).await.ok();
                        break;
                    }
                }
            }
        });
        format!("tcp://{addr}")
    }

    #[tokio::test]
    async fn ping_recognizes_pong() {
        let url = fake_clamd(b"PONG\n").await;
        let client = ClamdClient::from_url(&url).unwrap();
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn ping_rejects_unexpected_reply() {
        let url = fake_clamd(b"HUH\n").await;
        let client = ClamdClient::from_url(&url).unwrap();
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn version_returns_the_raw_line() {
        let url = fake_clamd(b"ClamAV 1.2.0/27000\n").await;
        let client = ClamdClient::from_url(&url).unwrap();
        assert_eq!(client.version().await.unwrap(), "ClamAV 1.2.0/27000");
    }

    #[tokio::test]
    async fn scan_stream_reports_clean() {
        let url = fake_clamd(b"stream: OK\n").await;
        let client = ClamdClient::from_url(&url).unwrap();
        let chunks = VecChunks(vec![b"hello".to_vec(), b"world".to_vec()].into_iter());
        assert_eq!(client.scan_stream(chunks).await.unwrap(), ScanOutcome::Clean);
    }

    #[tokio::test]
    async fn scan_stream_reports_infected() {
        let url = fake_clamd(b"stream: Eicar-Test-Signature FOUND\n").await;
        let client = ClamdClient::from_url(&url).unwrap();
        let chunks = VecChunks(vec![b"x".to_vec()].into_iter());
        assert_eq!(
            client.scan_stream(chunks).await.unwrap(),
            ScanOutcome::Infected {
                virus: "Eicar-Test-Signature".to_string()
            }
        );
    }

    #[tokio::test]
    async fn rejects_unparseable_addr() {
        assert!(ClamdClient::from_url("ftp://nope").is_err());
    }

    #[test]
    fn parses_clean_reply() {
        assert_eq!(parse_instream_reply("stream: OK"), ScanOutcome::Clean);
    }

    #[test]
    fn parses_infected_reply() {
        assert_eq!(
            parse_instream_reply("stream: Eicar-Test-Signature FOUND"),
            ScanOutcome::Infected {
                virus: "Eicar-Test-Signature".to_string()
            }
        );
    }

    #[test]
    fn parses_error_reply() {
        assert_eq!(
            parse_instream_reply("stream: size limit exceeded ERROR"),
            ScanOutcome::Error {
                message: "size limit exceeded ERROR".to_string()
            }
        );
    }

    #[test]
    fn unrecognized_reply_becomes_error() {
        assert_eq!(
            parse_instream_reply("garbage"),
            ScanOutcome::Error {
                message: "garbage".to_string()
            }
        );
    }
}
