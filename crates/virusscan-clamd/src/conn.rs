use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

use crate::ClamdError;

/// Where clamd is listening. Parsed from `CLAMD_URL`: `tcp://host:port` or
/// `unix:///path/to/socket`.
#[derive(Debug, Clone)]
pub enum ClamdAddr {
    Tcp(String),
    Unix(std::path::PathBuf),
}

impl ClamdAddr {
    pub fn parse(url: &str) -> Result<Self, ClamdError> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            Ok(ClamdAddr::Tcp(rest.to_string()))
        } else if let Some(rest) = url.strip_prefix("unix://") {
            Ok(ClamdAddr::Unix(std::path::PathBuf::from(rest)))
        } else {
            Err(ClamdError::InvalidAddr(url.to_string()))
        }
    }

    pub async fn connect(&self) -> Result<ClamdStream, ClamdError> {
        match self {
            ClamdAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                Ok(ClamdStream::Tcp(stream))
            }
            ClamdAddr::Unix(path) => {
                let stream = UnixStream::connect(path as &Path).await?;
                Ok(ClamdStream::Unix(stream))
            }
        }
    }
}

/// A single clamd connection. clamd treats one command per connection (for
/// `z`-prefixed commands, one connection may be reused for IDSESSION, which
/// this client does not use — each command opens and closes its own
/// connection, matching the simplest and most portable use of the clamd
/// line protocol).
pub enum ClamdStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ClamdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClamdStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClamdStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClamdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClamdStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClamdStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClamdStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClamdStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClamdStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClamdStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_unix_urls() {
        assert!(matches!(
            ClamdAddr::parse("tcp://127.0.0.1:3310").unwrap(),
            ClamdAddr::Tcp(addr) if addr == "127.0.0.1:3310"
        ));
        assert!(matches!(
            ClamdAddr::parse("unix:///var/run/clamd.sock").unwrap(),
            ClamdAddr::Unix(path) if path == Path::new("/var/run/clamd.sock")
        ));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(ClamdAddr::parse("http://nope").is_err());
    }
}
