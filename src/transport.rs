//! Byte stream the connections run over: plain TCP or, with the `tls` feature, TLS on
//! top of TCP.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::Error;

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl Stream {
    pub fn is_tls(&self) -> bool {
        match self {
            Stream::Tcp(_) => false,
            #[cfg(feature = "tls")]
            Stream::Tls(_) => true,
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(stream: TcpStream) -> Self {
        Stream::Tcp(stream)
    }
}

/// Opens the byte stream described by `config`, bounded by its connect timeout.
#[instrument(skip(config), fields(addr = %config.addr(), tls = config.tls))]
pub async fn connect(config: &Config) -> Result<Stream, Error> {
    config.validate()?;

    let tcp = timeout(config.connect_timeout, TcpStream::connect(config.addr()))
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout))??;
    tcp.set_nodelay(true)?;

    debug!("tcp connection established");

    if config.tls {
        return handshake(config, tcp).await;
    }

    Ok(Stream::Tcp(tcp))
}

#[cfg(feature = "tls")]
async fn handshake(config: &Config, tcp: TcpStream) -> Result<Stream, Error> {
    let connector = tokio_native_tls::native_tls::TlsConnector::new()
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let tls = timeout(config.connect_timeout, connector.connect(&config.host, tcp))
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout))?
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    debug!("tls handshake completed");

    Ok(Stream::Tls(Box::new(tls)))
}

#[cfg(not(feature = "tls"))]
async fn handshake(_config: &Config, _tcp: TcpStream) -> Result<Stream, Error> {
    Err(Error::Usage(
        "TLS requested but the crate was built without the `tls` feature".to_string(),
    ))
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
