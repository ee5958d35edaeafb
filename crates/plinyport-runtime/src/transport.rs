use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use plinyport_core::Endpoint;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused or unreachable: {0}")]
    Refused(#[source] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("failed to start the I/O driver: {0}")]
    Runtime(#[source] io::Error),
    #[error("transport is closed")]
    Closed,
}

/// One blocking, framed connection to an engine.
///
/// Every blocking call takes an optional timeout; `None` waits indefinitely.
pub trait Transport: Send {
    fn send(&mut self, frame: &[u8], timeout: Option<Duration>) -> Result<(), TransportError>;
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Bytes, TransportError>;
    /// Releases the connection. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports; the seam where fake engines are substituted.
pub trait Connector {
    type Transport: Transport;

    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Option<Duration>,
    ) -> Result<Self::Transport, TransportError>;
}

#[derive(Clone, Debug)]
pub struct TcpConnector {
    max_frame_bytes: usize,
}

impl TcpConnector {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

/// TCP transport driven by its own current-thread runtime.
///
/// Calls block the calling thread, so it must not be used from inside an
/// async task; wrap it in `spawn_blocking` there.
pub struct TcpTransport {
    runtime: Runtime,
    stream: Option<TcpStream>,
    max_frame_bytes: usize,
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Option<Duration>,
    ) -> Result<TcpTransport, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(TransportError::Runtime)?;

        let addr = (endpoint.host.as_str(), endpoint.port);
        let stream = block_on(&runtime, timeout, async {
            TcpStream::connect(addr).await.map_err(TransportError::Refused)
        })?;
        stream.set_nodelay(true).map_err(TransportError::Refused)?;
        debug!(%endpoint, "tcp transport connected");

        Ok(TcpTransport {
            runtime,
            stream: Some(stream),
            max_frame_bytes: self.max_frame_bytes,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8], timeout: Option<Duration>) -> Result<(), TransportError> {
        let Self {
            runtime,
            stream,
            max_frame_bytes,
        } = self;
        let stream = stream.as_mut().ok_or(TransportError::Closed)?;
        block_on(runtime, timeout, write_frame(stream, frame, *max_frame_bytes))
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Bytes, TransportError> {
        let Self {
            runtime,
            stream,
            max_frame_bytes,
        } = self;
        let stream = stream.as_mut().ok_or(TransportError::Closed)?;
        block_on(runtime, timeout, read_frame(stream, *max_frame_bytes))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        self.runtime
            .block_on(stream.shutdown())
            .map_err(TransportError::ConnectionLost)
    }
}

fn block_on<F, T>(runtime: &Runtime, timeout: Option<Duration>, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    runtime.block_on(async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => fut.await,
        }
    })
}
