//! TCP connection to a key-value node.
//!
//! The socket is split in two tasks. The writer drains an unbounded queue
//! fed by [`TcpSink`]; the reader cuts the byte stream into frames and hands
//! each one to [`KvEndpoint::handle_response`]. Either side failing tears the
//! endpoint down.

use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CoreConfig;
use crate::endpoint::{FrameSink, KvEndpoint};
use crate::error::{CoreError, Result};
use crate::metrics::CoreMetrics;
use crate::protocol::{self, HEADER_SIZE};
use crate::request::lock;

/// Establishes a connection to `addr` and starts its reader and writer.
pub async fn connect(addr: &str, config: &CoreConfig, metrics: Arc<CoreMetrics>) -> Result<Arc<KvEndpoint>> {
    let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| CoreError::Io {
            reason: format!(
                "connection timeout after {}ms to {}",
                config.connect_timeout_ms, addr
            ),
        })??;
    if config.nodelay {
        stream.set_nodelay(true)?;
    }
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| addr.to_string());
    debug!(addr = %peer_addr, "TCP connected");
    Ok(spawn_endpoint(stream, peer_addr, config.max_frame_size, metrics))
}

fn spawn_endpoint(
    stream: TcpStream,
    address: String,
    max_frame_size: usize,
    metrics: Arc<CoreMetrics>,
) -> Arc<KvEndpoint> {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = Arc::new(TcpSink {
        tx: Mutex::new(Some(tx)),
        reader: Mutex::new(None),
    });
    let endpoint = Arc::new(KvEndpoint::new(
        address,
        Arc::clone(&sink) as Arc<dyn FrameSink>,
        Arc::clone(&metrics),
    ));

    tokio::spawn(write_loop(write, rx, Arc::downgrade(&endpoint), Arc::clone(&metrics)));
    let reader = tokio::spawn(read_loop(read, Arc::downgrade(&endpoint), max_frame_size, metrics));
    *lock(&sink.reader) = Some(reader);
    endpoint
}

/// Outbound queue of one TCP connection.
pub struct TcpSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl FrameSink for TcpSink {
    fn send(&self, frame: Bytes) -> Result<()> {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| CoreError::ConnectionLost {
                reason: "writer stopped".to_string(),
            }),
            None => Err(CoreError::ConnectionLost {
                reason: "connection closed".to_string(),
            }),
        }
    }

    fn close(&self) {
        // Dropping the sender lets the writer flush what is queued and exit.
        lock(&self.tx).take();
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

impl Drop for TcpSink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    endpoint: Weak<KvEndpoint>,
    metrics: Arc<CoreMetrics>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write.write_all(&frame).await {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.connection_lost(&e.to_string());
            }
            return;
        }
        metrics.add_bytes_sent(frame.len() as u64);
    }
    let _ = write.shutdown().await;
}

async fn read_loop(
    mut read: OwnedReadHalf,
    endpoint: Weak<KvEndpoint>,
    max_frame_size: usize,
    metrics: Arc<CoreMetrics>,
) {
    let reason = loop {
        let frame = match read_frame(&mut read, max_frame_size).await {
            Ok(frame) => frame,
            Err(e) => break e.to_string(),
        };
        metrics.add_bytes_received(frame.len() as u64);
        let Some(endpoint) = endpoint.upgrade() else {
            return;
        };
        if let Err(e) = endpoint.handle_response(frame) {
            debug!(address = %endpoint.address(), error = %e, "inbound frame dropped");
        }
    };
    if let Some(endpoint) = endpoint.upgrade() {
        endpoint.connection_lost(&reason);
    }
}

/// Reads one frame: the fixed header, then as many body bytes as it
/// announces.
///
/// Frames larger than `max_frame_size` are rejected before their body is
/// read, since the stream cannot be resynchronised after them.
pub async fn read_frame<R>(read: &mut R, max_frame_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    read.read_exact(&mut header).await?;
    let body_length = protocol::extract_body_length(&header)?;
    let total = usize::try_from(body_length)
        .ok()
        .and_then(|len| len.checked_add(HEADER_SIZE))
        .filter(|total| *total <= max_frame_size)
        .ok_or_else(|| {
            CoreError::malformed(format!(
                "frame with {} byte body exceeds limit of {}",
                body_length, max_frame_size
            ))
        })?;
    let mut frame = BytesMut::with_capacity(total);
    frame.extend_from_slice(&header);
    frame.resize(total, 0);
    read.read_exact(&mut frame[HEADER_SIZE..]).await?;
    Ok(frame.freeze())
}
