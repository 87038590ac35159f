//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use kvclient_core::protocol::{self, encode_frame, FrameHeader, Opcode, MAGIC_RESPONSE};
use kvclient_core::tcp::read_frame;
use kvclient_core::{CoreConfig, CoreError, CoreMetrics, FrameSink, KvEndpoint, TimerConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// Config with a 1ms tick so timeouts fire promptly.
pub fn fast_config() -> CoreConfig {
    CoreConfig {
        timer: TimerConfig {
            tick_ms: 1,
            wheel_size: 64,
        },
        ..CoreConfig::default()
    }
}

/// In-memory sink recording every frame written.
#[derive(Default)]
pub struct MemorySink {
    pub frames: Mutex<Vec<Bytes>>,
    pub broken: AtomicBool,
}

impl MemorySink {
    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().clone()
    }
}

impl FrameSink for MemorySink {
    fn send(&self, frame: Bytes) -> kvclient_core::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(CoreError::Io {
                reason: "connection reset by peer".to_string(),
            });
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

/// Endpoint backed by a [`MemorySink`].
pub fn memory_endpoint(metrics: Arc<CoreMetrics>) -> (Arc<KvEndpoint>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let endpoint = Arc::new(KvEndpoint::new(
        "memory",
        sink.clone() as Arc<dyn FrameSink>,
        metrics,
    ));
    (endpoint, sink)
}

/// GET response frame with 4 bytes of flags.
pub fn get_response(opaque: u32, status: u16, value: &[u8]) -> Bytes {
    let header = FrameHeader {
        magic: MAGIC_RESPONSE,
        opcode: Opcode::Get as u8,
        datatype: 0,
        vbucket_or_status: status,
        opaque,
        cas: 0x1000 + opaque as u64,
    };
    encode_frame(&header, &[0, 0, 0, 0], &[], value).unwrap()
}

/// Key-value node answering GETs on one connection.
///
/// Keys starting with `missing` get KEY_ENOENT, keys starting with `slow`
/// get no answer, anything else gets `value-of-<key>`.
pub async fn spawn_mock_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(request) = read_frame(&mut stream, protocol::MAX_FRAME_SIZE).await {
            let opaque = protocol::extract_opaque(&request).unwrap();
            let key_length = protocol::extract_key_length(&request).unwrap() as usize;
            let key = &request[protocol::HEADER_SIZE..protocol::HEADER_SIZE + key_length];
            let response = if key.starts_with(b"slow") {
                continue;
            } else if key.starts_with(b"missing") {
                get_response(opaque, 0x0001, b"Not found")
            } else {
                let mut value = b"value-of-".to_vec();
                value.extend_from_slice(key);
                get_response(opaque, 0x0000, &value)
            };
            if stream.write_all(&response).await.is_err() {
                break;
            }
        }
    });
    addr
}
