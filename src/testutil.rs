//! Device-side test doubles: frame builders and a loopback TCP device.
//!
//! Replies are built the way the hardware builds them (return code word
//! before the payload, raw ciphertext without a version marker), which the
//! encoder in [`crate::codec`] never produces itself.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::cipher::PayloadCipher;
use crate::codec::{self, Decoder, Frame, Version};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device-style reply frame: return code 0 followed by the payload,
/// encrypted for 3.3 and plaintext for 3.1.
pub fn encode_reply(
    seq: u32,
    command: u32,
    payload: &Value,
    version: Version,
    key: &[u8; 16],
) -> Vec<u8> {
    let json = payload.to_string().into_bytes();
    let mut body = 0u32.to_be_bytes().to_vec();
    match version {
        Version::V33 => body.extend_from_slice(&PayloadCipher::new(key).encrypt(&json)),
        Version::V31 => body.extend_from_slice(&json),
    }
    codec::wrap_frame(seq, command, &body)
}

/// A reply carrying only a non-zero return code.
pub fn encode_error_reply(seq: u32, command: u32, code: u32) -> Vec<u8> {
    codec::wrap_frame(seq, command, &code.to_be_bytes())
}

/// A reply with return code 0 and no payload at all.
pub fn encode_empty_reply(seq: u32, command: u32) -> Vec<u8> {
    codec::wrap_frame(seq, command, &0u32.to_be_bytes())
}

/// What the fake device does with one decoded request frame.
pub enum ReplyAction {
    /// Write these bytes back.
    Reply(Vec<u8>),
    /// Swallow the request without answering.
    Ignore,
    /// Drop the connection.
    Close,
}

pub struct FakeDevice {
    pub addr: SocketAddr,
    frames_seen: Arc<AtomicUsize>,
}

impl FakeDevice {
    /// Total request frames decoded across all connections.
    pub fn frames_seen(&self) -> usize {
        self.frames_seen.load(Ordering::SeqCst)
    }
}

/// Spawn a loopback device. `reply` is called per decoded request frame
/// with the zero-based connection index, so behavior can differ between
/// the first connection and reconnects.
pub async fn spawn_fake_device<F>(key: [u8; 16], version: Version, reply: F) -> FakeDevice
where
    F: Fn(&Frame, usize) -> ReplyAction + Send + Sync + 'static,
{
    spawn_fake_device_with_delay(key, version, Duration::ZERO, reply).await
}

/// Like [`spawn_fake_device`], pausing `delay` before each reply. Used to
/// hold a request in flight while concurrent callers pile up.
pub async fn spawn_fake_device_with_delay<F>(
    key: [u8; 16],
    version: Version,
    delay: Duration,
    reply: F,
) -> FakeDevice
where
    F: Fn(&Frame, usize) -> ReplyAction + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let frames_seen = Arc::new(AtomicUsize::new(0));
    let seen = frames_seen.clone();
    let reply = Arc::new(reply);

    let _ = tokio::spawn(async move {
        for conn in 0usize.. {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let seen = seen.clone();
            let reply = reply.clone();
            let _ = tokio::spawn(async move {
                let mut dec = Decoder::new(PayloadCipher::new(&key), version);
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    dec.extend(&buf[..n]);
                    loop {
                        match dec.next() {
                            Ok(Some(frame)) => {
                                seen.fetch_add(1, Ordering::SeqCst);
                                match reply(&frame, conn) {
                                    ReplyAction::Reply(bytes) => {
                                        if !delay.is_zero() {
                                            tokio::time::sleep(delay).await;
                                        }
                                        if stream.write_all(&bytes).await.is_err() {
                                            return;
                                        }
                                    }
                                    ReplyAction::Ignore => {}
                                    ReplyAction::Close => return,
                                }
                            }
                            Ok(None) => break,
                            Err(_) => return,
                        }
                    }
                }
            });
        }
    });

    FakeDevice { addr, frames_seen }
}
