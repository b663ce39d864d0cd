//! UDP discovery listener.
//!
//! Devices broadcast their presence periodically; the broadcasts are
//! encrypted with a fixed key every device shares (MD5 of a well-known
//! secret). The listener tracks which devices are around, emits an event
//! when one appears or changes its metadata, and drops devices that have
//! not broadcast for `unseen_timeout`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cipher::{discovery_key, PayloadCipher};
use crate::codec::{self, DeviceMetadata};

pub const DEFAULT_DISCOVERY_PORT: u16 = 6667;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// First broadcast from this device id.
    Discover { id: String, meta: DeviceMetadata },
    /// The device broadcast different metadata (address change, usually).
    Change { id: String, meta: DeviceMetadata },
    /// Nothing heard from the device for the unseen timeout.
    Lose { id: String },
}

pub struct DeviceListener {
    socket: UdpSocket,
    cipher: PayloadCipher,
    unseen_timeout: Duration,
    devices: HashMap<String, DeviceMetadata>,
    last_seen: HashMap<String, SystemTime>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
}

impl DeviceListener {
    /// Bind the listener; `secret` is the shared discovery secret, not the
    /// derived key.
    pub async fn bind(
        addr: &str,
        secret: &[u8],
        unseen_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>)> {
        let socket = UdpSocket::bind(addr).await?;
        log::info!("discovery listening on {}", socket.local_addr()?);
        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                socket,
                cipher: PayloadCipher::new(&discovery_key(secret)),
                unseen_timeout,
                devices: HashMap::new(),
                last_seen: HashMap::new(),
                events,
                cancel,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop; runs until the cancellation token fires or every
    /// event receiver is gone.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; 2048];
        while !self.cancel.is_cancelled() && !self.events.is_closed() {
            self.expire_unseen();
            let received =
                tokio::time::timeout(RECEIVE_TIMEOUT, self.socket.recv_from(&mut buf)).await;
            match received {
                Err(_elapsed) => continue,
                Ok(Ok((n, from))) => {
                    let datagram = buf[..n].to_vec();
                    self.handle_datagram(&datagram, from);
                }
                Ok(Err(err)) => {
                    log::warn!("discovery receive failed: {}", err);
                    break;
                }
            }
        }
        log::debug!("discovery listener stopped");
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let found = match codec::parse_discovery(datagram, &self.cipher) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("bad discovery datagram from {}: {}", from, err);
                return;
            }
        };
        for meta in found {
            self.track(meta);
        }
    }

    fn track(&mut self, meta: DeviceMetadata) {
        let id = meta.gw_id.clone();
        self.last_seen.insert(id.clone(), SystemTime::now());
        match self.devices.get(&id) {
            None => {
                log::info!("discovered device {} at {:?}", id, meta.ip);
                self.devices.insert(id.clone(), meta.clone());
                let _ = self.events.send(DiscoveryEvent::Discover { id, meta });
            }
            Some(known) if *known != meta => {
                log::info!("device {} changed its metadata", id);
                self.devices.insert(id.clone(), meta.clone());
                let _ = self.events.send(DiscoveryEvent::Change { id, meta });
            }
            Some(_) => {}
        }
    }

    fn expire_unseen(&mut self) {
        let now = SystemTime::now();
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| {
                now.duration_since(**seen).unwrap_or_default() > self.unseen_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            log::info!("device {} not seen for {:?}, dropping", id, self.unseen_timeout);
            self.last_seen.remove(&id);
            self.devices.remove(&id);
            let _ = self.events.send(DiscoveryEvent::Lose { id });
        }
    }
}
