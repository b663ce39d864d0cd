//! Hub-side control library for local smart switches
//!
//! This library speaks the switches' local binary protocol. It uses asynchronous Rust and depends on Tokio.
//! Following are main parts of api:
//! - [Device](device::Device) - One managed device. Enforces preconditions, caches the last known
//!               status, collapses concurrent reads, tracks health from consecutive connect
//!               failures and broadcasts [status events](device::StatusEvent) to subscribers.
//!               Push-style hardware reports through [put_status](device::Device::put_status).
//! - [CommandQueue](queue::CommandQueue) - Strict FIFO command/reply correlation over one TCP
//!               connection per device. The protocol has no request ids, so ordering is the
//!               only correlation there is.
//! - [codec](codec) - Binary frame encoder and incremental decoder, including the discovery
//!               datagram parser.
//! - [DeviceListener](discover::DeviceListener) - UDP listener for the periodic presence
//!               broadcasts; reports devices appearing, changing address and going quiet.
//! - [config](config) - Hub configuration loading, one entry per device.
//!
//! Example reading and flipping a switch:
//! ```no_run
//! # use swctl::config::{DeviceConfig, HwKind};
//! # use swctl::device::{Device, DiscoveryStatus, EventCtx};
//! # use anyhow::Result;
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let cfg = DeviceConfig {
//!     hw: Some(HwKind::Switch),
//!     key: Some("16characterkey__".to_string()),
//!     ip: Some("192.168.1.40".to_string()),
//!     ..DeviceConfig::default()
//! };
//! let device = Device::new("bf132465xxxxxxxx", cfg);
//! // normally discovery drives this
//! device.update(Some(DiscoveryStatus::Online), None);
//!
//! let ctx = EventCtx::new("api.get");
//! let status = device.get_status(&ctx, false).await?;
//! println!("switch is {:?}", status);
//! device.set_status(serde_json::json!(true), &EventCtx::new("api.set")).await?;
//! # Ok(())
//! # }
//! ```
//!
#![doc = include_str!("../readme.md")]

pub mod cipher;
pub mod codec;
pub mod config;
pub mod device;
pub mod discover;
pub mod error;
pub mod queue;
pub mod valueops;

#[cfg(test)]
pub(crate) mod testutil;
