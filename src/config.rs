//! Hub configuration: one entry per device plus discovery settings.
//!
//! Everything has a default so a device entry can be as small as
//! `{"hw": "switch", "key": "..."}`; discovery fills in the address and
//! protocol version later.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::valueops::ValueOp;

/// Which kind of hardware binding a device has. Devices without one are
/// placeholders that reject status operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwKind {
    /// A switch we connect out to and command over TCP.
    Switch,
    /// A sensor that pushes its readings to us.
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub hw: Option<HwKind>,
    /// 16-character device key for payload encryption.
    pub key: Option<String>,
    /// Static address; discovery metadata overrides it.
    pub ip: Option<String>,
    pub port: u16,
    /// Protocol version ("3.1" or "3.3") when discovery does not report one.
    pub version: Option<String>,
    /// Data-point index of the switch state.
    pub dps: u32,
    /// Serve cached status for this many seconds; 0 disables the cache.
    pub status_cache: u64,
    /// Poll status every this many seconds while online; 0 disables.
    pub refresh_status: u64,
    /// Collapse concurrent status reads into one hardware query.
    pub collapse_gets: bool,
    /// Consecutive connect failures before the device is considered down.
    pub fails_to_miss: u32,
    /// Keep the connection open between commands.
    pub persistent: bool,
    /// Connect timeout in seconds.
    pub socket_timeout: u64,
    /// Optional total per-command timeout in seconds.
    pub command_timeout: Option<u64>,
    /// Push devices: seconds without a report before the status is
    /// presumed gone.
    pub max_time_since_last_seen: u64,
    /// Push devices: conversion chain applied to reported values.
    pub convert: Vec<ValueOp>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hw: None,
            key: None,
            ip: None,
            port: 6668,
            version: None,
            dps: 1,
            status_cache: 0,
            refresh_status: 0,
            collapse_gets: false,
            fails_to_miss: 5,
            persistent: false,
            socket_timeout: 2,
            command_timeout: None,
            max_time_since_last_seen: 300,
            convert: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Device id (the hardware `gwId`) to its configuration.
    pub devices: HashMap<String, DeviceConfig>,
    /// Shared secret for decrypting discovery broadcasts.
    pub discovery_secret: Option<String>,
    pub discovery_port: u16,
    /// Seconds without a broadcast before a discovered device is dropped.
    pub unseen_timeout: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            discovery_secret: None,
            discovery_port: 6667,
            unseen_timeout: 86400,
        }
    }
}

pub fn load_config(path: &Path) -> Result<HubConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_device_entry_gets_defaults() {
        let cfg: HubConfig = serde_json::from_str(
            r#"{"devices": {"dev1": {"hw": "switch", "key": "0123456789abcdef"}}}"#,
        )
        .unwrap();
        let dev = &cfg.devices["dev1"];
        assert_eq!(dev.hw, Some(HwKind::Switch));
        assert_eq!(dev.port, 6668);
        assert_eq!(dev.dps, 1);
        assert_eq!(dev.fails_to_miss, 5);
        assert_eq!(dev.socket_timeout, 2);
        assert_eq!(dev.max_time_since_last_seen, 300);
        assert_eq!(cfg.discovery_port, 6667);
        assert_eq!(cfg.unseen_timeout, 86400);
    }

    #[test]
    fn push_entry_with_convert_chain() {
        let cfg: DeviceConfig = serde_json::from_str(
            r#"{
                "hw": "push",
                "max_time_since_last_seen": 60,
                "convert": [
                    { "type": "xmulti", "value_max_out": 100.0, "value_max_in": 4095.0 },
                    { "type": "round", "decimals": 0 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.hw, Some(HwKind::Push));
        assert_eq!(cfg.convert.len(), 2);
        assert_eq!(cfg.max_time_since_last_seen, 60);
    }

    #[test]
    fn unknown_hw_kind_is_rejected() {
        let parsed: Result<DeviceConfig, _> = serde_json::from_str(r#"{"hw": "zigbee"}"#);
        assert!(parsed.is_err());
    }
}
