//! Per-device status engine.
//!
//! A [`Device`] sits between callers (API handlers, the refresh timer,
//! discovery) and the command queue. It enforces preconditions, caches the
//! last known status, optionally collapses concurrent reads into a single
//! hardware query, tracks device health from consecutive connect failures,
//! and fans status changes out to subscribers.
//!
//! Two hardware bindings exist: `switch` devices we connect out to and
//! command, and `push` devices that report their own readings through
//! [`Device::put_status`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{self, DeviceMetadata, Frame, Version};
use crate::config::{DeviceConfig, HwKind};
use crate::error::Error;
use crate::queue::{CommandQueue, LinkConfig};
use crate::valueops;

/// What discovery currently says about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    Online,
    Offline,
}

/// Whether the device has been answering lately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Up,
    Down,
}

/// Caller-supplied context carried through to status events, so a
/// subscriber can tell an API write from a refresh poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCtx {
    pub origin: String,
}

impl EventCtx {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
        }
    }
}

/// Broadcast on every observed status change. `status` is `None` when the
/// device state became unknown (went down, stopped reporting).
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub device_id: String,
    pub status: Option<Value>,
    pub ctx: EventCtx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Switch,
    Push,
    None,
}

type StatusResult = Result<Option<Value>, Error>;

struct DeviceState {
    discovery_status: DiscoveryStatus,
    health: Health,
    switch_status: Option<Value>,
    last_status_update: Option<Instant>,
    last_seen: Option<SystemTime>,
    connect_errors: u32,
    get_inflight: bool,
    waiters: Vec<oneshot::Sender<StatusResult>>,
    gw_id: String,
    addr: Option<String>,
    version: Version,
    hw_metadata: Option<DeviceMetadata>,
    refresh_task: Option<JoinHandle<()>>,
    gone_task: Option<JoinHandle<()>>,
}

struct DeviceInner {
    id: String,
    cfg: DeviceConfig,
    binding: Binding,
    key: Option<[u8; 16]>,
    queue: Option<CommandQueue>,
    state: Mutex<DeviceState>,
    events: broadcast::Sender<StatusEvent>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        if let Ok(st) = self.state.get_mut() {
            if let Some(task) = st.refresh_task.take() {
                task.abort();
            }
            if let Some(task) = st.gone_task.take() {
                task.abort();
            }
        }
    }
}

/// One managed device. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

/// Serializable view of the device for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub discovery_status: DiscoveryStatus,
    pub health: Health,
    pub status: Option<Value>,
    /// Unix seconds of the last successful contact.
    pub last_seen: Option<u64>,
    pub hw_metadata: Option<DeviceMetadata>,
}

impl Device {
    /// Must be called within a tokio runtime; the command queue and the
    /// refresh timer are spawned here.
    pub fn new(id: impl Into<String>, cfg: DeviceConfig) -> Device {
        let id = id.into();

        let key: Option<[u8; 16]> = match (&cfg.hw, &cfg.key) {
            (Some(HwKind::Switch), Some(k)) => match k.as_bytes().try_into() {
                Ok(k) => Some(k),
                Err(_) => {
                    log::warn!("{}: device key must be 16 characters, ignoring binding", id);
                    None
                }
            },
            _ => None,
        };
        let binding = match cfg.hw {
            Some(HwKind::Switch) if key.is_some() => Binding::Switch,
            Some(HwKind::Switch) | None => Binding::None,
            Some(HwKind::Push) => Binding::Push,
        };

        let version = cfg
            .version
            .as_deref()
            .and_then(|v| {
                let parsed = Version::parse(v);
                if parsed.is_none() {
                    log::warn!("{}: unknown protocol version {:?}, using 3.3", id, v);
                }
                parsed
            })
            .unwrap_or(Version::V33);
        let addr = cfg.ip.as_ref().map(|ip| format!("{}:{}", ip, cfg.port));

        let queue = match (binding, key) {
            (Binding::Switch, Some(key)) => Some(CommandQueue::new(LinkConfig {
                addr: addr.clone(),
                key,
                version,
                persistent: cfg.persistent,
                connect_timeout: Duration::from_secs(cfg.socket_timeout),
            })),
            _ => None,
        };

        let (events, _) = broadcast::channel(32);
        let refresh_interval = cfg.refresh_status;
        let inner = Arc::new(DeviceInner {
            state: Mutex::new(DeviceState {
                discovery_status: DiscoveryStatus::Offline,
                health: Health::Up,
                switch_status: None,
                last_status_update: None,
                last_seen: None,
                connect_errors: 0,
                get_inflight: false,
                waiters: Vec::new(),
                gw_id: id.clone(),
                addr,
                version,
                hw_metadata: None,
                refresh_task: None,
                gone_task: None,
            }),
            id,
            cfg,
            binding,
            key,
            queue,
            events,
        });
        let device = Device { inner };

        if binding == Binding::Switch && refresh_interval > 0 {
            let task = device.spawn_refresh_timer(Duration::from_secs(refresh_interval));
            device.lock_state().refresh_task = Some(task);
        }
        device
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Read the switch status, preferring the cache when it is fresh.
    ///
    /// With `collapse_gets` configured, callers arriving while a hardware
    /// query is already in flight wait for that query's result instead of
    /// issuing their own.
    pub async fn get_status(&self, ctx: &EventCtx, ignore_cache: bool) -> StatusResult {
        match self.inner.binding {
            Binding::Switch => {}
            Binding::Push => return self.reported_status(),
            Binding::None => return Err(Error::NoHardware),
        }

        enum Plan {
            Cached(Option<Value>),
            Wait(oneshot::Receiver<StatusResult>),
            Lead(oneshot::Receiver<StatusResult>),
            Issue,
        }
        let plan = {
            let mut st = self.lock_state();
            if st.discovery_status != DiscoveryStatus::Online {
                return Err(Error::DeviceOffline);
            }
            let cfg = &self.inner.cfg;
            let fresh = !ignore_cache
                && cfg.status_cache > 0
                && st
                    .last_status_update
                    .map_or(false, |t| t.elapsed() < Duration::from_secs(cfg.status_cache));
            if fresh {
                log::debug!("{}: serving status from cache", self.inner.id);
                Plan::Cached(st.switch_status.clone())
            } else if cfg.collapse_gets {
                let (tx, rx) = oneshot::channel();
                st.waiters.push(tx);
                if st.get_inflight {
                    log::debug!("{}: joining in-flight status query", self.inner.id);
                    Plan::Wait(rx)
                } else {
                    st.get_inflight = true;
                    Plan::Lead(rx)
                }
            } else {
                Plan::Issue
            }
        };

        match plan {
            Plan::Cached(status) => Ok(status),
            Plan::Wait(rx) => rx.await.unwrap_or(Err(Error::Closed)),
            Plan::Lead(rx) => {
                // the query runs detached: a caller that gives up early
                // must not strand the in-flight flag and the waiters
                // queued behind it
                let device = self.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let res = device.query_status().await;
                    device.finish_get(res, &ctx);
                });
                rx.await.unwrap_or(Err(Error::Closed))
            }
            Plan::Issue => {
                let res = self.query_status().await;
                self.finish_get(res, ctx)
            }
        }
    }

    /// Write the switch status and return what the device reports back.
    /// Writes are never collapsed or served from cache.
    pub async fn set_status(&self, value: Value, ctx: &EventCtx) -> StatusResult {
        if self.inner.binding != Binding::Switch {
            return Err(Error::NoHardware);
        }
        {
            let st = self.lock_state();
            if st.discovery_status != DiscoveryStatus::Online {
                return Err(Error::DeviceOffline);
            }
        }

        let payload = self.control_payload(value);
        let res = match self.request(payload).await {
            Ok(frame) => Ok(self.extract_dps(&frame)),
            Err(err) => Err(err),
        };

        let mut st = self.lock_state();
        match &res {
            Ok(status) => {
                self.note_success(&mut st);
                self.apply_status(&mut st, status.clone(), ctx);
            }
            Err(err) => {
                log::warn!("{}: set status failed: {}", self.inner.id, err);
                self.note_error(&mut st, err, ctx);
            }
        }
        res
    }

    /// Accept a reading pushed by the hardware. The configured conversion
    /// chain is applied first; the device counts as online from here until
    /// it stops reporting for `max_time_since_last_seen` seconds.
    pub fn put_status(&self, value: Value, ctx: &EventCtx) -> StatusResult {
        if self.inner.binding != Binding::Push {
            return Err(Error::NoHardware);
        }
        let value = valueops::apply_ops(value, &self.inner.cfg.convert)?;

        let mut st = self.lock_state();
        if let Some(task) = st.gone_task.take() {
            task.abort();
        }
        st.discovery_status = DiscoveryStatus::Online;
        st.health = Health::Up;
        st.last_seen = Some(SystemTime::now());
        st.last_status_update = Some(Instant::now());
        self.apply_status(&mut st, Some(value.clone()), ctx);
        st.gone_task = Some(self.spawn_gone_timer());
        Ok(Some(value))
    }

    /// Feed in a discovery result: an online/offline transition and/or
    /// fresh broadcast metadata. An address or protocol version change
    /// reconfigures the command link.
    pub fn update(&self, status: Option<DiscoveryStatus>, meta: Option<DeviceMetadata>) {
        let mut st = self.lock_state();
        if let Some(ds) = status {
            if ds != st.discovery_status {
                log::info!(
                    "{}: discovery status {:?} -> {:?}",
                    self.inner.id,
                    st.discovery_status,
                    ds
                );
                st.discovery_status = ds;
                if ds == DiscoveryStatus::Offline {
                    if let Some(queue) = &self.inner.queue {
                        queue.flush(Error::DeviceOffline);
                    }
                }
            }
            if ds == DiscoveryStatus::Online {
                st.last_seen = Some(SystemTime::now());
            }
        }

        if let Some(meta) = meta {
            st.gw_id = meta.gw_id.clone();
            let mut relink = false;
            if let Some(ip) = &meta.ip {
                let addr = format!("{}:{}", ip, self.inner.cfg.port);
                if st.addr.as_deref() != Some(addr.as_str()) {
                    log::info!("{}: address changed to {}", self.inner.id, addr);
                    st.addr = Some(addr);
                    relink = true;
                }
            }
            if let Some(v) = meta.version.as_deref() {
                match Version::parse(v) {
                    Some(version) if version != st.version => {
                        st.version = version;
                        relink = true;
                    }
                    Some(_) => {}
                    None => log::warn!("{}: unknown protocol version {:?}", self.inner.id, v),
                }
            }
            st.hw_metadata = Some(meta);

            if relink {
                if let (Some(queue), Some(key)) = (&self.inner.queue, self.inner.key) {
                    queue.reconfigure(LinkConfig {
                        addr: st.addr.clone(),
                        key,
                        version: st.version,
                        persistent: self.inner.cfg.persistent,
                        connect_timeout: Duration::from_secs(self.inner.cfg.socket_timeout),
                    });
                }
            }
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let st = self.lock_state();
        DeviceSnapshot {
            id: self.inner.id.clone(),
            discovery_status: st.discovery_status,
            health: st.health,
            status: st.switch_status.clone(),
            last_seen: st.last_seen.and_then(|t| {
                t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
            }),
            hw_metadata: st.hw_metadata.clone(),
        }
    }

    /// Stop the timers and the command queue; pending commands fail with
    /// [`Error::Closed`].
    pub fn shutdown(&self) {
        let mut st = self.lock_state();
        if let Some(task) = st.refresh_task.take() {
            task.abort();
        }
        if let Some(task) = st.gone_task.take() {
            task.abort();
        }
        if let Some(queue) = &self.inner.queue {
            queue.shutdown();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Push devices answer reads from the stored reading.
    fn reported_status(&self) -> StatusResult {
        let st = self.lock_state();
        if st.discovery_status != DiscoveryStatus::Online {
            return Err(Error::DeviceOffline);
        }
        Ok(st.switch_status.clone())
    }

    async fn query_status(&self) -> StatusResult {
        let payload = self.control_payload(Value::Null);
        let frame = self.request(payload).await?;
        Ok(self.extract_dps(&frame))
    }

    async fn request(&self, payload: serde_json::Map<String, Value>) -> Result<Frame, Error> {
        let Some(queue) = &self.inner.queue else {
            return Err(Error::NoHardware);
        };
        let timeout = self.inner.cfg.command_timeout.map(Duration::from_secs);
        queue.request(codec::CMD_CONTROL, payload, timeout).await
    }

    /// The control payload queries with a null data-point value and writes
    /// with a concrete one.
    fn control_payload(&self, value: Value) -> serde_json::Map<String, Value> {
        let gw_id = self.lock_state().gw_id.clone();
        let mut dps = serde_json::Map::new();
        dps.insert(self.inner.cfg.dps.to_string(), value);
        let mut payload = serde_json::Map::new();
        payload.insert("gwId".into(), Value::String(gw_id.clone()));
        payload.insert("devId".into(), Value::String(gw_id.clone()));
        payload.insert("uid".into(), Value::String(gw_id));
        payload.insert("dps".into(), Value::Object(dps));
        payload
    }

    /// The configured data-point out of a reply; a missing or null
    /// data-point means the status is unknown.
    fn extract_dps(&self, frame: &Frame) -> Option<Value> {
        let value = frame
            .payload
            .as_ref()?
            .get("dps")?
            .get(self.inner.cfg.dps.to_string())?
            .clone();
        match value {
            Value::Null => None,
            value => Some(value),
        }
    }

    fn finish_get(&self, res: StatusResult, ctx: &EventCtx) -> StatusResult {
        let mut st = self.lock_state();
        match &res {
            Ok(status) => {
                self.note_success(&mut st);
                self.apply_status(&mut st, status.clone(), ctx);
            }
            Err(err) => {
                log::warn!("{}: status query failed: {}", self.inner.id, err);
                self.note_error(&mut st, err, ctx);
            }
        }
        st.get_inflight = false;
        // every collapsed waiter gets this result
        for waiter in st.waiters.drain(..) {
            let _ = waiter.send(res.clone());
        }
        res
    }

    fn note_success(&self, st: &mut DeviceState) {
        st.health = Health::Up;
        st.connect_errors = 0;
        st.last_status_update = Some(Instant::now());
        st.last_seen = Some(SystemTime::now());
    }

    /// Connectivity failures accumulate toward the down-threshold; the
    /// transition to down clears the status and emits exactly one null
    /// event tagged with the triggering origin.
    fn note_error(&self, st: &mut DeviceState, err: &Error, ctx: &EventCtx) {
        if !err.is_connect_error() {
            return;
        }
        st.connect_errors += 1;
        if st.connect_errors >= self.inner.cfg.fails_to_miss && st.health == Health::Up {
            log::warn!(
                "{}: {} consecutive connect failures, marking device down",
                self.inner.id,
                st.connect_errors
            );
            st.health = Health::Down;
            st.switch_status = None;
            let _ = self.inner.events.send(StatusEvent {
                device_id: self.inner.id.clone(),
                status: None,
                ctx: EventCtx {
                    origin: format!("{}.too_many_errors", ctx.origin),
                },
            });
        }
    }

    fn apply_status(&self, st: &mut DeviceState, status: Option<Value>, ctx: &EventCtx) {
        if st.switch_status == status {
            log::trace!("{}: status unchanged ({})", self.inner.id, ctx.origin);
            return;
        }
        log::info!(
            "{}: status {:?} -> {:?} ({})",
            self.inner.id,
            st.switch_status,
            status,
            ctx.origin
        );
        st.switch_status = status.clone();
        let _ = self.inner.events.send(StatusEvent {
            device_id: self.inner.id.clone(),
            status,
            ctx: ctx.clone(),
        });
    }

    fn spawn_refresh_timer(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                let device = Device { inner };
                let online =
                    device.lock_state().discovery_status == DiscoveryStatus::Online;
                if online {
                    let _ = device.get_status(&EventCtx::new("refresh"), true).await;
                }
            }
        })
    }

    /// Armed on every push report; firing means the hardware went quiet
    /// long enough that its last reading cannot be trusted.
    fn spawn_gone_timer(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let ttl = Duration::from_secs(self.inner.cfg.max_time_since_last_seen);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else { return };
            let device = Device { inner };
            log::info!("{}: no report for {:?}, clearing status", device.inner.id, ttl);
            let mut st = device.lock_state();
            device.apply_status(&mut st, None, &EventCtx::new("refresh.long_time_no_see"));
        })
    }
}
