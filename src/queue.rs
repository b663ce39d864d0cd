//! Command correlation layer: one FIFO queue of pending commands per
//! device connection.
//!
//! The hardware protocol carries no request ids, so correctness depends on
//! exactly one command being on the wire at a time and the device replying
//! in send order. The queue owns the TCP connection, connects on demand,
//! and recovers from broken or desynchronized connections by reverting the
//! in-flight command and resending it after reconnect (at-least-once
//! delivery; duplicated side effects are a known limitation of the
//! hardware).

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cipher::PayloadCipher;
use crate::codec::{self, Decoder, Frame, Version};
use crate::error::Error;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const FAR_FUTURE: Duration = Duration::from_secs(3600);

/// Connection parameters for one device link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// `ip:port`, or `None` while discovery has not supplied an address.
    pub addr: Option<String>,
    pub key: [u8; 16],
    pub version: Version,
    /// Keep the connection open between commands and retry connects
    /// forever instead of failing the queue.
    pub persistent: bool,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandStatus {
    Waiting,
    Sent,
}

struct PendingCommand {
    command: u32,
    payload: serde_json::Map<String, Value>,
    status: CommandStatus,
    deadline: Option<Instant>,
    reply: oneshot::Sender<Result<Frame, Error>>,
}

enum Op {
    Append(PendingCommand),
    Flush(Error),
    Reconfigure(LinkConfig),
    Shutdown,
}

/// Handle to the background queue task. Cheap to clone; dropping every
/// handle stops the task and fails any pending commands with
/// [`Error::Closed`].
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Op>,
}

impl CommandQueue {
    pub fn new(cfg: LinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = QueueTask {
            rx,
            cfg,
            queue: VecDeque::new(),
            link: None,
            seq: rand::random::<u16>() as u32,
        };
        let _ = tokio::spawn(task.run());
        Self { tx }
    }

    /// Enqueue a command and wait for its reply. A `timeout` bounds the
    /// total wait; a command that expires before being sent never reaches
    /// the wire.
    pub async fn request(
        &self,
        command: u32,
        payload: serde_json::Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Frame, Error> {
        let (reply, rx) = oneshot::channel();
        let cmd = PendingCommand {
            command,
            payload,
            status: CommandStatus::Waiting,
            deadline: timeout.map(|t| Instant::now() + t),
            reply,
        };
        self.tx.send(Op::Append(cmd)).map_err(|_| Error::Closed)?;
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Fail every queued command with `err` and drop the connection.
    pub fn flush(&self, err: Error) {
        let _ = self.tx.send(Op::Flush(err));
    }

    /// Apply new link parameters; a changed address, key or version tears
    /// the current connection down (the head command is resent on the new
    /// one).
    pub fn reconfigure(&self, cfg: LinkConfig) {
        let _ = self.tx.send(Op::Reconfigure(cfg));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Op::Shutdown);
    }
}

struct Link {
    stream: TcpStream,
    decoder: Decoder,
}

enum ReplyOutcome {
    /// Head resolved with a reply (or a hardware error code).
    Resolved,
    /// Connection dropped by the peer or a read error.
    LinkLost,
    /// Stream desynchronized; reconnect and resend.
    Corrupt,
    /// The sent head command passed its deadline.
    TimedOut,
    /// A control op (flush/reconfigure) invalidated the in-flight state.
    Preempted,
    Stop,
}

struct QueueTask {
    rx: mpsc::UnboundedReceiver<Op>,
    cfg: LinkConfig,
    queue: VecDeque<PendingCommand>,
    link: Option<Link>,
    seq: u32,
}

impl QueueTask {
    async fn run(mut self) {
        loop {
            self.expire_waiting();

            if self.queue.is_empty() {
                if !self.cfg.persistent && self.link.is_some() {
                    log::debug!("queue drained, closing connection");
                    self.link = None;
                }
                match self.rx.recv().await {
                    Some(op) => {
                        if !self.handle_op(op) {
                            break;
                        }
                    }
                    None => break,
                }
                continue;
            }

            if self.link.is_none() {
                match self.connect().await {
                    Ok(link) => self.link = Some(link),
                    Err(err) => {
                        if self.cfg.persistent {
                            log::debug!("connect failed ({}), retrying", err);
                            if !self.idle_wait(RECONNECT_DELAY).await {
                                break;
                            }
                        } else {
                            log::debug!("connect failed ({}), flushing queue", err);
                            self.flush_all(err);
                        }
                        continue;
                    }
                }
            }

            if !self.send_head().await {
                self.drop_link();
                if !self.idle_wait(RECONNECT_DELAY).await {
                    break;
                }
                continue;
            }
            if !self.head_is_sent() {
                // head failed during encode or expired; move on
                continue;
            }

            match self.wait_reply().await {
                ReplyOutcome::Resolved | ReplyOutcome::Preempted => {}
                ReplyOutcome::LinkLost => {
                    log::debug!("connection lost while a command was in flight");
                    self.drop_link();
                    if !self.idle_wait(RECONNECT_DELAY).await {
                        break;
                    }
                }
                ReplyOutcome::Corrupt => {
                    log::warn!("corrupt frame, reconnecting to resend");
                    self.drop_link();
                }
                ReplyOutcome::TimedOut => {
                    // A late reply to this command could be attributed to
                    // the next one, so the connection goes down with it.
                    log::debug!("sent command timed out, dropping connection");
                    self.link = None;
                    self.fail_head(Error::CommandTimeout);
                }
                ReplyOutcome::Stop => break,
            }
        }
        self.flush_all(Error::Closed);
    }

    async fn connect(&mut self) -> Result<Link, Error> {
        let addr = self
            .cfg
            .addr
            .clone()
            .ok_or_else(|| Error::ConnectError("device address unknown".into()))?;
        log::debug!("connecting to {}", addr);
        let stream = tokio::time::timeout(self.cfg.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::ConnectTimeout)?
            .map_err(|e| Error::ConnectError(e.to_string()))?;
        let cipher = PayloadCipher::new(&self.cfg.key);
        Ok(Link {
            stream,
            decoder: Decoder::new(cipher, self.cfg.version),
        })
    }

    /// Encode and send the head command if it is still waiting. Returns
    /// false only on a transport write failure.
    async fn send_head(&mut self) -> bool {
        let Some(head) = self.queue.front() else {
            return true;
        };
        if head.status == CommandStatus::Sent {
            return true;
        }
        self.seq = self.seq.wrapping_add(1);
        let cipher = PayloadCipher::new(&self.cfg.key);
        let bytes = match codec::encode(
            head.command,
            head.payload.clone(),
            self.cfg.version,
            &cipher,
            self.seq,
        ) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail_head(err);
                return true;
            }
        };
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.stream.write_all(&bytes).await {
            Ok(()) => {
                if let Some(head) = self.queue.front_mut() {
                    head.status = CommandStatus::Sent;
                }
                true
            }
            Err(err) => {
                log::debug!("send failed: {}", err);
                false
            }
        }
    }

    async fn wait_reply(&mut self) -> ReplyOutcome {
        let mut buf = vec![0u8; 4096];
        loop {
            // The reply may already be buffered (replies can arrive
            // batched with the previous command's bytes).
            loop {
                let Some(link) = self.link.as_mut() else {
                    return ReplyOutcome::Preempted;
                };
                match link.decoder.next() {
                    Ok(Some(frame)) if frame.is_empty() && frame.hardware_error().is_none() => {
                        // empty frames are not replies
                        continue;
                    }
                    Ok(Some(frame)) => {
                        self.resolve_head(frame);
                        return ReplyOutcome::Resolved;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::debug!("decode error: {}", err);
                        return ReplyOutcome::Corrupt;
                    }
                }
            }

            let deadline = self.queue.front().and_then(|c| c.deadline);
            enum Wake {
                Read(std::io::Result<usize>),
                Op(Option<Op>),
                Deadline,
            }
            let wake = {
                let Self { rx, link, .. } = self;
                let Some(link) = link.as_mut() else {
                    return ReplyOutcome::Preempted;
                };
                tokio::select! {
                    r = link.stream.read(&mut buf) => Wake::Read(r),
                    op = rx.recv() => Wake::Op(op),
                    _ = tokio::time::sleep_until(
                        deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE)
                    ), if deadline.is_some() => Wake::Deadline,
                }
            };
            match wake {
                Wake::Read(Ok(0)) => return ReplyOutcome::LinkLost,
                Wake::Read(Ok(n)) => {
                    if let Some(link) = self.link.as_mut() {
                        link.decoder.extend(&buf[..n]);
                    }
                }
                Wake::Read(Err(err)) => {
                    log::debug!("read error: {}", err);
                    return ReplyOutcome::LinkLost;
                }
                Wake::Op(None) => return ReplyOutcome::Stop,
                Wake::Op(Some(op)) => {
                    if !self.handle_op(op) {
                        return ReplyOutcome::Stop;
                    }
                    if self.link.is_none() || !self.head_is_sent() {
                        return ReplyOutcome::Preempted;
                    }
                }
                Wake::Deadline => return ReplyOutcome::TimedOut,
            }
        }
    }

    /// Sleep out a backoff while still serving control ops. Returns false
    /// when the task should stop.
    async fn idle_wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let op = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                op = self.rx.recv() => op,
            };
            match op {
                Some(op) => {
                    if !self.handle_op(op) {
                        return false;
                    }
                }
                None => return false,
            }
        }
    }

    /// Returns false on shutdown.
    fn handle_op(&mut self, op: Op) -> bool {
        match op {
            Op::Append(cmd) => {
                self.queue.push_back(cmd);
                true
            }
            Op::Flush(err) => {
                log::debug!("flushing {} queued commands: {}", self.queue.len(), err);
                self.link = None;
                self.flush_all(err);
                true
            }
            Op::Reconfigure(cfg) => {
                if cfg != self.cfg {
                    log::debug!(
                        "link reconfigured, address {:?} -> {:?}",
                        self.cfg.addr,
                        cfg.addr
                    );
                    self.drop_link();
                    self.cfg = cfg;
                }
                true
            }
            Op::Shutdown => false,
        }
    }

    fn head_is_sent(&self) -> bool {
        self.queue
            .front()
            .map_or(false, |c| c.status == CommandStatus::Sent)
    }

    /// Tear the connection down, reverting an in-flight head so it is
    /// resent on the next one.
    fn drop_link(&mut self) {
        self.link = None;
        if let Some(head) = self.queue.front_mut() {
            if head.status == CommandStatus::Sent {
                head.status = CommandStatus::Waiting;
            }
        }
    }

    fn resolve_head(&mut self, frame: Frame) {
        let Some(head) = self.queue.pop_front() else {
            panic!("reply received with an empty command queue");
        };
        // Replies match the queue strictly FIFO; a head that was never
        // sent means the ordering state is corrupted.
        assert_eq!(
            head.status,
            CommandStatus::Sent,
            "reply received but the queue head was never sent"
        );
        let result = match frame.hardware_error() {
            Some(code) => Err(Error::HardwareError(code)),
            None => Ok(frame),
        };
        let _ = head.reply.send(result);
    }

    fn fail_head(&mut self, err: Error) {
        if let Some(head) = self.queue.pop_front() {
            let _ = head.reply.send(Err(err));
        }
    }

    /// Drop expired commands from the front of the queue before they reach
    /// the wire.
    fn expire_waiting(&mut self) {
        let now = Instant::now();
        while let Some(head) = self.queue.front() {
            let expired = head.status == CommandStatus::Waiting
                && head.deadline.map_or(false, |d| d <= now);
            if !expired {
                break;
            }
            log::debug!("dropping expired command before send");
            self.fail_head(Error::CommandTimeout);
        }
    }

    fn flush_all(&mut self, err: Error) {
        while let Some(cmd) = self.queue.pop_front() {
            let _ = cmd.reply.send(Err(err.clone()));
        }
    }
}
