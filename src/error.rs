//! Classified errors for the protocol engine.
//!
//! These are the expected failure modes of talking to a device; they are
//! returned to callers, never thrown as panics. Queue-ordering corruption
//! (a reply arriving while the head command is not in `sent` state) is a
//! programming error and panics instead.

/// Errors surfaced by the codec, command queue and device engine.
///
/// `Clone` so one result can be fanned out to every collapsed waiter.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The device was configured without a hardware binding.
    #[error("device has no hardware binding")]
    NoHardware,

    /// Discovery has not (or no longer) reported the device as online.
    #[error("device is not online")]
    DeviceOffline,

    /// Connecting to the device did not complete within the connect timeout.
    #[error("timed out connecting to device")]
    ConnectTimeout,

    /// Connecting to the device failed outright.
    #[error("connect failed: {0}")]
    ConnectError(String),

    /// The command expired in the queue before it was sent.
    #[error("command expired before a reply arrived")]
    CommandTimeout,

    /// A frame could not be decoded; the connection is desynchronized.
    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    /// The device answered with an explicit non-success return code.
    #[error("device returned error code {0}")]
    HardwareError(u32),

    /// The payload does not fit the frame's addressable length.
    #[error("payload too large to encode ({0} bytes)")]
    EncodingError(usize),

    /// A reported value could not be transformed (bad operand or result).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The queue or device was shut down while the command was pending.
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Connectivity errors count toward the device down-threshold;
    /// everything else does not.
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Error::ConnectTimeout | Error::ConnectError(_))
    }
}
