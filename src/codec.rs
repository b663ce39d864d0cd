//! Binary wire codec for the switch hardware.
//!
//! Every message is one frame:
//! `prefix(4B)=0x000055AA | sequence(4B) | command(4B) | length(4B) |
//! payload(length-8) | crc32(4B) | suffix(4B)=0x0000AA55`, all big endian.
//! The CRC covers every byte before the CRC field; the length field counts
//! the payload plus the CRC and suffix. Payload encryption depends on the
//! protocol version, see [`encode`].
//!
//! Decoding is incremental: [`Decoder`] buffers partial input and only
//! consumes bytes once a complete frame is available, so it can be fed
//! from a socket in arbitrary chunks.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::cipher::PayloadCipher;
use crate::error::Error;

pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;

/// The control command: query or set data-points.
pub const CMD_CONTROL: u32 = 7;
/// The status probe; 3.3 devices expect its payload without a version marker.
pub const CMD_STATUS: u32 = 0x0a;

const HEADER_SIZE: usize = 16;
/// The serializer addresses the frame length with a single byte.
const MAX_ENCODE_LEN: usize = 0xff;
/// Sanity cap on incoming length fields before allocating.
const MAX_DECODE_LEN: usize = 64 * 1024;

/// Hardware protocol versions this codec speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V31,
    V33,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "3.1" => Some(Version::V31),
            "3.3" => Some(Version::V33),
            _ => None,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Version::V31 => write!(f, "3.1"),
            Version::V33 => write!(f, "3.3"),
        }
    }
}

/// One decoded frame. `ret_code` is present only on device-originated
/// frames that carry a return code; a non-zero value means the device
/// rejected the command. `payload` is `None` for empty frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u32,
    pub command: u32,
    pub ret_code: Option<u32>,
    pub payload: Option<Value>,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    /// Non-success return code, if the device reported one.
    pub fn hardware_error(&self) -> Option<u32> {
        match self.ret_code {
            Some(0) | None => None,
            Some(code) => Some(code),
        }
    }
}

fn read_u32_be(buf: &[u8], off: usize) -> u32 {
    BigEndian::read_u32(&buf[off..off + 4])
}

fn unix_now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

/// Encode one logical command into a complete frame.
///
/// The payload map gets a `t` timestamp injected when absent. Version 3.3
/// encrypts the serialized payload and, for every command except the status
/// probe, prefixes the 15-byte `"3.3"` marker. Version 3.1 encrypts only
/// the control command and prefixes `"3.1"` plus an MD5 signature over the
/// base64 ciphertext.
pub fn encode(
    command: u32,
    mut payload: serde_json::Map<String, Value>,
    version: Version,
    cipher: &PayloadCipher,
    seq: u32,
) -> Result<Vec<u8>, Error> {
    payload
        .entry("t")
        .or_insert_with(|| Value::String(unix_now()));
    // Display on Value produces compact JSON and cannot fail.
    let json = Value::Object(payload).to_string().into_bytes();

    let body = match version {
        Version::V33 => {
            let enc = cipher.encrypt(&json);
            if command == CMD_STATUS {
                enc
            } else {
                let mut framed = Vec::with_capacity(15 + enc.len());
                framed.extend_from_slice(b"3.3");
                framed.extend_from_slice(&[0u8; 12]);
                framed.extend_from_slice(&enc);
                framed
            }
        }
        Version::V31 if command == CMD_CONTROL => {
            let b64 = BASE64.encode(cipher.encrypt(&json)).into_bytes();
            let sig = crate::cipher::sign_v31(&b64, cipher.key());
            let mut framed = Vec::with_capacity(3 + sig.len() + b64.len());
            framed.extend_from_slice(b"3.1");
            framed.extend_from_slice(&sig);
            framed.extend_from_slice(&b64);
            framed
        }
        Version::V31 => json,
    };

    if body.len() + 8 > MAX_ENCODE_LEN {
        return Err(Error::EncodingError(body.len()));
    }
    Ok(wrap_frame(seq, command, &body))
}

/// Wrap a payload body into a full frame (header, CRC, suffix).
pub(crate) fn wrap_frame(seq: u32, command: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + 8);
    out.extend_from_slice(&PREFIX.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&command.to_be_bytes());
    out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(body);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&SUFFIX.to_be_bytes());
    out
}

struct RawFrame {
    seq: u32,
    command: u32,
    ret_code: Option<u32>,
    payload: Vec<u8>,
    /// Total frame size in the input buffer.
    total: usize,
}

/// Split one frame off the front of `buf` without interpreting the payload.
/// `Ok(None)` means more bytes are needed; nothing is consumed either way.
fn split_frame(buf: &[u8]) -> Result<Option<RawFrame>, Error> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let prefix = read_u32_be(buf, 0);
    if prefix != PREFIX {
        return Err(Error::CorruptMessage(format!(
            "unknown frame prefix {:08x}",
            prefix
        )));
    }
    let seq = read_u32_be(buf, 4);
    let command = read_u32_be(buf, 8);
    let size = read_u32_be(buf, 12) as usize;
    if size < 8 || size > MAX_DECODE_LEN {
        return Err(Error::CorruptMessage(format!("bad frame length {}", size)));
    }
    let total = HEADER_SIZE + size;
    if buf.len() < total {
        return Ok(None);
    }
    let suffix = read_u32_be(buf, total - 4);
    if suffix != SUFFIX {
        return Err(Error::CorruptMessage(format!(
            "unknown frame suffix {:08x}",
            suffix
        )));
    }
    let crc = read_u32_be(buf, total - 8);
    let computed = crc32fast::hash(&buf[..total - 8]);
    if crc != computed {
        return Err(Error::CorruptMessage(format!(
            "crc mismatch: frame {:08x}, computed {:08x}",
            crc, computed
        )));
    }

    let mut payload = &buf[HEADER_SIZE..total - 8];
    // A return code is only present when the first word's high bytes are
    // zero; otherwise those bytes are payload data.
    let mut ret_code = None;
    if payload.len() >= 4 {
        let rc = read_u32_be(payload, 0);
        if rc & 0xFFFF_FF00 == 0 {
            ret_code = Some(rc);
            payload = &payload[4..];
        }
    }
    Ok(Some(RawFrame {
        seq,
        command,
        ret_code,
        payload: payload.to_vec(),
        total,
    }))
}

/// Incremental frame decoder for one device connection.
pub struct Decoder {
    cipher: PayloadCipher,
    version: Version,
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new(cipher: PayloadCipher, version: Version) -> Self {
        Self {
            cipher,
            version,
            buf: Vec::new(),
        }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next frame. `Ok(None)` means more bytes are
    /// needed; buffered bytes are kept for the next call. Any `Err` means
    /// the stream is desynchronized and the connection must be rebuilt;
    /// remaining buffered bytes must not be reinterpreted as a new frame.
    pub fn next(&mut self) -> Result<Option<Frame>, Error> {
        let raw = match split_frame(&self.buf)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let _ = self.buf.drain(..raw.total);

        if let Some(code) = raw.ret_code {
            if code != 0 {
                return Ok(Some(Frame {
                    seq: raw.seq,
                    command: raw.command,
                    ret_code: raw.ret_code,
                    payload: None,
                }));
            }
        }
        let payload = self.parse_payload(&raw.payload)?;
        Ok(Some(Frame {
            seq: raw.seq,
            command: raw.command,
            ret_code: raw.ret_code,
            payload,
        }))
    }

    fn parse_payload(&self, payload: &[u8]) -> Result<Option<Value>, Error> {
        if payload.is_empty() {
            return Ok(None);
        }
        let plain = if payload.first() == Some(&b'{') {
            payload.to_vec()
        } else if payload.starts_with(b"3.1") {
            // "3.1" + 16-char signature + base64 ciphertext
            if payload.len() < 19 {
                return Err(Error::CorruptMessage("truncated 3.1 payload".into()));
            }
            let enc = BASE64
                .decode(&payload[19..])
                .map_err(|e| Error::CorruptMessage(format!("bad base64 payload: {}", e)))?;
            self.cipher.decrypt(&enc)?
        } else if payload.starts_with(b"3.3") {
            // "3.3" + 12 reserved bytes + raw ciphertext
            if payload.len() < 15 {
                return Err(Error::CorruptMessage("truncated 3.3 payload".into()));
            }
            self.cipher.decrypt(&payload[15..])?
        } else if self.version == Version::V33 {
            self.cipher.decrypt(payload)?
        } else {
            return Err(Error::CorruptMessage(
                "payload is neither JSON nor a known version marker".into(),
            ));
        };
        let value = serde_json::from_slice(&plain)
            .map_err(|e| Error::CorruptMessage(format!("bad payload JSON: {}", e)))?;
        Ok(Some(value))
    }
}

/// Metadata a device announces in its discovery broadcast. Field names are
/// exactly what the hardware sends, misspellings included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceMetadata {
    #[serde(rename = "gwId")]
    pub gw_id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub active: Option<Value>,
    #[serde(default)]
    pub ablilty: Option<Value>,
    #[serde(default)]
    pub encrypt: Option<Value>,
    #[serde(rename = "productKey", default)]
    pub product_key: Option<String>,
}

/// Parse a discovery datagram, which may contain several back-to-back
/// frames. All payloads are encrypted with the fixed discovery key.
/// Payloads without usable metadata are skipped with a warning.
pub fn parse_discovery(
    datagram: &[u8],
    cipher: &PayloadCipher,
) -> Result<Vec<DeviceMetadata>, Error> {
    let mut out = Vec::new();
    parse_discovery_rec(datagram, cipher, &mut out)?;
    Ok(out)
}

fn parse_discovery_rec(
    buf: &[u8],
    cipher: &PayloadCipher,
    out: &mut Vec<DeviceMetadata>,
) -> Result<(), Error> {
    let raw = match split_frame(buf)? {
        Some(raw) => raw,
        None => {
            return Err(Error::CorruptMessage(
                "truncated discovery frame".into(),
            ))
        }
    };
    if !raw.payload.is_empty() {
        let plain = if raw.payload.first() == Some(&b'{') {
            raw.payload.clone()
        } else {
            cipher.decrypt(&raw.payload)?
        };
        match serde_json::from_slice::<DeviceMetadata>(&plain) {
            Ok(meta) => out.push(meta),
            Err(e) => log::warn!("discovery payload without usable metadata: {}", e),
        }
    }
    let rest = &buf[raw.total..];
    if rest.is_empty() {
        Ok(())
    } else {
        parse_discovery_rec(rest, cipher, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{discovery_key, PayloadCipher};
    use serde_json::json;

    const KEY: &[u8; 16] = b"0123456789abcdef";

    fn payload_map(value: Value) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("gwId".into(), json!("dev1"));
        map.insert("devId".into(), json!("dev1"));
        map.insert("dps".into(), json!({ "1": value }));
        map.insert("t".into(), json!("1700000000"));
        map
    }

    #[test]
    fn frame_layout_v33() {
        let cipher = PayloadCipher::new(KEY);
        let frame = encode(CMD_CONTROL, payload_map(json!(true)), Version::V33, &cipher, 3).unwrap();

        assert_eq!(read_u32_be(&frame, 0), PREFIX);
        assert_eq!(read_u32_be(&frame, 4), 3);
        assert_eq!(read_u32_be(&frame, 8), CMD_CONTROL);
        let size = read_u32_be(&frame, 12) as usize;
        assert_eq!(HEADER_SIZE + size, frame.len());
        assert_eq!(read_u32_be(&frame, frame.len() - 4), SUFFIX);
        let crc = read_u32_be(&frame, frame.len() - 8);
        assert_eq!(crc, crc32fast::hash(&frame[..frame.len() - 8]));
        // version marker present for the control command
        assert_eq!(&frame[HEADER_SIZE..HEADER_SIZE + 3], b"3.3");
    }

    #[test]
    fn round_trip_v33_control() {
        let cipher = PayloadCipher::new(KEY);
        let frame = encode(CMD_CONTROL, payload_map(json!(true)), Version::V33, &cipher, 1).unwrap();

        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&frame);
        let out = dec.next().unwrap().unwrap();
        assert_eq!(out.seq, 1);
        assert_eq!(out.command, CMD_CONTROL);
        assert_eq!(out.hardware_error(), None);
        let payload = out.payload.unwrap();
        assert_eq!(payload["dps"]["1"], json!(true));
        assert_eq!(payload["t"], json!("1700000000"));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn round_trip_v33_status_probe_has_no_marker() {
        let cipher = PayloadCipher::new(KEY);
        let frame = encode(CMD_STATUS, payload_map(json!(null)), Version::V33, &cipher, 2).unwrap();
        assert_ne!(&frame[HEADER_SIZE..HEADER_SIZE + 3], b"3.3");

        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&frame);
        let out = dec.next().unwrap().unwrap();
        assert_eq!(out.payload.unwrap()["dps"]["1"], json!(null));
    }

    #[test]
    fn round_trip_v31_control_is_signed_base64() {
        let cipher = PayloadCipher::new(KEY);
        let frame = encode(CMD_CONTROL, payload_map(json!(false)), Version::V31, &cipher, 9).unwrap();
        assert_eq!(&frame[HEADER_SIZE..HEADER_SIZE + 3], b"3.1");

        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V31);
        dec.extend(&frame);
        let out = dec.next().unwrap().unwrap();
        assert_eq!(out.payload.unwrap()["dps"]["1"], json!(false));
    }

    #[test]
    fn round_trip_v31_query_is_plaintext() {
        let cipher = PayloadCipher::new(KEY);
        let frame = encode(CMD_STATUS, payload_map(json!(null)), Version::V31, &cipher, 9).unwrap();
        assert_eq!(frame[HEADER_SIZE], b'{');

        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V31);
        dec.extend(&frame);
        let out = dec.next().unwrap().unwrap();
        assert_eq!(out.payload.unwrap()["gwId"], json!("dev1"));
    }

    #[test]
    fn chunked_delivery_yields_frames_in_order() {
        let cipher = PayloadCipher::new(KEY);
        let f1 = encode(CMD_CONTROL, payload_map(json!(true)), Version::V33, &cipher, 1).unwrap();
        let f2 = encode(CMD_CONTROL, payload_map(json!(false)), Version::V33, &cipher, 2).unwrap();
        let mut stream = f1.clone();
        stream.extend_from_slice(&f2);

        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        let mut frames = Vec::new();
        // one byte at a time
        for b in &stream {
            dec.extend(&[*b]);
            while let Some(frame) = dec.next().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].seq, 1);
        assert_eq!(frames[1].seq, 2);

        // same stream all at once
        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&stream);
        assert_eq!(dec.next().unwrap().unwrap().seq, 1);
        assert_eq!(dec.next().unwrap().unwrap().seq, 2);
        assert!(dec.next().unwrap().is_none());
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let cipher = PayloadCipher::new(KEY);
        let frame = encode(CMD_CONTROL, payload_map(json!(true)), Version::V33, &cipher, 1).unwrap();

        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&frame[..frame.len() - 1]);
        assert!(dec.next().unwrap().is_none());
        assert_eq!(dec.buffered(), frame.len() - 1);
        dec.extend(&frame[frame.len() - 1..]);
        assert!(dec.next().unwrap().is_some());
    }

    #[test]
    fn device_error_code_is_reported() {
        // Device-style frame: return code 1, no payload.
        let frame = wrap_frame(5, CMD_CONTROL, &1u32.to_be_bytes());
        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&frame);
        let out = dec.next().unwrap().unwrap();
        assert_eq!(out.hardware_error(), Some(1));
        assert!(out.is_empty());
    }

    #[test]
    fn empty_reply_frame() {
        let frame = wrap_frame(5, CMD_CONTROL, &0u32.to_be_bytes());
        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&frame);
        let out = dec.next().unwrap().unwrap();
        assert!(out.is_empty());
        assert_eq!(out.hardware_error(), None);
    }

    #[test]
    fn bad_prefix_is_corrupt() {
        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&[0u8; 24]);
        assert!(matches!(dec.next(), Err(Error::CorruptMessage(_))));
    }

    #[test]
    fn bad_crc_is_corrupt() {
        let cipher = PayloadCipher::new(KEY);
        let mut frame = encode(CMD_CONTROL, payload_map(json!(true)), Version::V33, &cipher, 1).unwrap();
        let crc_off = frame.len() - 8;
        frame[crc_off] ^= 0xff;
        let mut dec = Decoder::new(PayloadCipher::new(KEY), Version::V33);
        dec.extend(&frame);
        assert!(matches!(dec.next(), Err(Error::CorruptMessage(_))));
    }

    #[test]
    fn garbled_ciphertext_is_corrupt() {
        let cipher = PayloadCipher::new(KEY);
        let frame = encode(CMD_CONTROL, payload_map(json!(true)), Version::V33, &cipher, 1).unwrap();
        // decode under the wrong key
        let mut dec = Decoder::new(PayloadCipher::new(b"ffffffffffffffff"), Version::V33);
        dec.extend(&frame);
        assert!(matches!(dec.next(), Err(Error::CorruptMessage(_))));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let cipher = PayloadCipher::new(KEY);
        let mut map = serde_json::Map::new();
        map.insert("filler".into(), json!("x".repeat(400)));
        map.insert("t".into(), json!("1700000000"));
        let err = encode(CMD_CONTROL, map, Version::V33, &cipher, 1).unwrap_err();
        assert!(matches!(err, Error::EncodingError(_)));
    }

    #[test]
    fn discovery_datagram_with_two_frames() {
        let cipher = PayloadCipher::new(&discovery_key(b"shared secret"));
        let meta1 = json!({"gwId": "dev1", "ip": "10.0.0.7", "version": "3.3", "productKey": "pk1"});
        let meta2 = json!({"gwId": "dev2", "ip": "10.0.0.8", "version": "3.1"});
        let body1 = cipher.encrypt(meta1.to_string().as_bytes());
        let body2 = cipher.encrypt(meta2.to_string().as_bytes());
        let mut datagram = wrap_frame(0, 0x13, &body1);
        datagram.extend_from_slice(&wrap_frame(0, 0x13, &body2));

        let found = parse_discovery(&datagram, &cipher).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].gw_id, "dev1");
        assert_eq!(found[0].ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(found[1].gw_id, "dev2");
        assert_eq!(found[1].version.as_deref(), Some("3.1"));
    }

    #[test]
    fn discovery_truncated_trailing_frame_is_corrupt() {
        let cipher = PayloadCipher::new(&discovery_key(b"shared secret"));
        let body = cipher.encrypt(br#"{"gwId":"dev1"}"#);
        let mut datagram = wrap_frame(0, 0x13, &body);
        datagram.extend_from_slice(&[0x00, 0x00, 0x55]);
        assert!(parse_discovery(&datagram, &cipher).is_err());
    }
}
