//! Wire records and framing for the simulation <-> evaluation link

use std::io::{Cursor, Read};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use rail_model::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 5000;

pub const MAGIC: [u8; 2] = *b"RT";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 6;

const KIND_SAMPLE: u8 = 1;
const KIND_END: u8 = 2;
const KIND_SCORE: u8 = 3;
const KIND_HEARTBEAT: u8 = 4;

const SAMPLE_LEN: usize = 16 + 8 + 8 + 8 + 8 + 8 + 1 + 1;
const END_LEN: usize = 16 + 8 + 8 + 8;
const SCORE_LEN: usize = 8 + 8 + 1 + 1;
const HEARTBEAT_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub session_id: Uuid,
    pub tick: u64,
    /// Simulated time in milliseconds.
    pub timestamp_ms: u64,
    pub position_m: f64,
    pub velocity_mps: f64,
    pub acceleration_mps2: f64,
    pub mode: ControlMode,
    pub level: u8,
}

impl SampleRecord {
    pub fn from_sample(session_id: Uuid, sample: &TelemetrySample) -> Self {
        let s = &sample.state;
        Self {
            session_id,
            tick: sample.tick,
            timestamp_ms: seconds_to_ms(s.time_s),
            position_m: s.position_m,
            velocity_mps: s.velocity_mps,
            acceleration_mps2: s.acceleration_mps2,
            mode: s.mode,
            level: s.level,
        }
    }

    /// Wall time is not carried over the wire.
    pub fn to_sample(&self) -> TelemetrySample {
        TelemetrySample {
            tick: self.tick,
            state: VehicleState {
                time_s: self.timestamp_ms as f64 / 1000.0,
                position_m: self.position_m,
                velocity_mps: self.velocity_mps,
                acceleration_mps2: self.acceleration_mps2,
                mode: self.mode,
                level: self.level,
            },
            wall_elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndOfSession {
    pub session_id: Uuid,
    pub tick: u64,
    pub timestamp_ms: u64,
    pub position_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreReply {
    pub tick: u64,
    pub overshoot_pct: f64,
    pub comfort: ComfortClass,
    /// Set once any ceiling violation has been scored in this session.
    pub cumulative_flag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Sample(SampleRecord),
    End(EndOfSession),
    Score(ScoreReply),
    Heartbeat(Heartbeat),
}

impl Frame {
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Sample(_) => KIND_SAMPLE,
            Frame::End(_) => KIND_END,
            Frame::Score(_) => KIND_SCORE,
            Frame::Heartbeat(_) => KIND_HEARTBEAT,
        }
    }
}

pub fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round().max(0.0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Up,
    Down,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Up => f.write_str("up"),
            LinkStatus::Down => f.write_str("down"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("bad frame magic, skipped {skipped} bytes")]
    BadMagic { skipped: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("frame kind {kind} carries {len} payload bytes, expected {expected}")]
    BadLength { kind: u8, len: usize, expected: usize },
    #[error("invalid value in field `{0}`")]
    InvalidField(&'static str),
    #[error("truncated payload")]
    Truncated,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("peer closed the connection")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Encoding

pub fn encode(frame: &Frame, out: &mut BytesMut) {
    let len = match frame {
        Frame::Sample(_) => SAMPLE_LEN,
        Frame::End(_) => END_LEN,
        Frame::Score(_) => SCORE_LEN,
        Frame::Heartbeat(_) => HEARTBEAT_LEN,
    };
    out.reserve(HEADER_LEN + len);
    out.put_slice(&MAGIC);
    out.put_u8(VERSION);
    out.put_u8(frame.kind());
    out.put_u16_le(len as u16);

    match frame {
        Frame::Sample(s) => {
            out.put_slice(s.session_id.as_bytes());
            out.put_u64_le(s.tick);
            out.put_u64_le(s.timestamp_ms);
            out.put_f64_le(s.position_m);
            out.put_f64_le(s.velocity_mps);
            out.put_f64_le(s.acceleration_mps2);
            out.put_u8(s.mode.code());
            out.put_u8(s.level);
        }
        Frame::End(e) => {
            out.put_slice(e.session_id.as_bytes());
            out.put_u64_le(e.tick);
            out.put_u64_le(e.timestamp_ms);
            out.put_f64_le(e.position_m);
        }
        Frame::Score(r) => {
            out.put_u64_le(r.tick);
            out.put_f64_le(r.overshoot_pct);
            out.put_u8(r.comfort.code());
            out.put_u8(r.cumulative_flag as u8);
        }
        Frame::Heartbeat(h) => {
            out.put_u64_le(h.seq);
        }
    }
}

pub fn encode_to_vec(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode(frame, &mut buf);
    buf.to_vec()
}

// ---------------------------------------------------------------------------
// Decoding

/// Incremental decoder over a byte stream. Malformed frames are reported and
/// skipped; the stream itself stays usable.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// `None` until a complete frame (or a run of garbage) is buffered.
    pub fn decode_next(&mut self) -> Option<Result<Frame, ProtocolError>> {
        if self.buf.len() < MAGIC.len() {
            return None;
        }
        if self.buf[..2] != MAGIC {
            let skipped = self.resync_offset();
            self.buf.advance(skipped);
            return Some(Err(ProtocolError::BadMagic { skipped }));
        }
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let version = self.buf[2];
        let kind = self.buf[3];
        let len = u16::from_le_bytes([self.buf[4], self.buf[5]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        let frame = self.buf.split_to(HEADER_LEN + len);
        if version != VERSION {
            return Some(Err(ProtocolError::UnsupportedVersion(version)));
        }
        Some(decode_payload(kind, &frame[HEADER_LEN..]))
    }

    // Bytes to drop so the buffer starts at the next candidate magic. A trailing
    // first magic byte is kept since its partner may still be in flight.
    fn resync_offset(&self) -> usize {
        let found = self.buf[1..].windows(2).position(|w| w == MAGIC);
        match found {
            Some(i) => i + 1,
            None if self.buf.last() == Some(&MAGIC[0]) => self.buf.len() - 1,
            None => self.buf.len(),
        }
    }
}

fn field<T>(r: std::io::Result<T>) -> Result<T, ProtocolError> {
    r.map_err(|_| ProtocolError::Truncated)
}

fn finite(value: f64, name: &'static str) -> Result<f64, ProtocolError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ProtocolError::InvalidField(name))
    }
}

fn read_uuid(c: &mut Cursor<&[u8]>) -> Result<Uuid, ProtocolError> {
    let mut id = [0u8; 16];
    field(c.read_exact(&mut id))?;
    Ok(Uuid::from_bytes(id))
}

fn expect_len(kind: u8, payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() != expected {
        return Err(ProtocolError::BadLength { kind, len: payload.len(), expected });
    }
    Ok(())
}

fn decode_payload(kind: u8, payload: &[u8]) -> Result<Frame, ProtocolError> {
    let mut c = Cursor::new(payload);
    match kind {
        KIND_SAMPLE => {
            expect_len(kind, payload, SAMPLE_LEN)?;
            let session_id = read_uuid(&mut c)?;
            let tick = field(c.read_u64::<LittleEndian>())?;
            let timestamp_ms = field(c.read_u64::<LittleEndian>())?;
            let position_m = finite(field(c.read_f64::<LittleEndian>())?, "position_m")?;
            let velocity_mps = finite(field(c.read_f64::<LittleEndian>())?, "velocity_mps")?;
            if velocity_mps < 0.0 {
                return Err(ProtocolError::InvalidField("velocity_mps"));
            }
            let acceleration_mps2 = finite(field(c.read_f64::<LittleEndian>())?, "acceleration_mps2")?;
            let mode = ControlMode::from_code(field(c.read_u8())?).ok_or(ProtocolError::InvalidField("mode"))?;
            let level = field(c.read_u8())?;
            Ok(Frame::Sample(SampleRecord {
                session_id,
                tick,
                timestamp_ms,
                position_m,
                velocity_mps,
                acceleration_mps2,
                mode,
                level,
            }))
        }
        KIND_END => {
            expect_len(kind, payload, END_LEN)?;
            let session_id = read_uuid(&mut c)?;
            let tick = field(c.read_u64::<LittleEndian>())?;
            let timestamp_ms = field(c.read_u64::<LittleEndian>())?;
            let position_m = finite(field(c.read_f64::<LittleEndian>())?, "position_m")?;
            Ok(Frame::End(EndOfSession { session_id, tick, timestamp_ms, position_m }))
        }
        KIND_SCORE => {
            expect_len(kind, payload, SCORE_LEN)?;
            let tick = field(c.read_u64::<LittleEndian>())?;
            let overshoot_pct = finite(field(c.read_f64::<LittleEndian>())?, "overshoot_pct")?;
            let comfort = ComfortClass::from_code(field(c.read_u8())?).ok_or(ProtocolError::InvalidField("comfort"))?;
            let cumulative_flag = match field(c.read_u8())? {
                0 => false,
                1 => true,
                _ => return Err(ProtocolError::InvalidField("cumulative_flag")),
            };
            Ok(Frame::Score(ScoreReply { tick, overshoot_pct, comfort, cumulative_flag }))
        }
        KIND_HEARTBEAT => {
            expect_len(kind, payload, HEARTBEAT_LEN)?;
            let seq = field(c.read_u64::<LittleEndian>())?;
            Ok(Frame::Heartbeat(Heartbeat { seq }))
        }
        other => Err(ProtocolError::UnknownKind(other)),
    }
}
