//! Wire protocol encoder and decoder
//!
//! Stateless codec between `Message` values and byte frames. Every integer
//! is network byte order; strings and blobs carry a u32 length prefix and
//! are never null-terminated, so embedded NULs and non-ASCII data survive
//! independently-built peers.
//!
//! Frame layout: u32 discriminator, then a type-specific payload. Typed
//! values are a one-byte tag (1=int, 2=double, 3=string, 4=blob) followed by
//! the payload; lists are a u32 count followed by the elements.

use crate::binding::{MetricValue, TunableType, TunableValue};
use crate::utils::error::ProtocolError;

const TAG_SETUP: u32 = 1;
const TAG_REGISTER_VAR: u32 = 2;
const TAG_SET_VAR: u32 = 3;
const TAG_SET_ALL: u32 = 4;
const TAG_REQUEST_ALL: u32 = 5;
const TAG_PERF_UPDATE: u32 = 6;
const TAG_CONVERGED_QUERY: u32 = 7;
const TAG_BEST_CONFIG_QUERY: u32 = 8;
const TAG_END: u32 = 9;
const TAG_ACK: u32 = 10;
const TAG_NACK: u32 = 11;
const TAG_VALUE_PUSH: u32 = 12;
const TAG_CFG_QUERY: u32 = 13;
const TAG_CFG_VALUE: u32 = 14;

/// Upper bound on any length prefix; a larger value means a corrupt stream,
/// not a frame we should wait for.
const MAX_FIELD_LEN: u32 = 1 << 26;
const MAX_LIST_LEN: u32 = 1 << 20;

/// One protocol message
///
/// Immutable once encoded; a session emits and consumes a strictly ordered
/// sequence of these on its socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake: opaque application description (or description file
    /// contents), answered by Ack carrying the assigned client id.
    Setup { description: Vec<u8> },
    /// Declare one tunable variable, answered by Ack or Nack.
    RegisterVar {
        bundle: String,
        name: String,
        vtype: TunableType,
    },
    /// One-way push of a single variable's current value.
    SetVar { name: String, value: TunableValue },
    /// One-way batched push of variable values, registration order.
    SetAll { values: Vec<(String, TunableValue)> },
    /// Ask the server for a fresh assignment of every variable.
    RequestAll,
    /// One-way performance report.
    PerfUpdate { metric: MetricValue },
    /// Has the search converged? Answered by Ack{0|1}.
    ConvergedQuery,
    /// Snapshot of the best known configuration, answered by ValuePush.
    BestConfigQuery,
    /// Best-effort close notice.
    End,
    /// Positive reply; the code's meaning is positional (client id after
    /// Setup, boolean for ConvergedQuery, ignored otherwise).
    Ack { code: u32 },
    /// Negative reply with the server-provided reason.
    Nack { reason: String },
    /// Server-chosen values, as a reply to RequestAll/BestConfigQuery or
    /// unsolicited in signal mode.
    ValuePush { values: Vec<(String, TunableValue)> },
    /// Look up a server-side configuration string.
    CfgQuery { key: String },
    /// Reply to CfgQuery; None when the key is not set.
    CfgValue { value: Option<String> },
}

impl Message {
    /// Encode to a self-contained frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = WireEncoder::with_capacity(64);
        enc.encode(self);
        enc.into_bytes()
    }

    /// Strict decode of exactly one frame. Truncated input and trailing
    /// bytes both fail with `MalformedMessage`; they never mis-decode.
    pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
        match Self::decode_frame(buf)? {
            Some((msg, consumed)) if consumed == buf.len() => Ok(msg),
            Some((_, consumed)) => Err(ProtocolError::MalformedMessage(format!(
                "{} trailing bytes after frame",
                buf.len() - consumed
            ))),
            None => Err(ProtocolError::MalformedMessage(
                "truncated frame".to_string(),
            )),
        }
    }

    /// Streaming decode: `Ok(None)` means the buffer holds an incomplete
    /// frame and nothing was consumed; `Ok(Some((msg, n)))` means the first
    /// `n` bytes decoded to `msg`.
    pub fn decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtocolError> {
        let mut r = FrameReader::new(buf);
        match Self::read_from(&mut r) {
            Ok(msg) => Ok(Some((msg, r.pos))),
            Err(FrameError::NeedMore) => Ok(None),
            Err(FrameError::Invalid(e)) => Err(e),
        }
    }

    fn read_from(r: &mut FrameReader<'_>) -> Result<Message, FrameError> {
        let tag = r.read_u32()?;
        let msg = match tag {
            TAG_SETUP => Message::Setup {
                description: r.read_bytes()?,
            },
            TAG_REGISTER_VAR => Message::RegisterVar {
                bundle: r.read_string()?,
                name: r.read_string()?,
                vtype: r.read_type_tag()?,
            },
            TAG_SET_VAR => Message::SetVar {
                name: r.read_string()?,
                value: r.read_value()?,
            },
            TAG_SET_ALL => Message::SetAll {
                values: r.read_value_list()?,
            },
            TAG_REQUEST_ALL => Message::RequestAll,
            TAG_PERF_UPDATE => Message::PerfUpdate {
                metric: r.read_metric()?,
            },
            TAG_CONVERGED_QUERY => Message::ConvergedQuery,
            TAG_BEST_CONFIG_QUERY => Message::BestConfigQuery,
            TAG_END => Message::End,
            TAG_ACK => Message::Ack {
                code: r.read_u32()?,
            },
            TAG_NACK => Message::Nack {
                reason: r.read_string()?,
            },
            TAG_VALUE_PUSH => Message::ValuePush {
                values: r.read_value_list()?,
            },
            TAG_CFG_QUERY => Message::CfgQuery {
                key: r.read_string()?,
            },
            TAG_CFG_VALUE => Message::CfgValue {
                value: match r.read_u8()? {
                    0 => None,
                    1 => Some(r.read_string()?),
                    b => {
                        return Err(FrameError::Invalid(ProtocolError::MalformedMessage(
                            format!("invalid option tag: {}", b),
                        )))
                    }
                },
            },
            other => return Err(FrameError::Invalid(ProtocolError::UnknownMessageType(other))),
        };
        Ok(msg)
    }

    /// Short name for logs and UnexpectedResponse reports
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Setup { .. } => "SETUP",
            Message::RegisterVar { .. } => "REGISTER_VAR",
            Message::SetVar { .. } => "SET_VAR",
            Message::SetAll { .. } => "SET_ALL",
            Message::RequestAll => "REQUEST_ALL",
            Message::PerfUpdate { .. } => "PERF_UPDATE",
            Message::ConvergedQuery => "CONVERGED_QUERY",
            Message::BestConfigQuery => "BEST_CONFIG_QUERY",
            Message::End => "END",
            Message::Ack { .. } => "ACK",
            Message::Nack { .. } => "NACK",
            Message::ValuePush { .. } => "VALUE_PUSH",
            Message::CfgQuery { .. } => "CFG_QUERY",
            Message::CfgValue { .. } => "CFG_VALUE",
        }
    }
}

/// Encoder with a reusable owned buffer
pub struct WireEncoder {
    buf: Vec<u8>,
}

impl WireEncoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn encode(&mut self, msg: &Message) {
        match msg {
            Message::Setup { description } => {
                self.put_u32(TAG_SETUP);
                self.put_bytes(description);
            }
            Message::RegisterVar {
                bundle,
                name,
                vtype,
            } => {
                self.put_u32(TAG_REGISTER_VAR);
                self.put_str(bundle);
                self.put_str(name);
                self.buf.push(vtype.wire_tag());
            }
            Message::SetVar { name, value } => {
                self.put_u32(TAG_SET_VAR);
                self.put_str(name);
                self.put_value(value);
            }
            Message::SetAll { values } => {
                self.put_u32(TAG_SET_ALL);
                self.put_value_list(values);
            }
            Message::RequestAll => self.put_u32(TAG_REQUEST_ALL),
            Message::PerfUpdate { metric } => {
                self.put_u32(TAG_PERF_UPDATE);
                match metric {
                    MetricValue::Int(v) => {
                        self.buf.push(1);
                        self.buf.extend_from_slice(&v.to_be_bytes());
                    }
                    MetricValue::Double(v) => {
                        self.buf.push(2);
                        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
                    }
                }
            }
            Message::ConvergedQuery => self.put_u32(TAG_CONVERGED_QUERY),
            Message::BestConfigQuery => self.put_u32(TAG_BEST_CONFIG_QUERY),
            Message::End => self.put_u32(TAG_END),
            Message::Ack { code } => {
                self.put_u32(TAG_ACK);
                self.put_u32(*code);
            }
            Message::Nack { reason } => {
                self.put_u32(TAG_NACK);
                self.put_str(reason);
            }
            Message::ValuePush { values } => {
                self.put_u32(TAG_VALUE_PUSH);
                self.put_value_list(values);
            }
            Message::CfgQuery { key } => {
                self.put_u32(TAG_CFG_QUERY);
                self.put_str(key);
            }
            Message::CfgValue { value } => {
                self.put_u32(TAG_CFG_VALUE);
                match value {
                    None => self.buf.push(0),
                    Some(s) => {
                        self.buf.push(1);
                        self.put_str(s);
                    }
                }
            }
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    fn put_value(&mut self, v: &TunableValue) {
        self.buf.push(v.tunable_type().wire_tag());
        match v {
            TunableValue::Int(i) => self.buf.extend_from_slice(&i.to_be_bytes()),
            TunableValue::Double(d) => self.buf.extend_from_slice(&d.to_bits().to_be_bytes()),
            TunableValue::Str(s) => self.put_str(s),
            TunableValue::Blob(b) => self.put_bytes(b),
        }
    }

    fn put_value_list(&mut self, values: &[(String, TunableValue)]) {
        self.put_u32(values.len() as u32);
        for (name, value) in values {
            self.put_str(name);
            self.put_value(value);
        }
    }
}

enum FrameError {
    /// The buffer ends mid-frame; read more and retry.
    NeedMore,
    Invalid(ProtocolError),
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.buf.len() - self.pos < n {
            return Err(FrameError::NeedMore);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, FrameError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    fn read_f64(&mut self) -> Result<f64, FrameError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.read_u32()?;
        if len > MAX_FIELD_LEN {
            return Err(FrameError::Invalid(ProtocolError::MalformedMessage(
                format!("field length {} exceeds limit", len),
            )));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String, FrameError> {
        String::from_utf8(self.read_bytes()?).map_err(|_| {
            FrameError::Invalid(ProtocolError::MalformedMessage(
                "invalid UTF-8 in string field".to_string(),
            ))
        })
    }

    fn read_type_tag(&mut self) -> Result<TunableType, FrameError> {
        let tag = self.read_u8()?;
        TunableType::from_wire_tag(tag).ok_or_else(|| {
            FrameError::Invalid(ProtocolError::MalformedMessage(format!(
                "invalid value type tag: {}",
                tag
            )))
        })
    }

    fn read_value(&mut self) -> Result<TunableValue, FrameError> {
        let ty = self.read_type_tag()?;
        Ok(match ty {
            TunableType::Int => TunableValue::Int(self.read_i64()?),
            TunableType::Double => TunableValue::Double(self.read_f64()?),
            TunableType::Str => TunableValue::Str(self.read_string()?),
            TunableType::Blob => TunableValue::Blob(self.read_bytes()?),
        })
    }

    fn read_value_list(&mut self) -> Result<Vec<(String, TunableValue)>, FrameError> {
        let count = self.read_u32()?;
        if count > MAX_LIST_LEN {
            return Err(FrameError::Invalid(ProtocolError::MalformedMessage(
                format!("list length {} exceeds limit", count),
            )));
        }
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = self.read_string()?;
            let value = self.read_value()?;
            values.push((name, value));
        }
        Ok(values)
    }

    fn read_metric(&mut self) -> Result<MetricValue, FrameError> {
        match self.read_u8()? {
            1 => Ok(MetricValue::Int(self.read_i64()?)),
            2 => Ok(MetricValue::Double(self.read_f64()?)),
            tag => Err(FrameError::Invalid(ProtocolError::MalformedMessage(
                format!("invalid metric tag: {}", tag),
            ))),
        }
    }
}
