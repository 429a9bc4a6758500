// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Thing <-> gateway wire format.
//
// Every message is a 2-byte header {opcode, payload_len} followed by a packed
// payload. Integers are little-endian, fixed-width strings are NUL padded.
// Encoding writes into a caller-supplied buffer (the MTU); decoding never
// panics on malformed input.

use crate::error::CodecError;
use crate::types::{RawValue, Schema, ValueType, ITEM_NAME_LEN, RAW_VALUE_SIZE};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Message header size in bytes.
pub const HEADER_SIZE: usize = 2;

pub const UUID_LEN: usize = 36;
pub const TOKEN_LEN: usize = 40;
pub const DEVICE_NAME_LEN: usize = 64;

/// Highest data item id representable on the wire (0xFF means "none").
pub const ITEM_ID_MAX: u8 = 0xFE;

// Opcodes
pub const MSG_REGISTER_REQ: u8 = 0x10;
pub const MSG_REGISTER_RESP: u8 = 0x11;
pub const MSG_UNREGISTER_REQ: u8 = 0x12;
pub const MSG_UNREGISTER_RESP: u8 = 0x13;
pub const MSG_AUTH_REQ: u8 = 0x14;
pub const MSG_AUTH_RESP: u8 = 0x15;
pub const MSG_PUSH_DATA_REQ: u8 = 0x20;
pub const MSG_PUSH_DATA_RESP: u8 = 0x21;
pub const MSG_PUSH_CONFIG_REQ: u8 = 0x22;
pub const MSG_PUSH_CONFIG_RESP: u8 = 0x23;
pub const MSG_POLL_DATA_REQ: u8 = 0x30;
pub const MSG_POLL_DATA_RESP: u8 = 0x31;
pub const MSG_SCHEMA: u8 = 0x40;
pub const MSG_SCHEMA_RESP: u8 = 0x41;
pub const MSG_SCHEMA_END: u8 = 0x42;
pub const MSG_SCHEMA_END_RESP: u8 = 0x43;

// Result codes
pub const RESULT_SUCCESS: i8 = 0;
pub const RESULT_ERR_INVALID: i8 = -1;
pub const RESULT_ERR_PERM: i8 = -2;
pub const RESULT_ERR_SCHEMA_EMPTY: i8 = -3;
pub const RESULT_ERR_CLOUD_FAILURE: i8 = -4;

// Payload sizes
const REGISTER_LEN: usize = 8 + DEVICE_NAME_LEN;
const CREDENTIAL_LEN: usize = 1 + UUID_LEN + TOKEN_LEN;
const AUTH_LEN: usize = UUID_LEN + TOKEN_LEN;
const SCHEMA_LEN: usize = 1 + 1 + 1 + 2 + ITEM_NAME_LEN;
const CONFIG_LEN: usize = 1 + 1 + 2 + 2 * RAW_VALUE_SIZE;

/// Largest message this protocol produces (credential: header + 77).
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + CREDENTIAL_LEN;

pub type Uuid = heapless::String<UUID_LEN>;
pub type Token = heapless::String<TOKEN_LEN>;
pub type DeviceName = heapless::String<DEVICE_NAME_LEN>;

// ---------------------------------------------------------------------------
// Opcode enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    RegisterReq = MSG_REGISTER_REQ,
    RegisterResp = MSG_REGISTER_RESP,
    UnregisterReq = MSG_UNREGISTER_REQ,
    UnregisterResp = MSG_UNREGISTER_RESP,
    AuthReq = MSG_AUTH_REQ,
    AuthResp = MSG_AUTH_RESP,
    PushDataReq = MSG_PUSH_DATA_REQ,
    PushDataResp = MSG_PUSH_DATA_RESP,
    PushConfigReq = MSG_PUSH_CONFIG_REQ,
    PushConfigResp = MSG_PUSH_CONFIG_RESP,
    PollDataReq = MSG_POLL_DATA_REQ,
    PollDataResp = MSG_POLL_DATA_RESP,
    Schema = MSG_SCHEMA,
    SchemaResp = MSG_SCHEMA_RESP,
    SchemaEnd = MSG_SCHEMA_END,
    SchemaEndResp = MSG_SCHEMA_END_RESP,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            MSG_REGISTER_REQ => Ok(Self::RegisterReq),
            MSG_REGISTER_RESP => Ok(Self::RegisterResp),
            MSG_UNREGISTER_REQ => Ok(Self::UnregisterReq),
            MSG_UNREGISTER_RESP => Ok(Self::UnregisterResp),
            MSG_AUTH_REQ => Ok(Self::AuthReq),
            MSG_AUTH_RESP => Ok(Self::AuthResp),
            MSG_PUSH_DATA_REQ => Ok(Self::PushDataReq),
            MSG_PUSH_DATA_RESP => Ok(Self::PushDataResp),
            MSG_PUSH_CONFIG_REQ => Ok(Self::PushConfigReq),
            MSG_PUSH_CONFIG_RESP => Ok(Self::PushConfigResp),
            MSG_POLL_DATA_REQ => Ok(Self::PollDataReq),
            MSG_POLL_DATA_RESP => Ok(Self::PollDataResp),
            MSG_SCHEMA => Ok(Self::Schema),
            MSG_SCHEMA_RESP => Ok(Self::SchemaResp),
            MSG_SCHEMA_END => Ok(Self::SchemaEnd),
            MSG_SCHEMA_END_RESP => Ok(Self::SchemaEndResp),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Responses have odd opcodes.
    pub fn is_response(self) -> bool {
        self.as_u8() & 0x01 == 0x01
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Event configuration as carried by PUSH_CONFIG_REQ.
///
/// Limits are the 16-byte value union; how they are read depends on the
/// item's value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireConfig {
    pub event_flags: u8,
    pub time_sec: u16,
    pub lower_limit: [u8; RAW_VALUE_SIZE],
    pub upper_limit: [u8; RAW_VALUE_SIZE],
}

/// A decoded (or to-be-encoded) protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Bare result code; any response opcode with a one-byte payload.
    Result { opcode: Opcode, result: i8 },
    /// REGISTER_REQ
    Register { device_id: u64, name: DeviceName },
    /// REGISTER_RESP with credentials
    Credential { result: i8, uuid: Uuid, token: Token },
    /// UNREGISTER_REQ
    Unregister,
    /// AUTH_REQ
    Auth { uuid: Uuid, token: Token },
    /// SCHEMA or SCHEMA_END (`last`)
    Schema { item_id: u8, schema: Schema, last: bool },
    /// PUSH_DATA_REQ or PUSH_DATA_RESP (`response`); 1..=16 value bytes
    Data {
        item_id: u8,
        value: RawValue,
        response: bool,
    },
    /// POLL_DATA_REQ
    Poll { item_id: u8 },
    /// PUSH_CONFIG_REQ
    Config { item_id: u8, config: WireConfig },
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Result { opcode, .. } => *opcode,
            Self::Register { .. } => Opcode::RegisterReq,
            Self::Credential { .. } => Opcode::RegisterResp,
            Self::Unregister => Opcode::UnregisterReq,
            Self::Auth { .. } => Opcode::AuthReq,
            Self::Schema { last: false, .. } => Opcode::Schema,
            Self::Schema { last: true, .. } => Opcode::SchemaEnd,
            Self::Data {
                response: false, ..
            } => Opcode::PushDataReq,
            Self::Data { response: true, .. } => Opcode::PushDataResp,
            Self::Poll { .. } => Opcode::PollDataReq,
            Self::Config { .. } => Opcode::PushConfigReq,
        }
    }

    /// Result code carried by the message, if it has one.
    pub fn result(&self) -> Option<i8> {
        match self {
            Self::Result { result, .. } | Self::Credential { result, .. } => Some(*result),
            _ => None,
        }
    }

    /// Encode into `buf`. Returns header + payload size.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut w = Writer::new(buf);
        w.put_u8(self.opcode().as_u8())?;
        w.put_u8(0)?; // payload_len, patched below

        match self {
            Self::Result { result, .. } => w.put_u8(*result as u8)?,
            Self::Register { device_id, name } => {
                w.put_bytes(&device_id.to_le_bytes())?;
                w.put_str(name, DEVICE_NAME_LEN)?;
            }
            Self::Credential {
                result,
                uuid,
                token,
            } => {
                w.put_u8(*result as u8)?;
                w.put_str(uuid, UUID_LEN)?;
                w.put_str(token, TOKEN_LEN)?;
            }
            Self::Unregister => {}
            Self::Auth { uuid, token } => {
                w.put_str(uuid, UUID_LEN)?;
                w.put_str(token, TOKEN_LEN)?;
            }
            Self::Schema {
                item_id, schema, ..
            } => {
                w.put_u8(*item_id)?;
                w.put_u8(schema.value_type.as_u8())?;
                w.put_u8(schema.unit)?;
                w.put_bytes(&schema.type_id.to_le_bytes())?;
                w.put_str(&schema.name, ITEM_NAME_LEN)?;
            }
            Self::Data { item_id, value, .. } => {
                if value.is_empty() {
                    return Err(CodecError::InvalidValue);
                }
                w.put_u8(*item_id)?;
                w.put_bytes(value)?;
            }
            Self::Poll { item_id } => w.put_u8(*item_id)?,
            Self::Config { item_id, config } => {
                w.put_u8(*item_id)?;
                w.put_u8(config.event_flags)?;
                w.put_bytes(&config.time_sec.to_le_bytes())?;
                w.put_bytes(&config.lower_limit)?;
                w.put_bytes(&config.upper_limit)?;
            }
        }

        let total = w.pos;
        // Largest payload is 77 bytes, always fits the u8 length field.
        w.buf[1] = (total - HEADER_SIZE) as u8;
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(CodecError::BufferTooSmall);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.put_bytes(&[value])
    }

    /// Fixed-width, NUL padded string field.
    fn put_str(&mut self, value: &str, width: usize) -> Result<(), CodecError> {
        let bytes = value.as_bytes();
        let n = bytes.len().min(width);
        self.put_bytes(&bytes[..n])?;
        for _ in n..width {
            self.put_u8(0)?;
        }
        Ok(())
    }
}

/// REGISTER_REQ with the device id and name (truncated to 64 bytes).
pub fn encode_register(buf: &mut [u8], device_id: u64, name: &str) -> Result<usize, CodecError> {
    Message::Register {
        device_id,
        name: crate::types::truncate_str(name),
    }
    .encode(buf)
}

/// AUTH_REQ with stored credentials.
pub fn encode_auth(buf: &mut [u8], uuid: &Uuid, token: &Token) -> Result<usize, CodecError> {
    Message::Auth {
        uuid: uuid.clone(),
        token: token.clone(),
    }
    .encode(buf)
}

/// SCHEMA fragment, or SCHEMA_END for the last item.
pub fn encode_schema(
    buf: &mut [u8],
    item_id: u8,
    schema: &Schema,
    is_last: bool,
) -> Result<usize, CodecError> {
    Message::Schema {
        item_id,
        schema: schema.clone(),
        last: is_last,
    }
    .encode(buf)
}

/// PUSH_DATA_REQ (or PUSH_DATA_RESP when `is_response`). The value carries
/// its own length: natural size for fixed types, content length for raw.
pub fn encode_data(
    buf: &mut [u8],
    item_id: u8,
    value: &crate::types::Value,
    is_response: bool,
) -> Result<usize, CodecError> {
    Message::Data {
        item_id,
        value: value.to_wire(),
        response: is_response,
    }
    .encode(buf)
}

/// Bare result reply for `opcode`.
pub fn encode_error(buf: &mut [u8], opcode: Opcode, result: i8) -> Result<usize, CodecError> {
    Message::Result { opcode, result }.encode(buf)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Size of the first complete message in `buf`, if one is there.
///
/// Used to split a byte stream (TCP, serial) into messages.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let len = HEADER_SIZE + buf[1] as usize;
    (buf.len() >= len).then_some(len)
}

fn read_str<const N: usize>(bytes: &[u8]) -> Result<heapless::String<N>, CodecError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let s = core::str::from_utf8(&bytes[..end]).map_err(|_| CodecError::InvalidString)?;
    let mut out = heapless::String::new();
    out.push_str(s).map_err(|_| CodecError::InvalidString)?;
    Ok(out)
}

fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Decode one message from the start of `buf`.
///
/// Bytes past the declared payload length are ignored.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Err(CodecError::BufferTooShort);
    }
    let raw_opcode = buf[0];
    let len = buf[1] as usize;
    if buf.len() < HEADER_SIZE + len {
        return Err(CodecError::BufferTooShort);
    }
    let opcode = Opcode::from_u8(raw_opcode)?;
    let p = &buf[HEADER_SIZE..HEADER_SIZE + len];

    if opcode.is_response() && len == 1 {
        return Ok(Message::Result {
            opcode,
            result: p[0] as i8,
        });
    }

    let exact = |want: usize| {
        if len == want {
            Ok(())
        } else {
            Err(CodecError::PayloadLengthMismatch {
                opcode: raw_opcode,
                len,
            })
        }
    };

    let msg = match opcode {
        Opcode::RegisterReq => {
            exact(REGISTER_LEN)?;
            let mut id = [0u8; 8];
            id.copy_from_slice(&p[..8]);
            Message::Register {
                device_id: u64::from_le_bytes(id),
                name: read_str(&p[8..])?,
            }
        }
        Opcode::RegisterResp => {
            exact(CREDENTIAL_LEN)?;
            Message::Credential {
                result: p[0] as i8,
                uuid: read_str(&p[1..1 + UUID_LEN])?,
                token: read_str(&p[1 + UUID_LEN..])?,
            }
        }
        Opcode::UnregisterReq => {
            exact(0)?;
            Message::Unregister
        }
        Opcode::AuthReq => {
            exact(AUTH_LEN)?;
            Message::Auth {
                uuid: read_str(&p[..UUID_LEN])?,
                token: read_str(&p[UUID_LEN..])?,
            }
        }
        Opcode::Schema | Opcode::SchemaEnd => {
            exact(SCHEMA_LEN)?;
            Message::Schema {
                item_id: p[0],
                schema: Schema {
                    value_type: ValueType::from_u8(p[1])?,
                    unit: p[2],
                    type_id: read_u16_le(&p[3..5]),
                    name: read_str(&p[5..])?,
                },
                last: opcode == Opcode::SchemaEnd,
            }
        }
        Opcode::PushDataReq | Opcode::PushDataResp => {
            if !(2..=1 + RAW_VALUE_SIZE).contains(&len) {
                return Err(CodecError::PayloadLengthMismatch {
                    opcode: raw_opcode,
                    len,
                });
            }
            Message::Data {
                item_id: p[0],
                value: RawValue::from_slice(&p[1..]).map_err(|_| CodecError::InvalidValue)?,
                response: opcode == Opcode::PushDataResp,
            }
        }
        Opcode::PollDataReq => {
            exact(1)?;
            Message::Poll { item_id: p[0] }
        }
        Opcode::PushConfigReq => {
            exact(CONFIG_LEN)?;
            let mut lower_limit = [0u8; RAW_VALUE_SIZE];
            let mut upper_limit = [0u8; RAW_VALUE_SIZE];
            lower_limit.copy_from_slice(&p[4..4 + RAW_VALUE_SIZE]);
            upper_limit.copy_from_slice(&p[4 + RAW_VALUE_SIZE..]);
            Message::Config {
                item_id: p[0],
                config: WireConfig {
                    event_flags: p[1],
                    time_sec: read_u16_le(&p[2..4]),
                    lower_limit,
                    upper_limit,
                },
            }
        }
        // Responses without a one-byte result
        Opcode::UnregisterResp
        | Opcode::AuthResp
        | Opcode::PushConfigResp
        | Opcode::PollDataResp
        | Opcode::SchemaResp
        | Opcode::SchemaEndResp => {
            return Err(CodecError::PayloadLengthMismatch {
                opcode: raw_opcode,
                len,
            })
        }
    };
    Ok(msg)
}
