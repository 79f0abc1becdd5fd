//! Streaming MessagePack writer used to encode the agent wire format.
//!
//! Built on the `rmp` crate's low-level `encode` functions, with
//! smallest-fitting-form integer encoding and a 4 GiB buffer cap matching
//! the Datadog agent's own v0.4 span encoder.

use crate::error::Error;
use rmp::decode;
use rmp::decode::RmpRead;
use rmp::encode;
use std::collections::BTreeMap;

/// Values the supported grammar can represent, used for round-trip testing
/// and as a generic decode target.
///
/// `decode(encode(v)) == v` holds for every variant except `Int` with a
/// non-negative payload: `write_int` emits the unsigned wire form for those
/// (matching the agent's own smallest-fitting-form encoding), so decoding
/// back yields `UInt`, not `Int`. Construct non-negative integers as `UInt`
/// when round-tripping.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Caps a single encoded payload at 4 GiB, per the wire-format contract.
const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024 * 1024;

/// A streaming MessagePack writer over an in-memory buffer.
///
/// Every write checks the resulting buffer length against
/// [`MAX_PAYLOAD_LEN`] and fails with [`Error::BufferOverflow`] rather than
/// growing past it.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn check_len(&self) -> Result<(), Error> {
        if self.buf.len() > MAX_PAYLOAD_LEN {
            Err(Error::BufferOverflow)
        } else {
            Ok(())
        }
    }

    pub fn write_nil(&mut self) -> Result<(), Error> {
        encode::write_nil(&mut self.buf).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    pub fn write_bool(&mut self, v: bool) -> Result<(), Error> {
        encode::write_bool(&mut self.buf, v).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    /// Writes the smallest-fitting form: unsigned if non-negative, signed
    /// otherwise.
    pub fn write_int(&mut self, v: i64) -> Result<(), Error> {
        if v >= 0 {
            encode::write_uint(&mut self.buf, v as u64).map_err(|_| Error::BufferOverflow)?;
        } else {
            encode::write_sint(&mut self.buf, v).map_err(|_| Error::BufferOverflow)?;
        }
        self.check_len()
    }

    pub fn write_uint(&mut self, v: u64) -> Result<(), Error> {
        encode::write_uint(&mut self.buf, v).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    pub fn write_f64(&mut self, v: f64) -> Result<(), Error> {
        encode::write_f64(&mut self.buf, v).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    pub fn write_str(&mut self, v: &str) -> Result<(), Error> {
        encode::write_str(&mut self.buf, v).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    pub fn write_bin(&mut self, v: &[u8]) -> Result<(), Error> {
        encode::write_bin(&mut self.buf, v).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    pub fn write_array_len(&mut self, len: u32) -> Result<(), Error> {
        encode::write_array_len(&mut self.buf, len).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    pub fn write_map_len(&mut self, len: u32) -> Result<(), Error> {
        encode::write_map_len(&mut self.buf, len).map_err(|_| Error::BufferOverflow)?;
        self.check_len()
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Nil => self.write_nil(),
            Value::Bool(b) => self.write_bool(*b),
            Value::Int(i) => self.write_int(*i),
            Value::UInt(u) => self.write_uint(*u),
            Value::Float(f) => self.write_f64(*f),
            Value::String(s) => self.write_str(s),
            Value::Binary(b) => self.write_bin(b),
            Value::Array(items) => {
                self.write_array_len(items.len() as u32)?;
                for item in items {
                    self.write_value(item)?;
                }
                Ok(())
            }
            Value::Map(entries) => {
                self.write_map_len(entries.len() as u32)?;
                for (k, v) in entries {
                    self.write_str(k)?;
                    self.write_value(v)?;
                }
                Ok(())
            }
        }
    }
}

/// Decodes a single [`Value`] from the front of `bytes`, returning the value
/// and the number of bytes consumed. Used by round-trip tests, not by the
/// production send path (the agent never sends MessagePack back to us).
pub fn decode_value(bytes: &[u8]) -> Result<(Value, usize), Error> {
    let mut cur = std::io::Cursor::new(bytes);
    let value = decode_from(&mut cur)?;
    Ok((value, cur.position() as usize))
}

fn decode_from(cur: &mut std::io::Cursor<&[u8]>) -> Result<Value, Error> {
    use rmp::Marker;
    let marker = decode::read_marker(cur).map_err(|e| Error::Other(format!("{:?}", e)))?;
    match marker {
        Marker::Null => Ok(Value::Nil),
        Marker::True => Ok(Value::Bool(true)),
        Marker::False => Ok(Value::Bool(false)),
        Marker::FixPos(v) => Ok(Value::UInt(v as u64)),
        Marker::FixNeg(v) => Ok(Value::Int(v as i64)),
        Marker::U8 => Ok(Value::UInt(read_u8(cur)? as u64)),
        Marker::U16 => Ok(Value::UInt(read_u16(cur)? as u64)),
        Marker::U32 => Ok(Value::UInt(read_u32(cur)? as u64)),
        Marker::U64 => Ok(Value::UInt(read_u64(cur)?)),
        Marker::I8 => Ok(Value::Int(read_i8(cur)? as i64)),
        Marker::I16 => Ok(Value::Int(read_i16(cur)? as i64)),
        Marker::I32 => Ok(Value::Int(read_i32(cur)? as i64)),
        Marker::I64 => Ok(Value::Int(read_i64(cur)?)),
        Marker::F32 => Ok(Value::Float(read_f32(cur)? as f64)),
        Marker::F64 => Ok(Value::Float(read_f64(cur)?)),
        Marker::FixStr(len) => read_str_body(cur, len as usize),
        Marker::Str8 => {
            let len = read_u8(cur)? as usize;
            read_str_body(cur, len)
        }
        Marker::Str16 => {
            let len = read_u16(cur)? as usize;
            read_str_body(cur, len)
        }
        Marker::Str32 => {
            let len = read_u32(cur)? as usize;
            read_str_body(cur, len)
        }
        Marker::Bin8 => {
            let len = read_u8(cur)? as usize;
            read_bin_body(cur, len)
        }
        Marker::Bin16 => {
            let len = read_u16(cur)? as usize;
            read_bin_body(cur, len)
        }
        Marker::Bin32 => {
            let len = read_u32(cur)? as usize;
            read_bin_body(cur, len)
        }
        Marker::FixArray(len) => read_array_body(cur, len as usize),
        Marker::Array16 => {
            let len = read_u16(cur)? as usize;
            read_array_body(cur, len)
        }
        Marker::Array32 => {
            let len = read_u32(cur)? as usize;
            read_array_body(cur, len)
        }
        Marker::FixMap(len) => read_map_body(cur, len as usize),
        Marker::Map16 => {
            let len = read_u16(cur)? as usize;
            read_map_body(cur, len)
        }
        Marker::Map32 => {
            let len = read_u32(cur)? as usize;
            read_map_body(cur, len)
        }
        other => Err(Error::Other(format!("unsupported marker: {:?}", other))),
    }
}

fn read_array_body(cur: &mut std::io::Cursor<&[u8]>, len: usize) -> Result<Value, Error> {
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(decode_from(cur)?);
    }
    Ok(Value::Array(items))
}

fn read_map_body(cur: &mut std::io::Cursor<&[u8]>, len: usize) -> Result<Value, Error> {
    let mut map = BTreeMap::new();
    for _ in 0..len {
        let key = match decode_from(cur)? {
            Value::String(s) => s,
            other => return Err(Error::Other(format!("non-string map key: {:?}", other))),
        };
        let value = decode_from(cur)?;
        map.insert(key, value);
    }
    Ok(Value::Map(map))
}

fn read_str_body(cur: &mut std::io::Cursor<&[u8]>, len: usize) -> Result<Value, Error> {
    let mut buf = vec![0u8; len];
    std::io::Read::read_exact(cur, &mut buf).map_err(|e| Error::Other(e.to_string()))?;
    String::from_utf8(buf)
        .map(Value::String)
        .map_err(|e| Error::Other(e.to_string()))
}

fn read_bin_body(cur: &mut std::io::Cursor<&[u8]>, len: usize) -> Result<Value, Error> {
    let mut buf = vec![0u8; len];
    std::io::Read::read_exact(cur, &mut buf).map_err(|e| Error::Other(e.to_string()))?;
    Ok(Value::Binary(buf))
}

fn read_u8(cur: &mut std::io::Cursor<&[u8]>) -> Result<u8, Error> {
    cur.read_data_u8().map_err(|e| Error::Other(e.to_string()))
}
fn read_u16(cur: &mut std::io::Cursor<&[u8]>) -> Result<u16, Error> {
    cur.read_data_u16().map_err(|e| Error::Other(e.to_string()))
}
fn read_u32(cur: &mut std::io::Cursor<&[u8]>) -> Result<u32, Error> {
    cur.read_data_u32().map_err(|e| Error::Other(e.to_string()))
}
fn read_u64(cur: &mut std::io::Cursor<&[u8]>) -> Result<u64, Error> {
    cur.read_data_u64().map_err(|e| Error::Other(e.to_string()))
}
fn read_i8(cur: &mut std::io::Cursor<&[u8]>) -> Result<i8, Error> {
    cur.read_data_i8().map_err(|e| Error::Other(e.to_string()))
}
fn read_i16(cur: &mut std::io::Cursor<&[u8]>) -> Result<i16, Error> {
    cur.read_data_i16().map_err(|e| Error::Other(e.to_string()))
}
fn read_i32(cur: &mut std::io::Cursor<&[u8]>) -> Result<i32, Error> {
    cur.read_data_i32().map_err(|e| Error::Other(e.to_string()))
}
fn read_i64(cur: &mut std::io::Cursor<&[u8]>) -> Result<i64, Error> {
    cur.read_data_i64().map_err(|e| Error::Other(e.to_string()))
}
fn read_f32(cur: &mut std::io::Cursor<&[u8]>) -> Result<f32, Error> {
    cur.read_data_f32().map_err(|e| Error::Other(e.to_string()))
}
fn read_f64(cur: &mut std::io::Cursor<&[u8]>) -> Result<f64, Error> {
    cur.read_data_f64().map_err(|e| Error::Other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let mut w = Writer::new();
        w.write_value(&value).unwrap();
        let bytes = w.into_bytes();
        let (decoded, consumed) = decode_value(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, value);
    }

    #[test]
    fn round_trips_scalars() {
        round_trip(Value::Nil);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Int(-42));
        round_trip(Value::UInt(42));
        round_trip(Value::Float(3.5));
        round_trip(Value::String("hello world".into()));
        round_trip(Value::Binary(vec![1, 2, 3, 4]));
    }

    #[test]
    fn round_trips_nested_containers() {
        // `Int` round-trips only for actually-negative values: `write_int`
        // prefers the unsigned form for non-negative ones, so a non-negative
        // field must be built as `UInt` here to match what decode returns.
        let mut map = BTreeMap::new();
        map.insert("service".to_string(), Value::String("svc".into()));
        map.insert("duration".to_string(), Value::UInt(1500));
        round_trip(Value::Array(vec![Value::Map(map), Value::UInt(7)]));
    }

    #[test]
    fn prefers_unsigned_encoding_for_non_negative_ints() {
        let mut w = Writer::new();
        w.write_int(200).unwrap();
        let bytes = w.into_bytes();
        // 200 doesn't fit a fixint or i8, but fits u8 (0xcc prefix).
        assert_eq!(bytes[0], 0xcc);
    }

    #[test]
    fn large_negative_values_round_trip() {
        round_trip(Value::Int(i64::MIN));
    }
}
