//! The type-directed wire codec.
//!
//! [`encode`] and [`decode`] are pure functions translating between
//! [`Value`] sequences and the D-Bus wire representation of a signature.
//! Alignment is tracked relative to the start of the buffer, which for
//! message bodies coincides with alignment relative to the start of the
//! message since bodies begin on an 8-byte boundary.
//!
//! ```
//! use busmux::codec::{decode, encode};
//! use busmux::proto::Endianness;
//! use busmux::{Signature, Value};
//!
//! let sig = Signature::new(b"su")?;
//! let values = [Value::from("hi"), Value::UInt32(7)];
//!
//! let bytes = encode(sig, &values, Endianness::LITTLE)?;
//! assert_eq!(decode(sig, &bytes, Endianness::LITTLE)?, values);
//! # Ok::<_, busmux::Error>(())
//! ```


use crate::error::ErrorKind;
use crate::proto::{Endianness, Type};
use crate::utils::padding_to;
use crate::value::Value;
use crate::{Error, ObjectPathBuf, Result, Signature};

/// Hard cap on the byte length of a single array.
const MAX_ARRAY_LENGTH: u32 = 1 << 26;

/// Encode `values` under `signature` into a fresh buffer.
///
/// The number of values must match the number of complete element types in
/// the signature.
pub fn encode(signature: &Signature, values: &[Value], endianness: Endianness) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = Encoder {
        out: &mut out,
        endianness,
    };

    encoder.values(signature, values)?;
    Ok(out)
}

/// Decode the values of `signature` out of `bytes`.
///
/// The buffer must be fully consumed by the signature.
pub fn decode(signature: &Signature, bytes: &[u8], endianness: Endianness) -> Result<Vec<Value>> {
    let mut decoder = Decoder {
        buf: bytes,
        pos: 0,
        endianness,
    };

    let mut values = Vec::new();

    for element in signature.iter() {
        values.push(decoder.value(element)?);
    }

    if decoder.pos != bytes.len() {
        return Err(Error::new(ErrorKind::TrailingBytes));
    }

    Ok(values)
}

struct Encoder<'a> {
    out: &'a mut Vec<u8>,
    endianness: Endianness,
}

impl Encoder<'_> {
    fn values(&mut self, signature: &Signature, values: &[Value]) -> Result<()> {
        let expected = signature.iter().count();

        if expected != values.len() {
            return Err(Error::new(ErrorKind::ArgumentCount {
                expected,
                actual: values.len(),
            }));
        }

        for (element, value) in signature.iter().zip(values) {
            self.value(element, value)?;
        }

        Ok(())
    }

    fn align(&mut self, alignment: usize) {
        let pad = padding_to(self.out.len(), alignment);
        self.out.resize(self.out.len() + pad, 0);
    }

    fn u16(&mut self, v: u16) {
        match self.endianness {
            Endianness::BIG => self.out.extend_from_slice(&v.to_be_bytes()),
            _ => self.out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn u32(&mut self, v: u32) {
        match self.endianness {
            Endianness::BIG => self.out.extend_from_slice(&v.to_be_bytes()),
            _ => self.out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn u64(&mut self, v: u64) {
        match self.endianness {
            Endianness::BIG => self.out.extend_from_slice(&v.to_be_bytes()),
            _ => self.out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        let bytes = match self.endianness {
            Endianness::BIG => v.to_be_bytes(),
            _ => v.to_le_bytes(),
        };

        self.out[at..at + 4].copy_from_slice(&bytes);
    }

    /// Write a long (u32-prefixed, NUL-terminated) string.
    fn long_string(&mut self, string: &str) {
        self.align(4);
        self.u32(string.len() as u32);
        self.out.extend_from_slice(string.as_bytes());
        self.out.push(0);
    }

    /// Write a short (u8-prefixed, NUL-terminated) signature string.
    fn signature_string(&mut self, signature: &Signature) {
        self.out.push(signature.len() as u8);
        self.out.extend_from_slice(signature.as_bytes());
        self.out.push(0);
    }

    fn value(&mut self, element: &Signature, value: &Value) -> Result<()> {
        let code = element.code();

        let mismatch = || Error::new(ErrorKind::MismatchedValue(code));

        match code {
            Type::BYTE => {
                let Value::Byte(v) = value else {
                    return Err(mismatch());
                };

                self.out.push(*v);
            }
            Type::BOOLEAN => {
                let Value::Bool(v) = value else {
                    return Err(mismatch());
                };

                self.align(4);
                self.u32(u32::from(*v));
            }
            Type::INT16 => {
                let Value::Int16(v) = value else {
                    return Err(mismatch());
                };

                self.align(2);
                self.u16(*v as u16);
            }
            Type::UINT16 => {
                let Value::UInt16(v) = value else {
                    return Err(mismatch());
                };

                self.align(2);
                self.u16(*v);
            }
            Type::INT32 => {
                let Value::Int32(v) = value else {
                    return Err(mismatch());
                };

                self.align(4);
                self.u32(*v as u32);
            }
            Type::UINT32 => {
                let Value::UInt32(v) = value else {
                    return Err(mismatch());
                };

                self.align(4);
                self.u32(*v);
            }
            Type::UNIX_FD => {
                let Value::UnixFd(v) = value else {
                    return Err(mismatch());
                };

                self.align(4);
                self.u32(*v);
            }
            Type::INT64 => {
                let Value::Int64(v) = value else {
                    return Err(mismatch());
                };

                self.align(8);
                self.u64(*v as u64);
            }
            Type::UINT64 => {
                let Value::UInt64(v) = value else {
                    return Err(mismatch());
                };

                self.align(8);
                self.u64(*v);
            }
            Type::DOUBLE => {
                let Value::Double(v) = value else {
                    return Err(mismatch());
                };

                self.align(8);
                self.u64(v.to_bits());
            }
            Type::STRING => {
                let Some(string) = value.as_str() else {
                    return Err(mismatch());
                };

                self.long_string(string);
            }
            Type::OBJECT_PATH => {
                // Any string-like value is accepted, but it must be a valid
                // path on the wire.
                let Some(string) = value.as_str() else {
                    return Err(mismatch());
                };

                let path = crate::ObjectPath::new(string)?;
                self.long_string(path.as_str());
            }
            Type::SIGNATURE => {
                let Some(string) = value.as_str() else {
                    return Err(mismatch());
                };

                let signature = Signature::from_str(string)?;
                self.signature_string(signature);
            }
            Type::ARRAY => {
                self.array(element.array_element(), value)?;
            }
            Type::OPEN_PAREN => {
                let Value::Struct(fields) = value else {
                    return Err(mismatch());
                };

                self.align(8);
                self.values(element.container_fields(), fields)?;
            }
            Type::VARIANT => {
                let (signature, inner);

                match value {
                    Value::Variant(s, v) => {
                        s.ensure_single_complete()?;
                        signature = s.clone();
                        inner = &**v;
                    }
                    value => {
                        signature = value.signature()?;
                        inner = value;
                    }
                }

                self.signature_string(&signature);
                self.value(&signature, inner)?;
            }
            _ => return Err(mismatch()),
        }

        Ok(())
    }

    fn array(&mut self, element: &Signature, value: &Value) -> Result<()> {
        self.align(4);
        let patch_at = self.out.len();
        self.u32(0);
        self.align(element.alignment());
        let start = self.out.len();

        match (element.code(), value) {
            (Type::OPEN_BRACE, Value::Dict(entries)) => {
                let mut fields = element.container_fields().iter();
                let key_sig = fields.next().expect("dict entry has a key");
                let value_sig = fields.next().expect("dict entry has a value");

                for (key, value) in entries {
                    self.align(8);
                    self.value(key_sig, key)?;
                    self.value(value_sig, value)?;
                }
            }
            (_, Value::Array(values)) => {
                for value in values {
                    self.value(element, value)?;
                }
            }
            _ => {
                return Err(Error::new(ErrorKind::MismatchedValue(Type::ARRAY)));
            }
        }

        let length = (self.out.len() - start) as u32;

        if length > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::ArrayTooLong(length)));
        }

        self.patch_u32(patch_at, length);
        Ok(())
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> Decoder<'a> {
    fn align(&mut self, alignment: usize) -> Result<()> {
        let pad = padding_to(self.pos, alignment);

        if self.pos + pad > self.buf.len() {
            return Err(Error::new(ErrorKind::ShortBuffer));
        }

        self.pos += pad;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let Some(bytes) = self.buf.get(self.pos..self.pos + n) else {
            return Err(Error::new(ErrorKind::ShortBuffer));
        };

        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let bytes = self.take(2)?.try_into().expect("take returned 2 bytes");

        Ok(match self.endianness {
            Endianness::BIG => u16::from_be_bytes(bytes),
            _ => u16::from_le_bytes(bytes),
        })
    }

    fn u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.take(4)?.try_into().expect("take returned 4 bytes");

        Ok(match self.endianness {
            Endianness::BIG => u32::from_be_bytes(bytes),
            _ => u32::from_le_bytes(bytes),
        })
    }

    fn u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let bytes = self.take(8)?.try_into().expect("take returned 8 bytes");

        Ok(match self.endianness {
            Endianness::BIG => u64::from_be_bytes(bytes),
            _ => u64::from_le_bytes(bytes),
        })
    }

    /// Read a long (u32-prefixed, NUL-terminated) string.
    fn long_string(&mut self) -> Result<&'a str> {
        let length = self.u32()? as usize;
        let bytes = self.take(length)?;

        if self.u8()? != 0 {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }

        Ok(std::str::from_utf8(bytes)?)
    }

    /// Read a short (u8-prefixed, NUL-terminated) signature string.
    fn signature_string(&mut self) -> Result<&'a Signature> {
        let length = self.u8()? as usize;
        let bytes = self.take(length)?;

        if self.u8()? != 0 {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }

        Ok(Signature::new(bytes)?)
    }

    fn value(&mut self, element: &Signature) -> Result<Value> {
        Ok(match element.code() {
            Type::BYTE => Value::Byte(self.u8()?),
            Type::BOOLEAN => match self.u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                value => return Err(Error::new(ErrorKind::InvalidBoolean(value))),
            },
            Type::INT16 => Value::Int16(self.u16()? as i16),
            Type::UINT16 => Value::UInt16(self.u16()?),
            Type::INT32 => Value::Int32(self.u32()? as i32),
            Type::UINT32 => Value::UInt32(self.u32()?),
            Type::UNIX_FD => Value::UnixFd(self.u32()?),
            Type::INT64 => Value::Int64(self.u64()? as i64),
            Type::UINT64 => Value::UInt64(self.u64()?),
            Type::DOUBLE => Value::Double(f64::from_bits(self.u64()?)),
            Type::STRING => Value::String(self.long_string()?.to_owned()),
            Type::OBJECT_PATH => {
                let string = self.long_string()?;
                Value::ObjectPath(ObjectPathBuf::new(string)?)
            }
            Type::SIGNATURE => Value::Signature(self.signature_string()?.to_owned()),
            Type::ARRAY => self.array(element.array_element())?,
            Type::OPEN_PAREN => {
                self.align(8)?;
                let mut fields = Vec::new();

                for field in element.container_fields().iter() {
                    fields.push(self.value(field)?);
                }

                Value::Struct(fields)
            }
            Type::VARIANT => {
                let signature = self.signature_string()?;
                signature.ensure_single_complete()?;
                let value = self.value(signature)?;
                Value::Variant(signature.to_owned(), Box::new(value))
            }
            code => return Err(Error::new(ErrorKind::MismatchedValue(code))),
        })
    }

    fn array(&mut self, element: &Signature) -> Result<Value> {
        let length = self.u32()?;

        if length > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::ArrayTooLong(length)));
        }

        self.align(element.alignment())?;

        let end = self.pos + length as usize;

        if end > self.buf.len() {
            return Err(Error::new(ErrorKind::ArrayOutOfBounds(length)));
        }

        let value = if element.code() == Type::OPEN_BRACE {
            let mut fields = element.container_fields().iter();
            let key_sig = fields.next().expect("dict entry has a key");
            let value_sig = fields.next().expect("dict entry has a value");

            let mut entries = Vec::new();

            while self.pos < end {
                self.align(8)?;
                let key = self.value(key_sig)?;
                let value = self.value(value_sig)?;
                entries.push((key, value));
            }

            Value::Dict(entries)
        } else {
            let mut values = Vec::new();

            while self.pos < end {
                values.push(self.value(element)?);
            }

            Value::Array(values)
        };

        if self.pos != end {
            return Err(Error::new(ErrorKind::TrailingBytes));
        }

        Ok(value)
    }
}
