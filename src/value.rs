use std::fmt;

use crate::error::ErrorKind;
use crate::{Error, ObjectPathBuf, Result, Signature, SignatureBuf};

/// The logical value of a single signature element.
///
/// Most wire types are inferable from the signature alone; the
/// [`ObjectPath`], [`Signature`] and [`Variant`] constructors exist to force
/// a particular wire form where the logical type is ambiguous, such as a
/// string-like value in a variant position whose wire code must be `o` or
/// `g`.
///
/// [`ObjectPath`]: Value::ObjectPath
/// [`Signature`]: Value::Signature
/// [`Variant`]: Value::Variant
///
/// # Examples
///
/// ```
/// use busmux::Value;
///
/// let value = Value::from("hello");
/// assert_eq!(value.as_str(), Some("hello"));
///
/// let array = Value::Array(vec![Value::UInt32(1), Value::UInt32(2)]);
/// assert_eq!(array.signature()?.as_str(), "au");
/// # Ok::<_, busmux::Error>(())
/// ```
#[derive(Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// An 8-bit unsigned integer (`y`).
    Byte(u8),
    /// A boolean (`b`).
    Bool(bool),
    /// A 16-bit signed integer (`n`).
    Int16(i16),
    /// A 16-bit unsigned integer (`q`).
    UInt16(u16),
    /// A 32-bit signed integer (`i`).
    Int32(i32),
    /// A 32-bit unsigned integer (`u`).
    UInt32(u32),
    /// A 64-bit signed integer (`x`).
    Int64(i64),
    /// A 64-bit unsigned integer (`t`).
    UInt64(u64),
    /// An IEEE 754 double (`d`).
    Double(f64),
    /// A Unix file descriptor index (`h`). Only the wire representation is
    /// carried; descriptor passing is not supported.
    UnixFd(u32),
    /// A UTF-8 string (`s`).
    String(String),
    /// An object path (`o`).
    ObjectPath(ObjectPathBuf),
    /// A signature (`g`).
    Signature(SignatureBuf),
    /// An ordered sequence (`a<T>`).
    Array(Vec<Value>),
    /// An ordered mapping (`a{KV}`).
    Dict(Vec<(Value, Value)>),
    /// An ordered tuple (`(…)`).
    Struct(Vec<Value>),
    /// A tagged value (`v`) carrying its signature inline.
    Variant(SignatureBuf, Box<Value>),
}

impl Value {
    /// Construct a variant with an explicit signature, checking that the
    /// signature is a single complete type.
    pub fn variant(signature: &Signature, value: Value) -> Result<Value> {
        signature.ensure_single_complete()?;
        Ok(Value::Variant(signature.to_owned(), Box::new(value)))
    }

    /// The value as a string slice, for any of the string-like wire types.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The value as a `u32`, if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::UInt32(v) => Some(v),
            _ => None,
        }
    }

    /// The value as a `bool`, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// The value as an array slice, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Strip any number of variant tags off the value.
    pub fn unwrap_variant(&self) -> &Value {
        let mut value = self;

        while let Value::Variant(_, inner) = value {
            value = &**inner;
        }

        value
    }

    /// Infer the signature describing this value.
    ///
    /// Fails with an error for an empty array or dict, whose element type
    /// cannot be known from the value alone.
    pub fn signature(&self) -> Result<SignatureBuf> {
        let mut out = String::new();
        self.write_signature(&mut out)?;
        // The string is assembled from valid parts.
        Ok(SignatureBuf::from_str(&out).expect("inferred signature must be valid"))
    }

    fn write_signature(&self, out: &mut String) -> Result<()> {
        match self {
            Value::Byte(..) => out.push('y'),
            Value::Bool(..) => out.push('b'),
            Value::Int16(..) => out.push('n'),
            Value::UInt16(..) => out.push('q'),
            Value::Int32(..) => out.push('i'),
            Value::UInt32(..) => out.push('u'),
            Value::Int64(..) => out.push('x'),
            Value::UInt64(..) => out.push('t'),
            Value::Double(..) => out.push('d'),
            Value::UnixFd(..) => out.push('h'),
            Value::String(..) => out.push('s'),
            Value::ObjectPath(..) => out.push('o'),
            Value::Signature(..) => out.push('g'),
            Value::Variant(..) => out.push('v'),
            Value::Array(values) => {
                let Some(first) = values.first() else {
                    return Err(Error::new(ErrorKind::CannotInferVariant));
                };

                out.push('a');
                first.write_signature(out)?;
            }
            Value::Dict(entries) => {
                let Some((key, value)) = entries.first() else {
                    return Err(Error::new(ErrorKind::CannotInferVariant));
                };

                out.push_str("a{");
                key.write_signature(out)?;
                value.write_signature(out)?;
                out.push('}');
            }
            Value::Struct(fields) => {
                out.push('(');

                for field in fields {
                    field.write_signature(out)?;
                }

                out.push(')');
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v}u8"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}i16"),
            Value::UInt16(v) => write!(f, "{v}u16"),
            Value::Int32(v) => write!(f, "{v}i32"),
            Value::UInt32(v) => write!(f, "{v}u32"),
            Value::Int64(v) => write!(f, "{v}i64"),
            Value::UInt64(v) => write!(f, "{v}u64"),
            Value::Double(v) => write!(f, "{v}f64"),
            Value::UnixFd(v) => write!(f, "fd({v})"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::ObjectPath(v) => write!(f, "o{:?}", v.as_str()),
            Value::Signature(v) => write!(f, "g{:?}", v.as_str()),
            Value::Array(values) => f.debug_list().entries(values).finish(),
            Value::Dict(entries) => {
                f.debug_map().entries(entries.iter().map(|(k, v)| (k, v))).finish()
            }
            Value::Struct(fields) => {
                let mut t = f.debug_tuple("");

                for field in fields {
                    t.field(field);
                }

                t.finish()
            }
            Value::Variant(signature, value) => {
                write!(f, "variant({signature}, {value:?})")
            }
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                #[inline]
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    }
}

impl_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    ObjectPathBuf => ObjectPath,
    SignatureBuf => Signature,
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<&crate::ObjectPath> for Value {
    #[inline]
    fn from(value: &crate::ObjectPath) -> Self {
        Value::ObjectPath(value.to_owned())
    }
}

impl From<&Signature> for Value {
    #[inline]
    fn from(value: &Signature) -> Self {
        Value::Signature(value.to_owned())
    }
}
