//! Message framing on top of the codec.
//!
//! A message is a fixed 16-byte prefix, a header field array, padding up to
//! an 8-byte boundary, and the body. The prefix is enough to compute the
//! total size of the rest; the full header is decoded through the codec
//! under the outer signature `yyyyuua(yv)`.

use std::num::NonZeroU32;

use crate::codec;
use crate::error::ErrorKind;
use crate::proto::{
    Endianness, Flags, HeaderField, MessageType, MAX_HEADER_LENGTH, MAX_MESSAGE_LENGTH,
    PREFIX_LENGTH,
};
use crate::utils::padding_to;
use crate::value::Value;
use crate::{BusEvent, Error, Message, MessageKind, ObjectPathBuf, Result, Signature, SignatureBuf};

/// The fixed message prefix, as parsed from the first 16 bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Head {
    pub(crate) endianness: Endianness,
    pub(crate) message_type: MessageType,
    pub(crate) flags: Flags,
    pub(crate) serial: NonZeroU32,
    pub(crate) body_length: usize,
    pub(crate) header_length: usize,
}

impl Head {
    /// Parse and validate the fixed prefix.
    pub(crate) fn parse(prefix: &[u8; PREFIX_LENGTH]) -> Result<Head> {
        let endianness = Endianness::new(prefix[0]);

        if !endianness.is_valid() || prefix[3] != 1 {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        }

        let field = |at: usize| {
            let bytes = prefix[at..at + 4].try_into().expect("prefix is 16 bytes");

            match endianness {
                Endianness::BIG => u32::from_be_bytes(bytes),
                _ => u32::from_le_bytes(bytes),
            }
        };

        let body_length = field(4);
        let serial = field(8);
        let header_length = field(12);

        if header_length >= MAX_HEADER_LENGTH {
            return Err(Error::new(ErrorKind::HeaderTooLong(header_length)));
        }

        if header_length.saturating_add(body_length) > MAX_MESSAGE_LENGTH {
            return Err(Error::new(ErrorKind::BodyTooLong(body_length)));
        }

        let serial = NonZeroU32::new(serial).ok_or(Error::new(ErrorKind::ZeroSerial))?;

        Ok(Head {
            endianness,
            message_type: MessageType::new(prefix[1]),
            flags: Flags(prefix[2]),
            serial,
            body_length: body_length as usize,
            header_length: header_length as usize,
        })
    }

    /// The number of bytes which follow the prefix: the rest of the header
    /// array, padding up to the 8-aligned body start, and the body itself.
    pub(crate) fn remaining(&self) -> usize {
        self.header_length + padding_to(self.header_length, 8) + self.body_length
    }
}

fn header_field(code: HeaderField, signature: &Signature, value: Value) -> Value {
    Value::Struct(vec![
        Value::Byte(code.0),
        Value::Variant(signature.to_owned(), Box::new(value)),
    ])
}

/// Serialize a message into its full wire form: header, padding to the
/// 8-aligned body start, and body bytes.
pub(crate) fn serialize(
    message: &Message,
    serial: NonZeroU32,
    endianness: Endianness,
) -> Result<Vec<u8>> {
    let body = codec::encode(&message.signature, &message.body, endianness)?;

    let mut fields = Vec::new();

    match &message.kind {
        MessageKind::MethodCall { path, member } => {
            fields.push(header_field(
                HeaderField::PATH,
                Signature::OBJECT_PATH,
                Value::ObjectPath(path.clone()),
            ));
            fields.push(header_field(
                HeaderField::MEMBER,
                Signature::STRING,
                Value::String(member.clone()),
            ));
        }
        MessageKind::MethodReturn { reply_serial } => {
            fields.push(header_field(
                HeaderField::REPLY_SERIAL,
                Signature::UINT32,
                Value::UInt32(reply_serial.get()),
            ));
        }
        MessageKind::Error {
            error_name,
            reply_serial,
        } => {
            fields.push(header_field(
                HeaderField::ERROR_NAME,
                Signature::STRING,
                Value::String(error_name.clone()),
            ));
            fields.push(header_field(
                HeaderField::REPLY_SERIAL,
                Signature::UINT32,
                Value::UInt32(reply_serial.get()),
            ));
        }
        MessageKind::Signal { path, member } => {
            fields.push(header_field(
                HeaderField::PATH,
                Signature::OBJECT_PATH,
                Value::ObjectPath(path.clone()),
            ));
            fields.push(header_field(
                HeaderField::MEMBER,
                Signature::STRING,
                Value::String(member.clone()),
            ));
        }
    }

    if let Some(interface) = &message.interface {
        fields.push(header_field(
            HeaderField::INTERFACE,
            Signature::STRING,
            Value::String(interface.clone()),
        ));
    }

    if let Some(destination) = &message.destination {
        fields.push(header_field(
            HeaderField::DESTINATION,
            Signature::STRING,
            Value::String(destination.clone()),
        ));
    }

    if let Some(sender) = &message.sender {
        fields.push(header_field(
            HeaderField::SENDER,
            Signature::STRING,
            Value::String(sender.clone()),
        ));
    }

    if !message.signature.is_empty() {
        fields.push(header_field(
            HeaderField::SIGNATURE,
            Signature::SIGNATURE,
            Value::Signature(message.signature.clone()),
        ));
    }

    let values = [
        Value::Byte(endianness.0),
        Value::Byte(message.message_type().0),
        Value::Byte(message.flags.0),
        Value::Byte(1),
        Value::UInt32(body.len() as u32),
        Value::UInt32(serial.get()),
        Value::Array(fields),
    ];

    let mut out = codec::encode(Signature::MESSAGE, &values, endianness)?;

    let header_length = (out.len() - PREFIX_LENGTH) as u32;

    if header_length >= MAX_HEADER_LENGTH {
        return Err(Error::new(ErrorKind::HeaderTooLong(header_length)));
    }

    if header_length.saturating_add(body.len() as u32) > MAX_MESSAGE_LENGTH {
        return Err(Error::new(ErrorKind::BodyTooLong(body.len() as u32)));
    }

    let pad = padding_to(out.len(), 8);
    out.resize(out.len() + pad, 0);
    out.extend_from_slice(&body);

    Ok(out)
}

/// Deserialize a full message (prefix included) into a [`BusEvent`].
///
/// `bytes` must contain exactly `PREFIX_LENGTH + head.remaining()` bytes.
pub(crate) fn deserialize(head: &Head, bytes: &[u8]) -> Result<BusEvent> {
    let header_end = PREFIX_LENGTH + head.header_length;
    let values = codec::decode(Signature::MESSAGE, &bytes[..header_end], head.endianness)?;

    let Some(Value::Array(fields)) = values.into_iter().nth(6) else {
        return Err(Error::new(ErrorKind::InvalidProtocol));
    };

    let mut path = None::<ObjectPathBuf>;
    let mut interface = None;
    let mut member = None;
    let mut error_name = None;
    let mut reply_serial = None;
    let mut destination = None;
    let mut sender = None;
    let mut signature = None::<SignatureBuf>;

    for field in fields {
        let Value::Struct(mut entry) = field else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        if entry.len() != 2 {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        }

        let value = entry.pop().expect("entry has two fields");
        let code = entry.pop().expect("entry has two fields");

        let Value::Byte(code) = code else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        let value = value.unwrap_variant();

        let string = || -> Result<String> {
            match value.as_str() {
                Some(s) => Ok(s.to_owned()),
                None => Err(Error::new(ErrorKind::InvalidProtocol)),
            }
        };

        match HeaderField::new(code) {
            HeaderField::PATH => {
                path = Some(ObjectPathBuf::new(&string()?)?);
            }
            HeaderField::INTERFACE => {
                interface = Some(string()?);
            }
            HeaderField::MEMBER => {
                member = Some(string()?);
            }
            HeaderField::ERROR_NAME => {
                error_name = Some(string()?);
            }
            HeaderField::REPLY_SERIAL => {
                let Some(value) = value.as_u32() else {
                    return Err(Error::new(ErrorKind::InvalidProtocol));
                };

                let value =
                    NonZeroU32::new(value).ok_or(Error::new(ErrorKind::ZeroSerial))?;
                reply_serial = Some(value);
            }
            HeaderField::DESTINATION => {
                destination = Some(string()?);
            }
            HeaderField::SENDER => {
                sender = Some(string()?);
            }
            HeaderField::SIGNATURE => {
                signature = Some(SignatureBuf::from_str(&string()?)?);
            }
            // Unknown header fields, including UNIX_FDS, are ignored.
            _ => {}
        }
    }

    match head.message_type {
        MessageType::METHOD_CALL | MessageType::SIGNAL => {
            if path.is_none() {
                return Err(Error::new(ErrorKind::MissingPath));
            }

            if member.is_none() {
                return Err(Error::new(ErrorKind::MissingMember));
            }
        }
        MessageType::METHOD_RETURN => {
            if reply_serial.is_none() {
                return Err(Error::new(ErrorKind::MissingReplySerial));
            }
        }
        MessageType::ERROR => {
            if error_name.is_none() {
                return Err(Error::new(ErrorKind::MissingErrorName));
            }

            if reply_serial.is_none() {
                return Err(Error::new(ErrorKind::MissingReplySerial));
            }
        }
        _ => {}
    }

    let body_start = header_end + padding_to(head.header_length, 8);
    let body_bytes = &bytes[body_start..];

    let (signature, body) = if body_bytes.is_empty() {
        (SignatureBuf::empty(), Vec::new())
    } else {
        let Some(signature) = signature else {
            return Err(Error::new(ErrorKind::MissingBodySignature));
        };

        let body = codec::decode(&signature, body_bytes, head.endianness)?;
        (signature, body)
    };

    Ok(BusEvent {
        message_type: head.message_type,
        flags: head.flags,
        serial: head.serial,
        path,
        interface,
        member,
        error_name,
        reply_serial,
        destination,
        sender,
        signature,
        body,
    })
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crate::proto::{Endianness, MessageType, PREFIX_LENGTH};
    use crate::{Message, ObjectPath, Value};

    use super::{deserialize, serialize, Head};

    const DBUS_PATH: &ObjectPath = ObjectPath::new_const("/org/freedesktop/DBus");

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn hello_wire_form() {
        let m = Message::method_call(DBUS_PATH, "Hello")
            .with_destination("org.freedesktop.DBus")
            .with_interface("org.freedesktop.DBus");

        let bytes = serialize(&m, serial(1), Endianness::LITTLE).unwrap();

        // The canonical Hello call is 128 bytes on the wire: the header
        // padded up to the 8-aligned body start, with an empty body.
        assert_eq!(bytes.len(), 128);
        assert_eq!(&bytes[125..], &[0, 0, 0]);

        let head = Head::parse(bytes[..PREFIX_LENGTH].try_into().unwrap()).unwrap();
        assert_eq!(head.message_type, MessageType::METHOD_CALL);
        assert_eq!(head.serial, serial(1));
        assert_eq!(head.body_length, 0);
        assert_eq!(head.header_length, 109);
        assert_eq!(head.remaining(), bytes.len() - PREFIX_LENGTH);
    }

    #[test]
    fn round_trip_method_call() {
        let m = Message::method_call(DBUS_PATH, "RequestName")
            .with_interface("org.freedesktop.DBus")
            .with_destination("org.freedesktop.DBus")
            .with_body("su", vec![Value::from("foo.bar"), Value::UInt32(4)])
            .unwrap();

        let bytes = serialize(&m, serial(3), Endianness::LITTLE).unwrap();
        let head = Head::parse(bytes[..PREFIX_LENGTH].try_into().unwrap()).unwrap();
        let event = deserialize(&head, &bytes).unwrap();

        assert_eq!(event.message_type, MessageType::METHOD_CALL);
        assert_eq!(event.serial, serial(3));
        assert_eq!(event.path.as_deref(), Some(DBUS_PATH));
        assert_eq!(event.member.as_deref(), Some("RequestName"));
        assert_eq!(event.interface.as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(event.signature.as_str(), "su");
        assert_eq!(
            event.body,
            [Value::from("foo.bar"), Value::UInt32(4)]
        );
    }

    #[test]
    fn round_trip_error() {
        let m = Message::error("org.freedesktop.DBus.Error.UnknownMethod", serial(9))
            .with_destination(":1.10")
            .with_body("s", vec![Value::from("no such method")])
            .unwrap();

        let bytes = serialize(&m, serial(4), Endianness::LITTLE).unwrap();
        let head = Head::parse(bytes[..PREFIX_LENGTH].try_into().unwrap()).unwrap();
        let event = deserialize(&head, &bytes).unwrap();

        assert_eq!(event.message_type, MessageType::ERROR);
        assert_eq!(
            event.error_name.as_deref(),
            Some("org.freedesktop.DBus.Error.UnknownMethod")
        );
        assert_eq!(event.reply_serial, Some(serial(9)));
        assert_eq!(event.body, [Value::from("no such method")]);
    }

    #[test]
    fn rejects_bad_prefix() {
        // Bad endian marker.
        let mut prefix = [0u8; PREFIX_LENGTH];
        prefix[0] = b'x';
        prefix[3] = 1;
        assert!(Head::parse(&prefix).is_err());

        // Bad protocol version.
        let mut prefix = [0u8; PREFIX_LENGTH];
        prefix[0] = b'l';
        prefix[3] = 2;
        assert!(Head::parse(&prefix).is_err());

        // Zero serial.
        let mut prefix = [0u8; PREFIX_LENGTH];
        prefix[0] = b'l';
        prefix[3] = 1;
        assert!(Head::parse(&prefix).is_err());

        // Oversize header array.
        let mut prefix = [0u8; PREFIX_LENGTH];
        prefix[0] = b'l';
        prefix[3] = 1;
        prefix[8] = 1;
        prefix[12..16].copy_from_slice(&(1u32 << 26).to_le_bytes());
        assert!(Head::parse(&prefix).is_err());
    }
}
