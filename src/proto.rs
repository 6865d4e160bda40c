//! Low level details for the D-Bus protocol implementation.

use std::fmt;

/// Hard cap on `header_array_len + body_len` of a single message.
pub(crate) const MAX_MESSAGE_LENGTH: u32 = 1 << 27;

/// Hard cap on the byte length of the header field array.
pub(crate) const MAX_HEADER_LENGTH: u32 = 1 << 26;

/// Size of the fixed message prefix, up to and including the header array
/// byte count.
pub(crate) const PREFIX_LENGTH: usize = 16;

macro_rules! raw_enum {
    (
        $(#[doc = $doc:literal])*
        #[repr($repr:ty)]
        $vis:vis enum $name:ident {
            $(
                $(#[$($variant_meta:meta)*])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        $vis struct $name(pub(crate) $repr);

        impl $name {
            $(
                $(#[$($variant_meta)*])*
                $vis const $variant: Self = Self($value);
            )*

            /// Construct from a raw value without checking that it names a
            /// known variant.
            #[inline]
            $vis const fn new(value: $repr) -> Self {
                Self(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    _ => f.write_str("INVALID"),
                }
            }
        }
    }
}

macro_rules! raw_set {
    (
        $(#[doc = $doc:literal])*
        #[repr($repr:ty)]
        $vis:vis enum $name:ident {
            $(
                $(#[$($variant_meta:meta)*])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Default, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        $vis struct $name(pub(crate) $repr);

        impl $name {
            $(
                $(#[$($variant_meta)*])*
                $vis const $variant: Self = Self($value);
            )*
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                struct Raw(&'static str);

                impl fmt::Debug for Raw {
                    #[inline]
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "{}", self.0)
                    }
                }

                struct Bits($repr);

                impl fmt::Debug for Bits {
                    #[inline]
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "{:b}", self.0)
                    }
                }

                let mut f = f.debug_set();

                let mut this = *self;

                $(
                    if this & Self::$variant {
                        f.entry(&Raw(stringify!($variant)));
                        this = this ^ Self::$variant;
                    }
                )*

                if this.0 != 0 {
                    f.entry(&Bits(this.0));
                }

                f.finish()
            }
        }

        impl ::core::ops::BitOr<$name> for $name {
            type Output = Self;

            #[inline]
            fn bitor(self, rhs: $name) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl ::core::ops::BitAnd<$name> for $name {
            type Output = bool;

            #[inline]
            fn bitand(self, rhs: $name) -> Self::Output {
                self.0 & rhs.0 != 0
            }
        }

        impl ::core::ops::BitXor<$name> for $name {
            type Output = Self;

            #[inline]
            fn bitxor(self, rhs: $name) -> Self::Output {
                Self(self.0 ^ rhs.0)
            }
        }
    }
}

raw_enum! {
    /// The endianness of a message.
    #[repr(u8)]
    pub enum Endianness {
        /// Little endian.
        LITTLE = b'l',
        /// Big endian.
        BIG = b'B',
    }
}

impl Endianness {
    /// Native endian.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::LITTLE;
    /// Native endian.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::BIG;

    /// Test that the marker byte names a supported byte order.
    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        matches!(*self, Self::LITTLE | Self::BIG)
    }
}

raw_enum! {
    /// The type of a message.
    #[repr(u8)]
    pub enum MessageType {
        /// Method call. This message type may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply. If the first argument exists and is a string, it is
        /// an error message.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

impl MessageType {
    /// The name used for this message type in match expressions.
    pub(crate) fn match_name(&self) -> &'static str {
        match *self {
            Self::METHOD_CALL => "method_call",
            Self::METHOD_RETURN => "method_return",
            Self::ERROR => "error",
            Self::SIGNAL => "signal",
            _ => "unknown",
        }
    }
}

raw_set! {
    /// Flags inside of a D-Bus message.
    ///
    /// # Examples
    ///
    /// ```
    /// use busmux::proto::Flags;
    /// let flags = Flags::EMPTY;
    /// assert!(!(flags & Flags::NO_REPLY_EXPECTED));
    ///
    /// let flags = Flags::EMPTY | Flags::NO_REPLY_EXPECTED;
    /// assert!(flags & Flags::NO_REPLY_EXPECTED);
    /// assert!(!(flags & Flags::NO_AUTO_START));
    /// ```
    #[repr(u8)]
    pub enum Flags {
        /// An empty set of flags.
        EMPTY = 0,
        /// This message does not expect method return replies or error
        /// replies, even if it is of a type that can have a reply; the reply
        /// should be omitted.
        NO_REPLY_EXPECTED = 1,
        /// The bus must not launch an owner for the destination name in
        /// response to this message.
        NO_AUTO_START = 2,
        /// This flag may be set on a method call message to inform the
        /// receiving side that the caller is prepared to wait for interactive
        /// authorization, which might take a considerable time to complete.
        ALLOW_INTERACTIVE_AUTHORIZATION = 4,
    }
}

raw_enum! {
    /// Codes in the message header field array.
    #[repr(u8)]
    pub enum HeaderField {
        /// The object to send a call to, or the object a signal is emitted
        /// from.
        PATH = 1,
        /// The interface to invoke a method call on, or that a signal is
        /// emitted from. Optional for method calls, required for signals.
        INTERFACE = 2,
        /// The member, either the method name or signal name.
        MEMBER = 3,
        /// The name of the error that occurred, for errors.
        ERROR_NAME = 4,
        /// The serial number of the message this message is a reply to.
        REPLY_SERIAL = 5,
        /// The name of the connection this message is intended for.
        DESTINATION = 6,
        /// Unique name of the sending connection. On a message bus this
        /// header field is controlled by the message bus, so it is as
        /// reliable and trustworthy as the message bus itself.
        SENDER = 7,
        /// The signature of the message body. If omitted, it is assumed to
        /// be the empty signature (i.e. the body must be 0-length).
        SIGNATURE = 8,
        /// The number of Unix file descriptors that accompany the message.
        UNIX_FDS = 9,
    }
}

raw_enum! {
    /// The type inside of a signature.
    #[repr(u8)]
    pub enum Type {
        /// Not a valid type code, used to terminate signatures.
        INVALID = b'\0',
        /// 8-bit unsigned integer.
        BYTE = b'y',
        /// Boolean value, 0 is FALSE and 1 is TRUE. Everything else is
        /// invalid.
        BOOLEAN = b'b',
        /// 16-bit signed integer.
        INT16 = b'n',
        /// 16-bit unsigned integer.
        UINT16 = b'q',
        /// 32-bit signed integer.
        INT32 = b'i',
        /// 32-bit unsigned integer.
        UINT32 = b'u',
        /// 64-bit signed integer.
        INT64 = b'x',
        /// 64-bit unsigned integer.
        UINT64 = b't',
        /// IEEE 754 double.
        DOUBLE = b'd',
        /// UTF-8 string (must be valid UTF-8). Must be nul terminated and
        /// contain no other nul bytes.
        STRING = b's',
        /// Name of an object instance.
        OBJECT_PATH = b'o',
        /// A type signature.
        SIGNATURE = b'g',
        /// Array.
        ARRAY = b'a',
        OPEN_PAREN = b'(',
        CLOSE_PAREN = b')',
        /// Variant type (the type of the value is part of the value itself).
        VARIANT = b'v',
        OPEN_BRACE = b'{',
        CLOSE_BRACE = b'}',
        /// Unix file descriptor.
        UNIX_FD = b'h',
    }
}

impl Type {
    /// The alignment in bytes of a value of this type, relative to the start
    /// of the message.
    pub(crate) fn alignment(&self) -> usize {
        match *self {
            Self::BYTE | Self::SIGNATURE | Self::VARIANT => 1,
            Self::INT16 | Self::UINT16 => 2,
            Self::BOOLEAN
            | Self::INT32
            | Self::UINT32
            | Self::UNIX_FD
            | Self::STRING
            | Self::OBJECT_PATH
            | Self::ARRAY => 4,
            Self::INT64
            | Self::UINT64
            | Self::DOUBLE
            | Self::OPEN_PAREN
            | Self::OPEN_BRACE => 8,
            _ => 1,
        }
    }

    /// Test if the type is a basic (non-container) type.
    pub(crate) const fn is_basic(&self) -> bool {
        matches!(
            *self,
            Self::BYTE
                | Self::BOOLEAN
                | Self::INT16
                | Self::UINT16
                | Self::INT32
                | Self::UINT32
                | Self::INT64
                | Self::UINT64
                | Self::DOUBLE
                | Self::STRING
                | Self::OBJECT_PATH
                | Self::SIGNATURE
                | Self::UNIX_FD
        )
    }
}
