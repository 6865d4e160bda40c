use std::fmt;
use std::str::from_utf8_unchecked;

use crate::proto::Type;

use super::{validate, Iter, SignatureBuf, SignatureError, SignatureErrorKind};

/// A D-Bus type signature.
///
/// A signature is a sequence of complete element types over the D-Bus type
/// alphabet, such as `s`, `a(yv)` or `a{sv}`. This is the borrowed variant;
/// the owned variant is [`SignatureBuf`].
///
/// # Examples
///
/// ```
/// use busmux::Signature;
///
/// const SIG: &Signature = Signature::new_const(b"yyyyuua(yv)");
///
/// assert!(Signature::new(b"aai").is_ok());
/// assert!(Signature::new(b"a").is_err());
/// ```
#[derive(Hash, PartialEq, Eq)]
#[repr(transparent)]
pub struct Signature([u8]);

impl Signature {
    /// The empty signature.
    pub const EMPTY: &'static Signature = Signature::new_const(b"");

    /// A single string.
    pub const STRING: &'static Signature = Signature::new_const(b"s");

    /// A single object path.
    pub const OBJECT_PATH: &'static Signature = Signature::new_const(b"o");

    /// A single signature.
    pub const SIGNATURE: &'static Signature = Signature::new_const(b"g");

    /// A single 32-bit unsigned integer.
    pub const UINT32: &'static Signature = Signature::new_const(b"u");

    /// The full message signature: fixed prefix fields plus the header field
    /// array.
    pub(crate) const MESSAGE: &'static Signature = Signature::new_const(b"yyyyuua(yv)");

    /// Construct a new validated signature.
    pub fn new(signature: &[u8]) -> Result<&Signature, SignatureError> {
        validate(signature)?;
        // SAFETY: just validated.
        Ok(unsafe { Self::new_unchecked(signature) })
    }

    /// Construct a new signature from a string slice.
    pub fn from_str(signature: &str) -> Result<&Signature, SignatureError> {
        Self::new(signature.as_bytes())
    }

    /// Construct a signature at compile time, panicking if it is not valid.
    #[track_caller]
    pub const fn new_const(signature: &[u8]) -> &Signature {
        if matches!(validate(signature), Err(..)) {
            panic!("invalid signature");
        }

        // SAFETY: just validated.
        unsafe { Self::new_unchecked(signature) }
    }

    /// Construct a signature without validation.
    ///
    /// # Safety
    ///
    /// The bytes must be a valid signature.
    pub(crate) const unsafe fn new_unchecked(signature: &[u8]) -> &Signature {
        &*(signature as *const [u8] as *const Signature)
    }

    /// The signature as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The signature as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: signatures are a subset of ASCII.
        unsafe { from_utf8_unchecked(&self.0) }
    }

    /// The length of the signature in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Test if the signature is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The type code of the leading element.
    #[inline]
    pub(crate) fn code(&self) -> Type {
        match self.0.first() {
            Some(&b) => Type::new(b),
            None => Type::INVALID,
        }
    }

    /// Split off the first complete element type, returning it and the
    /// remainder.
    ///
    /// Concatenating the yielded element with the remainder reproduces the
    /// original signature.
    ///
    /// # Examples
    ///
    /// ```
    /// use busmux::Signature;
    ///
    /// let sig = Signature::new(b"aa(ai(yay)i)i")?;
    /// let (first, rest) = sig.split_first().unwrap();
    ///
    /// assert_eq!(first.as_str(), "aa(ai(yay)i)");
    /// assert_eq!(rest.as_str(), "i");
    /// # Ok::<_, busmux::SignatureError>(())
    /// ```
    pub fn split_first(&self) -> Option<(&Signature, &Signature)> {
        if self.0.is_empty() {
            return None;
        }

        let mut depth = 0usize;
        let mut n = 0;

        while n < self.0.len() {
            let b = self.0[n];
            n += 1;

            let term = match b {
                b'a' => false,
                b'(' | b'{' => {
                    depth += 1;
                    false
                }
                b')' | b'}' => {
                    depth -= 1;
                    true
                }
                _ => true,
            };

            if term && depth == 0 {
                break;
            }
        }

        let (head, tail) = self.0.split_at(n);

        // SAFETY: splitting a valid signature at a complete element boundary
        // yields valid signatures.
        unsafe {
            Some((
                Signature::new_unchecked(head),
                Signature::new_unchecked(tail),
            ))
        }
    }

    /// Test that the signature consists of exactly one complete element.
    pub(crate) fn ensure_single_complete(&self) -> Result<(), SignatureError> {
        match self.split_first() {
            Some((_, rest)) if rest.is_empty() => Ok(()),
            _ => Err(SignatureError::new(SignatureErrorKind::NotSingleComplete)),
        }
    }

    /// For an array element (`a<T>`), the signature of `<T>`.
    pub(crate) fn array_element(&self) -> &Signature {
        debug_assert!(self.code() == Type::ARRAY);
        // SAFETY: stripping the leading `a` of a valid array signature
        // leaves a valid signature.
        unsafe { Signature::new_unchecked(&self.0[1..]) }
    }

    /// For a struct (`(…)`) or dict entry (`{…}`) element, the signature of
    /// the field sequence between the brackets.
    pub(crate) fn container_fields(&self) -> &Signature {
        debug_assert!(matches!(self.code(), Type::OPEN_PAREN | Type::OPEN_BRACE));
        // SAFETY: the fields of a valid container are a valid signature.
        unsafe { Signature::new_unchecked(&self.0[1..self.0.len() - 1]) }
    }

    /// An iterator over the complete element types of the signature.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    /// The wire alignment of the leading element.
    #[inline]
    pub(crate) fn alignment(&self) -> usize {
        self.code().alignment()
    }
}

impl fmt::Debug for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<Signature> for Signature {
    #[inline]
    fn as_ref(&self) -> &Signature {
        self
    }
}

impl ToOwned for Signature {
    type Owned = SignatureBuf;

    #[inline]
    fn to_owned(&self) -> Self::Owned {
        SignatureBuf::from_signature(self)
    }
}

impl<'a> IntoIterator for &'a Signature {
    type Item = &'a Signature;
    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq<SignatureBuf> for Signature {
    #[inline]
    fn eq(&self, other: &SignatureBuf) -> bool {
        *self == **other
    }
}

impl PartialEq<Signature> for &Signature {
    #[inline]
    fn eq(&self, other: &Signature) -> bool {
        **self == *other
    }
}
