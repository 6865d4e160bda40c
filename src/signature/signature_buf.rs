use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use super::{Signature, SignatureError};

/// An owned D-Bus type signature.
///
/// This is the owned variant of [`Signature`], and dereferences to it.
///
/// # Examples
///
/// ```
/// use busmux::{Signature, SignatureBuf};
///
/// let sig = SignatureBuf::from_str("a{sv}")?;
/// assert_eq!(&*sig, Signature::new(b"a{sv}")?);
/// # Ok::<_, busmux::SignatureError>(())
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct SignatureBuf(Vec<u8>);

impl SignatureBuf {
    /// The empty signature.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Construct a new validated owned signature.
    pub fn new(signature: &[u8]) -> Result<Self, SignatureError> {
        Ok(Signature::new(signature)?.to_owned())
    }

    /// Construct a new owned signature from a string slice.
    pub fn from_str(signature: &str) -> Result<Self, SignatureError> {
        Self::new(signature.as_bytes())
    }

    #[inline]
    pub(crate) fn from_signature(signature: &Signature) -> Self {
        Self(signature.as_bytes().to_vec())
    }
}

impl Deref for SignatureBuf {
    type Target = Signature;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the contents were validated at construction.
        unsafe { Signature::new_unchecked(&self.0) }
    }
}

impl Borrow<Signature> for SignatureBuf {
    #[inline]
    fn borrow(&self) -> &Signature {
        self
    }
}

impl AsRef<Signature> for SignatureBuf {
    #[inline]
    fn as_ref(&self) -> &Signature {
        self
    }
}

impl From<&Signature> for SignatureBuf {
    #[inline]
    fn from(signature: &Signature) -> Self {
        signature.to_owned()
    }
}

impl fmt::Debug for SignatureBuf {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for SignatureBuf {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<Signature> for SignatureBuf {
    #[inline]
    fn eq(&self, other: &Signature) -> bool {
        **self == *other
    }
}

impl PartialEq<&Signature> for SignatureBuf {
    #[inline]
    fn eq(&self, other: &&Signature) -> bool {
        **self == **other
    }
}
