use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use super::{ObjectPath, ObjectPathError};

/// An owned validated D-Bus object path.
///
/// This is the owned variant of [`ObjectPath`], and dereferences to it.
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct ObjectPathBuf(String);

impl ObjectPathBuf {
    /// Construct a new validated owned object path.
    pub fn new(path: &str) -> Result<Self, ObjectPathError> {
        Ok(ObjectPath::new(path)?.to_owned())
    }

    #[inline]
    pub(crate) fn from_path(path: &ObjectPath) -> Self {
        Self(path.as_str().to_owned())
    }

    /// Convert into the inner string.
    #[inline]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for ObjectPathBuf {
    type Target = ObjectPath;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the contents were validated at construction.
        unsafe { ObjectPath::new_unchecked(&self.0) }
    }
}

impl Borrow<ObjectPath> for ObjectPathBuf {
    #[inline]
    fn borrow(&self) -> &ObjectPath {
        self
    }
}

impl AsRef<ObjectPath> for ObjectPathBuf {
    #[inline]
    fn as_ref(&self) -> &ObjectPath {
        self
    }
}

impl From<&ObjectPath> for ObjectPathBuf {
    #[inline]
    fn from(path: &ObjectPath) -> Self {
        path.to_owned()
    }
}

impl fmt::Debug for ObjectPathBuf {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for ObjectPathBuf {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<ObjectPath> for ObjectPathBuf {
    #[inline]
    fn eq(&self, other: &ObjectPath) -> bool {
        **self == *other
    }
}

impl PartialEq<str> for ObjectPathBuf {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}
