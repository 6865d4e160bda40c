use std::error;
use std::fmt;

use crate::proto::Type;

/// An error raised when validation of a [`Signature`] fails.
///
/// [`Signature`]: crate::Signature
#[derive(Debug, PartialEq, Eq)]
pub struct SignatureError {
    pub(crate) kind: SignatureErrorKind,
}

impl SignatureError {
    #[inline]
    pub(crate) const fn new(kind: SignatureErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SignatureErrorKind {
    UnknownTypeCode(Type),
    SignatureTooLong,
    MissingArrayElementType,
    /// Input ended inside a struct or dict entry.
    UnterminatedContainer,
    /// A closing bracket with no open container.
    UnexpectedClose(Type),
    StructHasNoFields,
    DictKeyMustBeBasicType,
    /// A dict entry without exactly one key and one value.
    DictEntryShape,
    /// A dict entry outside an array position.
    DictEntryNotInsideArray,
    ExceededMaximumRecursion,
    /// A variant signature must contain exactly one complete type.
    NotSingleComplete,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SignatureErrorKind::*;

        match &self.kind {
            UnknownTypeCode(ty) => write!(f, "unknown type code {ty:?}"),
            SignatureTooLong => write!(f, "signature is longer than 255 bytes"),
            MissingArrayElementType => write!(f, "array is missing element type"),
            UnterminatedContainer => write!(f, "container started but not ended"),
            UnexpectedClose(ty) => write!(f, "{ty:?} closes nothing"),
            StructHasNoFields => write!(f, "struct has no fields"),
            DictKeyMustBeBasicType => write!(f, "dict key must be a basic type"),
            DictEntryShape => write!(f, "dict entry must hold a key and one value"),
            DictEntryNotInsideArray => write!(f, "dict entry not inside of array"),
            ExceededMaximumRecursion => write!(f, "exceeded maximum container recursion"),
            NotSingleComplete => write!(f, "not a single complete type"),
        }
    }
}

impl error::Error for SignatureError {}
