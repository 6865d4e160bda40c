//! Signature validation by recursive descent over the type grammar.
//!
//! A signature is a run of complete types. A complete type is a basic code,
//! a variant, `a` followed by a complete type or a `{KV}` dict entry, or a
//! parenthesized non-empty run of complete types. Array and struct nesting
//! are bounded separately at [`MAX_CONTAINER_DEPTH`], which also bounds the
//! recursion here.

use crate::proto::Type;

use super::{SignatureError, SignatureErrorKind, MAX_CONTAINER_DEPTH};

pub(crate) const fn validate(bytes: &[u8]) -> Result<(), SignatureError> {
    use SignatureErrorKind::*;

    if bytes.len() > u8::MAX as usize {
        return Err(SignatureError::new(SignatureTooLong));
    }

    let mut at = 0;

    while at < bytes.len() {
        at = match complete_type(bytes, at, 0, 0) {
            Ok(next) => next,
            Err(error) => return Err(error),
        };
    }

    Ok(())
}

/// Recognize one complete type starting at `at`, returning the position
/// just past it.
const fn complete_type(
    bytes: &[u8],
    at: usize,
    arrays: usize,
    structs: usize,
) -> Result<usize, SignatureError> {
    use SignatureErrorKind::*;

    let t = Type::new(bytes[at]);

    if t.is_basic() || matches!(t, Type::VARIANT) {
        return Ok(at + 1);
    }

    match t {
        Type::ARRAY => {
            if arrays == MAX_CONTAINER_DEPTH {
                return Err(SignatureError::new(ExceededMaximumRecursion));
            }

            let element = at + 1;

            if element >= bytes.len() {
                return Err(SignatureError::new(MissingArrayElementType));
            }

            match bytes[element] {
                b'{' => dict_entry(bytes, element, arrays + 1, structs),
                b')' | b'}' => Err(SignatureError::new(MissingArrayElementType)),
                _ => complete_type(bytes, element, arrays + 1, structs),
            }
        }
        Type::OPEN_PAREN => {
            if structs == MAX_CONTAINER_DEPTH {
                return Err(SignatureError::new(ExceededMaximumRecursion));
            }

            let mut field = at + 1;
            let mut fields = 0;

            loop {
                if field >= bytes.len() {
                    return Err(SignatureError::new(UnterminatedContainer));
                }

                if bytes[field] == b')' {
                    if fields == 0 {
                        return Err(SignatureError::new(StructHasNoFields));
                    }

                    return Ok(field + 1);
                }

                field = match complete_type(bytes, field, arrays, structs + 1) {
                    Ok(next) => next,
                    Err(error) => return Err(error),
                };

                fields += 1;
            }
        }
        Type::OPEN_BRACE => Err(SignatureError::new(DictEntryNotInsideArray)),
        Type::CLOSE_PAREN | Type::CLOSE_BRACE => {
            Err(SignatureError::new(UnexpectedClose(t)))
        }
        t => Err(SignatureError::new(UnknownTypeCode(t))),
    }
}

/// Recognize a `{KV}` dict entry at `at` (the opening brace): one basic
/// key, one complete value, and the closing brace.
const fn dict_entry(
    bytes: &[u8],
    at: usize,
    arrays: usize,
    structs: usize,
) -> Result<usize, SignatureError> {
    use SignatureErrorKind::*;

    let key = at + 1;

    if key >= bytes.len() {
        return Err(SignatureError::new(UnterminatedContainer));
    }

    if bytes[key] == b'}' {
        return Err(SignatureError::new(DictEntryShape));
    }

    if !Type::new(bytes[key]).is_basic() {
        return Err(SignatureError::new(DictKeyMustBeBasicType));
    }

    let value = key + 1;

    if value >= bytes.len() {
        return Err(SignatureError::new(UnterminatedContainer));
    }

    if bytes[value] == b'}' {
        return Err(SignatureError::new(DictEntryShape));
    }

    let end = match complete_type(bytes, value, arrays, structs) {
        Ok(next) => next,
        Err(error) => return Err(error),
    };

    if end >= bytes.len() {
        return Err(SignatureError::new(UnterminatedContainer));
    }

    if bytes[end] != b'}' {
        return Err(SignatureError::new(DictEntryShape));
    }

    Ok(end + 1)
}
