use super::{Signature, SignatureErrorKind};

use SignatureErrorKind::*;

macro_rules! test {
    ($input:expr, $expected:pat) => {{
        let actual = Signature::new($input).map_err(|e| e.kind);

        assert!(
            matches!(actual, $expected),
            "{actual:?} does not match {}",
            stringify!($expected)
        );
    }};
}

#[test]
fn signature_tests() {
    test!(b"", Ok(..));
    test!(b"sss", Ok(..));
    test!(b"i", Ok(..));
    test!(b"b", Ok(..));
    test!(b"ai", Ok(..));
    test!(b"(i)", Ok(..));
    test!(b"a{sv}", Ok(..));
    test!(b"aa{s(iv)}x", Ok(..));
    test!(b"yyyyuua(yv)", Ok(..));
    test!(b"w", Err(UnknownTypeCode(..)));
    test!(b"a", Err(MissingArrayElementType));
    test!(b"aaaaaa", Err(MissingArrayElementType));
    test!(b"ii(ii)a", Err(MissingArrayElementType));
    test!(b"ia", Err(MissingArrayElementType));
    test!(b"a)", Err(MissingArrayElementType));
    test!(b"(a)", Err(MissingArrayElementType));
    test!(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaai", Ok(..));
    test!(
        b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaai",
        Err(ExceededMaximumRecursion)
    );
    test!(b")", Err(UnexpectedClose(..)));
    test!(b"}", Err(UnexpectedClose(..)));
    test!(b"i)", Err(UnexpectedClose(..)));
    test!(b"(", Err(UnterminatedContainer));
    test!(b"(i", Err(UnterminatedContainer));
    test!(b"(iiiii", Err(UnterminatedContainer));
    test!(b"(ai", Err(UnterminatedContainer));
    test!(b"a{i", Err(UnterminatedContainer));
    test!(b"a{is", Err(UnterminatedContainer));
    test!(b"()", Err(StructHasNoFields));
    test!(b"(())", Err(StructHasNoFields));
    test!(b"a()", Err(StructHasNoFields));
    test!(b"i()", Err(StructHasNoFields));
    test!(b"()i", Err(StructHasNoFields));
    test!(b"a{}", Err(DictEntryShape));
    test!(b"a{i}", Err(DictEntryShape));
    test!(b"a{iii}", Err(DictEntryShape));
    test!(b"a{aii}", Err(DictKeyMustBeBasicType));
    test!(b"a{(ii)i}", Err(DictKeyMustBeBasicType));
    test!(b"a{vi}", Err(DictKeyMustBeBasicType));
    test!(b"{is}", Err(DictEntryNotInsideArray));
    test!(b" ", Err(UnknownTypeCode(..)));
    test!(b"not a valid signature", Err(UnknownTypeCode(..)));
    test!(b"123", Err(UnknownTypeCode(..)));
}

#[test]
fn split_first() {
    fn split(signature: &[u8]) -> (&str, &str) {
        let (element, rest) = Signature::new(signature).unwrap().split_first().unwrap();
        (element.as_str(), rest.as_str())
    }

    assert_eq!(split(b"y"), ("y", ""));
    assert_eq!(split(b"yy"), ("y", "y"));
    assert_eq!(split(b"yyy"), ("y", "yy"));
    assert_eq!(split(b"ay"), ("ay", ""));
    assert_eq!(split(b"ayy"), ("ay", "y"));
    assert_eq!(split(b"yay"), ("y", "ay"));
    assert_eq!(split(b"a(ii)"), ("a(ii)", ""));
    assert_eq!(split(b"a(ii)i"), ("a(ii)", "i"));
    assert_eq!(split(b"aaii"), ("aai", "i"));
    assert_eq!(split(b"aa(ai(yay)i)i"), ("aa(ai(yay)i)", "i"));
    assert_eq!(split(b"a{sv}u"), ("a{sv}", "u"));
    assert!(Signature::EMPTY.split_first().is_none());
}

#[test]
fn iter_concatenation() {
    let sig = Signature::new(b"yyyyuua(yv)").unwrap();
    let mut concatenated = String::new();

    for element in sig.iter() {
        concatenated.push_str(element.as_str());
    }

    assert_eq!(concatenated, sig.as_str());
    assert_eq!(sig.iter().count(), 7);
}

#[test]
fn single_complete() {
    assert!(Signature::new_const(b"a{sv}").ensure_single_complete().is_ok());
    assert!(Signature::new_const(b"ii").ensure_single_complete().is_err());
    assert!(Signature::EMPTY.ensure_single_complete().is_err());
}
