use super::{parse_response, uid_ascii_hex, Response};

#[test]
fn test_uid_ascii_hex() {
    assert_eq!(uid_ascii_hex(1000), "31303030");
    assert_eq!(uid_ascii_hex(0), "30");
    assert_eq!(uid_ascii_hex(u32::MAX), "34323934393637323935");
}

#[test]
fn test_parse_response() {
    assert_eq!(parse_response(b"OK abcdef\r\n").unwrap(), Response::Ok);

    assert_eq!(
        parse_response(b"REJECTED EXTERNAL DBUS_COOKIE_SHA1 ANONYMOUS\r\n").unwrap(),
        Response::Rejected(vec![
            "EXTERNAL".to_owned(),
            "DBUS_COOKIE_SHA1".to_owned(),
            "ANONYMOUS".to_owned()
        ])
    );

    assert_eq!(
        parse_response(b"REJECTED\r\n").unwrap(),
        Response::Rejected(Vec::new())
    );

    assert!(parse_response(b"DATA deadbeef\r\n").is_err());
}
