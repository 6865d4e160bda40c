use super::ObjectPath;

#[test]
fn validation() {
    assert!(ObjectPath::new("/").is_ok());
    assert!(ObjectPath::new("/org/freedesktop/DBus").is_ok());
    assert!(ObjectPath::new("/a_b/c0").is_ok());
    assert!(ObjectPath::new("").is_err());
    assert!(ObjectPath::new("relative").is_err());
    assert!(ObjectPath::new("/trailing/").is_err());
    assert!(ObjectPath::new("//double").is_err());
    assert!(ObjectPath::new("/with-dash").is_err());
    assert!(ObjectPath::new("/with space").is_err());
}

#[test]
fn segments() {
    let path = ObjectPath::new("/org/freedesktop/DBus").unwrap();
    let segments = path.segments().collect::<Vec<_>>();
    assert_eq!(segments, ["org", "freedesktop", "DBus"]);
}

#[test]
fn namespaces() {
    let path = ObjectPath::new("/a/b").unwrap();
    assert!(path.starts_with_namespace("/a"));
    assert!(path.starts_with_namespace("/a/b"));
    assert!(path.starts_with_namespace("/"));
    assert!(!path.starts_with_namespace("/a/b/c"));
    assert!(!path.starts_with_namespace("/ab"));
}
