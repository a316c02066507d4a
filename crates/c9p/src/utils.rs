use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

/// Split a dial string of the form `proto!address!port`.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

#[test]
fn parse_proto_splits_three_parts() {
    assert_eq!(parse_proto("tcp!127.0.0.1!564"), Some(("tcp", "127.0.0.1", "564")));
    assert_eq!(parse_proto("unix!/tmp/sock!0"), Some(("unix", "/tmp/sock", "0")));
    assert_eq!(parse_proto("tcp!127.0.0.1"), None);
}
