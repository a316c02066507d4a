//! Conformance tests against a scripted server.
//!
//! Each test arms the mock server with one command over the control
//! channel, drives a client operation into the scripted reply, and
//! checks both the reported error and what is left of the session.

mod server;

use c9p::fcall::*;
use c9p::{Client, Error, Phase};
use std::net::TcpStream;

/// Run `version` into the scripted reply for `cmd`.
fn version_case(cmd: &str) -> (Client<TcpStream>, c9p::Result<u32>) {
    let mut srv = server::spawn();
    srv.command(cmd);
    let mut nine = Client::new(srv.connect());
    let res = nine.version(8192, P92000);
    (nine, res)
}

/// Version benignly, then run `attach` into the scripted reply.
fn attach_case(cmd: &str) -> (Client<TcpStream>, c9p::Result<(u32, QId)>) {
    let mut srv = server::spawn();
    srv.command(cmd);
    let mut nine = Client::new(srv.connect());
    nine.version(8192, P92000).unwrap();
    let res = nine.attach("testuser", "");
    (nine, res)
}

/// Version and attach benignly, then run `stat` into the scripted reply.
fn stat_case(cmd: &str) -> (Client<TcpStream>, c9p::Result<Stat>) {
    let mut srv = server::spawn();
    srv.command(cmd);
    let mut nine = Client::new(srv.connect());
    nine.version(8192, P92000).unwrap();
    let (root, _) = nine.attach("testuser", "").unwrap();
    let res = nine.stat(root);
    (nine, res)
}

#[test]
fn header_too_short1() {
    let (nine, res) = version_case("header_too_short1");
    assert!(matches!(res, Err(Error::ShortHeader(1))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn header_too_short2() {
    let (nine, res) = version_case("header_too_short2");
    assert!(matches!(res, Err(Error::ShortHeader(6))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn header_too_large() {
    let (nine, res) = version_case("header_too_large");
    assert!(matches!(res, Err(Error::Truncated { size: 42, .. })));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn header_wrong_type() {
    let (nine, res) = version_case("header_wrong_type");
    assert!(matches!(res, Err(Error::Protocol(_))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn header_invalid_type() {
    let (nine, res) = version_case("header_invalid_type");
    assert!(matches!(res, Err(Error::UnknownType(0xff))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn header_tag_mismatch() {
    let (nine, res) = version_case("header_tag_mismatch");
    assert!(matches!(res, Err(Error::TagMismatch { want: NOTAG, .. })));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn header_type_mismatch() {
    let (nine, res) = attach_case("header_type_mismatch");
    assert!(matches!(res, Err(Error::Protocol(_))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn rversion_success() {
    let (nine, res) = version_case("rversion_success");
    assert_eq!(res.unwrap(), 8192);
    assert_eq!(nine.phase(), Phase::Versioned);
    assert_eq!(nine.msize(), 8192);
}

#[test]
fn rversion_unknown() {
    let (nine, res) = version_case("rversion_unknown");
    assert!(matches!(res, Err(Error::VersionUnsupported(_))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn rversion_msize_too_big() {
    let (nine, res) = version_case("rversion_msize_too_big");
    assert!(matches!(res, Err(Error::Protocol(_))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn rversion_invalid() {
    let (nine, res) = version_case("rversion_invalid");
    assert!(matches!(res, Err(Error::VersionUnsupported(_))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn rversion_invalid_len() {
    let (nine, res) = version_case("rversion_invalid_len");
    assert!(matches!(res, Err(Error::MalformedBody(MsgType::RVersion))));
    assert_eq!(nine.phase(), Phase::Closed);
}

// The codec has no static version buffer, so the over-long string
// parses; negotiation then refuses it as a version this client does
// not speak.
#[test]
fn rversion_version_too_long() {
    let (nine, res) = version_case("rversion_version_too_long");
    assert!(matches!(res, Err(Error::VersionUnsupported(v)) if v == "12345678"));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn rattach_success() {
    let (nine, res) = attach_case("rattach_success");
    let (root, qid) = res.unwrap();
    assert_eq!(root, 0);
    assert_eq!(qid, QId::default());
    assert_eq!(nine.phase(), Phase::Attached);
}

#[test]
fn rattach_invalid_len() {
    let (nine, res) = attach_case("rattach_invalid_len");
    assert!(matches!(res, Err(Error::MalformedBody(MsgType::RAttach))));
    assert_eq!(nine.phase(), Phase::Closed);
}

#[test]
fn rstat_success() {
    let (nine, res) = stat_case("rstat_success");
    assert_eq!(res.unwrap(), server::seed_stat());
    assert_eq!(nine.phase(), Phase::Attached);
}

#[test]
fn rstat_nstat_invalid() {
    let (nine, res) = stat_case("rstat_nstat_invalid");
    assert!(matches!(res, Err(Error::MalformedBody(MsgType::RStat))));
    assert_eq!(nine.phase(), Phase::Closed);
}
