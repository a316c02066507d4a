//! Scripted 9P server driven over a control channel.
//!
//! The harness writes a command name to the control socket; the server
//! then accepts one 9P connection, answers messages benignly until the
//! command's trigger type arrives, emits the scripted (often
//! deliberately damaged) reply and drops the connection. Reply frames
//! are built with the crate's own codec and then patched byte by byte
//! where a case calls for it.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

use byteorder::{ByteOrder, LittleEndian};
use c9p::fcall::*;
use c9p::serialize::{self, Buffer};

pub struct MockServer {
    addr: SocketAddr,
    ctl: TcpStream,
    handle: Option<JoinHandle<()>>,
}

pub fn spawn() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let ctl_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let ctl_addr = ctl_listener.local_addr().unwrap();

    let handle = thread::spawn(move || serve(listener, ctl_listener));
    let ctl = TcpStream::connect(ctl_addr).unwrap();

    MockServer {
        addr,
        ctl,
        handle: Some(handle),
    }
}

impl MockServer {
    /// Arm the next 9P connection with a scripted reply.
    pub fn command(&mut self, cmd: &str) {
        writeln!(self.ctl, "{}", cmd).unwrap();
    }

    pub fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).unwrap()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        let _ = self.ctl.shutdown(Shutdown::Both);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(listener: TcpListener, ctl_listener: TcpListener) {
    let (ctl, _) = ctl_listener.accept().unwrap();
    let mut ctl = BufReader::new(ctl);
    let mut line = String::new();

    loop {
        line.clear();
        if ctl.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let cmd = line.trim();
        let (reply, trigger) = lookup(cmd);

        let (mut conn, _) = listener.accept().unwrap();
        loop {
            let req = match read_request(&mut conn) {
                Some(req) => req,
                None => break,
            };
            if MsgType::from(&req.body) == trigger {
                conn.write_all(&reply(&req)).unwrap();
                // Drop the connection so short frames read as truncated.
                break;
            }
            conn.write_all(&frame(&benign(&req))).unwrap();
        }
    }
}

fn read_request(conn: &mut TcpStream) -> Option<Msg> {
    let mut header = [0u8; 4];
    conn.read_exact(&mut header).ok()?;
    let size = LittleEndian::read_u32(&header) as usize;
    let mut body = vec![0; size.checked_sub(4)?];
    conn.read_exact(&mut body).ok()?;
    serialize::read_msg(&body).ok()
}

type ReplyFn = fn(&Msg) -> Vec<u8>;

// Maps control commands to a reply builder and the request type that
// triggers it. Every command the harness writes needs an entry here.
fn lookup(cmd: &str) -> (ReplyFn, MsgType) {
    match cmd {
        "header_too_short1" => (header_too_short1, MsgType::TVersion),
        "header_too_short2" => (header_too_short2, MsgType::TVersion),
        "header_too_large" => (header_too_large, MsgType::TVersion),
        "header_wrong_type" => (header_wrong_type, MsgType::TVersion),
        "header_invalid_type" => (header_invalid_type, MsgType::TVersion),
        "header_tag_mismatch" => (header_tag_mismatch, MsgType::TVersion),
        "header_type_mismatch" => (header_type_mismatch, MsgType::TAttach),

        "rversion_success" => (rversion_success, MsgType::TVersion),
        "rversion_unknown" => (rversion_unknown, MsgType::TVersion),
        "rversion_msize_too_big" => (rversion_msize_too_big, MsgType::TVersion),
        "rversion_invalid" => (rversion_invalid, MsgType::TVersion),
        "rversion_invalid_len" => (rversion_invalid_len, MsgType::TVersion),
        "rversion_version_too_long" => (rversion_version_too_long, MsgType::TVersion),

        "rattach_success" => (rattach_success, MsgType::TAttach),
        "rattach_invalid_len" => (rattach_invalid_len, MsgType::TAttach),

        "rstat_success" => (rstat_success, MsgType::TStat),
        "rstat_nstat_invalid" => (rstat_nstat_invalid, MsgType::TStat),

        other => panic!("unknown control command {:?}", other),
    }
}

/// Answer anything on the way to the operation under test.
fn benign(req: &Msg) -> Msg {
    let body = match &req.body {
        FCall::TVersion { msize, version } => FCall::RVersion {
            msize: *msize,
            version: version.clone(),
        },
        FCall::TAttach { .. } => FCall::RAttach {
            qid: QId::default(),
        },
        FCall::TWalk { wnames, .. } => FCall::RWalk {
            wqids: vec![QId::default(); wnames.len()],
        },
        FCall::TClunk { .. } => FCall::RClunk,
        _ => FCall::RError {
            ename: "not scripted".to_owned(),
        },
    };
    Msg {
        tag: req.tag,
        body,
    }
}

fn frame(msg: &Msg) -> Vec<u8> {
    let mut buf = Buffer::with_capacity(1 << 16);
    serialize::write_msg(&mut buf, msg, 1 << 16).unwrap();
    buf.to_vec()
}

fn patch_size(frame: &mut [u8], size: u32) {
    LittleEndian::write_u32(&mut frame[..4], size);
}

/// The literal directory entry rstat_success serves.
pub fn seed_stat() -> Stat {
    Stat {
        typ: 9001,
        dev: 5,
        qid: QId {
            typ: QIdType::from_bits_truncate(23),
            version: 2342,
            path: 1337,
        },
        mode: dm::DIR,
        atime: 1494443596,
        mtime: 1494443609,
        length: 2342,
        name: "testfile".to_owned(),
        uid: "testuser".to_owned(),
        gid: "testgroup".to_owned(),
        muid: "ken".to_owned(),
    }
}

// A single byte: even shorter than the size field itself.
fn header_too_short1(_req: &Msg) -> Vec<u8> {
    vec![0]
}

// A size field too small to frame any 9P message.
fn header_too_short2(_req: &Msg) -> Vec<u8> {
    6u32.to_le_bytes().to_vec()
}

// A size field announcing far more bytes than will ever arrive.
fn header_too_large(_req: &Msg) -> Vec<u8> {
    42u32.to_le_bytes().to_vec()
}

// A well-formed frame carrying a T-message type.
fn header_wrong_type(req: &Msg) -> Vec<u8> {
    frame(&Msg {
        tag: req.tag,
        body: FCall::TVersion {
            msize: 0,
            version: String::new(),
        },
    })
}

// A type byte outside the defined enumeration.
fn header_invalid_type(req: &Msg) -> Vec<u8> {
    let mut buf = 7u32.to_le_bytes().to_vec();
    buf.push(0xff);
    buf.extend_from_slice(&req.tag.to_le_bytes());
    buf
}

// A valid Rversion under the wrong tag.
fn header_tag_mismatch(req: &Msg) -> Vec<u8> {
    let reply = benign(req);
    frame(&Msg {
        tag: req.tag.wrapping_add(1),
        body: reply.body,
    })
}

// A valid Rversion answering a Tattach.
fn header_type_mismatch(req: &Msg) -> Vec<u8> {
    frame(&Msg {
        tag: req.tag,
        body: FCall::RVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    })
}

// Echo msize and version back; always parses.
fn rversion_success(req: &Msg) -> Vec<u8> {
    frame(&benign(req))
}

// From version(5): a server that does not understand the version string
// answers Rversion with the 7 characters "unknown".
fn rversion_unknown(req: &Msg) -> Vec<u8> {
    let msize = tversion_msize(req);
    frame(&Msg {
        tag: req.tag,
        body: FCall::RVersion {
            msize,
            version: VERSION_UNKNOWN.to_owned(),
        },
    })
}

// From version(5): the server's msize must be less than or equal to the
// client's. Offer one more.
fn rversion_msize_too_big(req: &Msg) -> Vec<u8> {
    let msize = tversion_msize(req);
    frame(&Msg {
        tag: req.tag,
        body: FCall::RVersion {
            msize: msize + 1,
            version: P92000.to_owned(),
        },
    })
}

// A version string that is not any 9P protocol.
fn rversion_invalid(req: &Msg) -> Vec<u8> {
    let msize = tversion_msize(req);
    frame(&Msg {
        tag: req.tag,
        body: FCall::RVersion {
            msize,
            version: "9P20009P2000".to_owned(),
        },
    })
}

// A size field one byte short, so the version string overruns the frame.
fn rversion_invalid_len(req: &Msg) -> Vec<u8> {
    let mut buf = frame(&benign(req));
    let short = buf.len() as u32 - 1;
    patch_size(&mut buf, short);
    buf
}

// One byte longer than the longest meaningful version string "unknown";
// clients with a static version buffer may reject it.
fn rversion_version_too_long(req: &Msg) -> Vec<u8> {
    let msize = tversion_msize(req);
    frame(&Msg {
        tag: req.tag,
        body: FCall::RVersion {
            msize,
            version: "12345678".to_owned(),
        },
    })
}

fn rattach_success(req: &Msg) -> Vec<u8> {
    frame(&benign(req))
}

// A size field one byte short, truncating the qid.
fn rattach_invalid_len(req: &Msg) -> Vec<u8> {
    let mut buf = frame(&benign(req));
    let short = buf.len() as u32 - 1;
    patch_size(&mut buf, short);
    buf
}

fn rstat_success(req: &Msg) -> Vec<u8> {
    frame(&Msg {
        tag: req.tag,
        body: FCall::RStat { stat: seed_stat() },
    })
}

// A two-byte nstat claiming far more stat bytes than the frame holds.
fn rstat_nstat_invalid(req: &Msg) -> Vec<u8> {
    let mut buf = frame(&Msg {
        tag: req.tag,
        body: FCall::RStat {
            stat: Stat::default(),
        },
    });
    LittleEndian::write_u16(&mut buf[7..9], 1337);
    buf
}

fn tversion_msize(req: &Msg) -> u32 {
    match req.body {
        FCall::TVersion { msize, .. } => msize,
        _ => panic!("trigger is not a Tversion"),
    }
}
