//! Serialize/deserialize 9P messages into/from binary.

use crate::error::Error;
use crate::fcall::*;
use crate::utils::Result;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{self};
use std::mem;
use std::ops::{Deref, Shl};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode($decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(crate::utils::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Bounded cursor over a received message body.
///
/// Every read checks the remaining length first, so a hostile length
/// field can never pull bytes from outside the declared region or force
/// an allocation larger than it.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::ShortBuffer);
        }
        let chunk = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(chunk)
    }
}

/// Fixed-capacity scratch buffer for outgoing frames.
///
/// Appends past the capacity fail with `BufferFull` instead of growing.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    cap: usize,
}

impl Buffer {
    pub fn with_capacity(cap: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Change the capacity, e.g. after msize negotiation.
    pub fn set_capacity(&mut self, cap: usize) {
        self.cap = cap;
        self.data.truncate(cap);
    }

    fn patch_size(&mut self, size: u32) {
        LittleEndian::write_u32(&mut self.data[..4], size);
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.data.len() + buf.len() > self.cap {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer full"));
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self)
            .map_err(|_| Error::BufferFull)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .map_err(|_| Error::BufferFull)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .map_err(|_| Error::BufferFull)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .map_err(|_| Error::BufferFull)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return Err(Error::StringTooLong(self.len()));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w
            .write_all(self.as_bytes())
            .map_err(|_| Error::BufferFull)
            .and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0).map_err(|_| Error::BufferFull)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(r.bytes(1)?[0])
    }
}

impl Decodable for u16 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(LittleEndian::read_u16(r.bytes(2)?))
    }
}

impl Decodable for u32 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(LittleEndian::read_u32(r.bytes(4)?))
    }
}

impl Decodable for u64 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(LittleEndian::read_u64(r.bytes(8)?))
    }
}

impl Decodable for String {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        if len as usize > r.remaining() {
            return Err(Error::StringTooLong(len as usize));
        }
        String::from_utf8(r.bytes(len as usize)?.to_vec())
            .map_err(|_| Error::Protocol("string is not valid utf-8"))
    }
}

impl Decodable for QId {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, r),
            version: decode!(r),
            path: decode!(r),
        })
    }
}

impl Decodable for Stat {
    // A stat record is self-delimiting: the inner size field must agree
    // with the bytes its fields actually occupy. Records may follow one
    // another in a directory read, so the check is on consumption, not
    // on the buffer end.
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        if size as usize > r.remaining() {
            return Err(Error::ShortBuffer);
        }
        let before = r.remaining();
        let stat = Stat {
            typ: decode!(r),
            dev: decode!(r),
            qid: decode!(r),
            mode: decode!(r),
            atime: decode!(r),
            mtime: decode!(r),
            length: decode!(r),
            name: decode!(r),
            uid: decode!(r),
            gid: decode!(r),
            muid: decode!(r),
        };
        if before - r.remaining() != size as usize {
            return Err(Error::Protocol("stat size field disagrees with its fields"));
        }
        Ok(stat)
    }
}

impl Decodable for Data {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(r.bytes(len as usize)?.to_vec()))
    }
}

// Repeated elements only occur in walk messages; both the name list and
// the qid list are capped at MAXWELEM.
impl<T: Decodable> Decodable for Vec<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        if len as usize > MAXWELEM {
            return Err(Error::Protocol("element count exceeds MAXWELEM"));
        }
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Marshal `msg` as a complete frame, `size[4] type[1] tag[2] body`,
/// into `buf`. The size field is patched in last; a frame that would
/// exceed `msize` fails with `Oversize`.
pub fn write_msg(buf: &mut Buffer, msg: &Msg, msize: u32) -> Result<usize> {
    use crate::FCall::*;

    buf.clear();
    let typ = MsgType::from(&msg.body);
    let out = Encoder::new(&mut *buf) << &0u32 << &(typ as u8) << &msg.tag;

    let out = match msg.body {
        TVersion {
            ref msize,
            ref version,
        } => out << msize << version,
        RVersion {
            ref msize,
            ref version,
        } => out << msize << version,
        TAuth {
            ref afid,
            ref uname,
            ref aname,
        } => out << afid << uname << aname,
        RAuth { ref aqid } => out << aqid,
        TAttach {
            ref fid,
            ref afid,
            ref uname,
            ref aname,
        } => out << fid << afid << uname << aname,
        RAttach { ref qid } => out << qid,
        RError { ref ename } => out << ename,
        TFlush { ref oldtag } => out << oldtag,
        RFlush => out,
        TWalk {
            ref fid,
            ref newfid,
            ref wnames,
        } => out << fid << newfid << wnames,
        RWalk { ref wqids } => out << wqids,
        TOpen { ref fid, ref mode } => out << fid << mode,
        ROpen {
            ref qid,
            ref iounit,
        } => out << qid << iounit,
        TCreate {
            ref fid,
            ref name,
            ref perm,
            ref mode,
        } => out << fid << name << perm << mode,
        RCreate {
            ref qid,
            ref iounit,
        } => out << qid << iounit,
        TRead {
            ref fid,
            ref offset,
            ref count,
        } => out << fid << offset << count,
        RRead { ref data } => out << data,
        TWrite {
            ref fid,
            ref offset,
            ref data,
        } => out << fid << offset << data,
        RWrite { ref count } => out << count,
        TClunk { ref fid } => out << fid,
        RClunk => out,
        TRemove { ref fid } => out << fid,
        RRemove => out,
        TStat { ref fid } => out << fid,
        RStat { ref stat } => out << &(stat.size() + 2) << stat,
        TWStat { ref fid, ref stat } => out << fid << &(stat.size() + 2) << stat,
        RWStat => out,
    };

    match out {
        SResult(Ok(_)) => {}
        SResult(Err(e)) => return Err(e),
    }

    let size = buf.len() as u32;
    if size > msize {
        return Err(Error::Oversize { size, msize });
    }
    buf.patch_size(size);
    Ok(size as usize)
}

/// Unmarshal one message from a frame with the size field already
/// stripped (`type[1] tag[2] body`).
///
/// The caller has validated the outer size field against the negotiated
/// msize and the bytes actually received. The body must consume the
/// region exactly; underruns, string overruns and leftover bytes are
/// all reported as `MalformedBody`.
pub fn read_msg(buf: &[u8]) -> Result<Msg> {
    let mut r = Reader::new(buf);
    let byte: u8 = Decodable::decode(&mut r)?;
    let typ = MsgType::from_u8(byte).ok_or(Error::UnknownType(byte))?;
    let tag: u16 = Decodable::decode(&mut r)?;
    let body = decode_body(typ, &mut r).map_err(|e| match e {
        Error::ShortBuffer | Error::StringTooLong(_) | Error::Protocol(_) => {
            Error::MalformedBody(typ)
        }
        other => other,
    })?;
    if r.remaining() != 0 {
        return Err(Error::MalformedBody(typ));
    }
    Ok(Msg { tag, body })
}

fn decode_body(typ: MsgType, r: &mut Reader<'_>) -> Result<FCall> {
    use crate::MsgType::*;

    Ok(match typ {
        TVersion => FCall::TVersion {
            msize: decode!(r),
            version: decode!(r),
        },
        RVersion => FCall::RVersion {
            msize: decode!(r),
            version: decode!(r),
        },
        TAuth => FCall::TAuth {
            afid: decode!(r),
            uname: decode!(r),
            aname: decode!(r),
        },
        RAuth => FCall::RAuth { aqid: decode!(r) },
        TAttach => FCall::TAttach {
            fid: decode!(r),
            afid: decode!(r),
            uname: decode!(r),
            aname: decode!(r),
        },
        RAttach => FCall::RAttach { qid: decode!(r) },
        RError => FCall::RError { ename: decode!(r) },
        TFlush => FCall::TFlush { oldtag: decode!(r) },
        RFlush => FCall::RFlush,
        TWalk => FCall::TWalk {
            fid: decode!(r),
            newfid: decode!(r),
            wnames: decode!(r),
        },
        RWalk => FCall::RWalk { wqids: decode!(r) },
        TOpen => FCall::TOpen {
            fid: decode!(r),
            mode: decode!(r),
        },
        ROpen => FCall::ROpen {
            qid: decode!(r),
            iounit: decode!(r),
        },
        TCreate => FCall::TCreate {
            fid: decode!(r),
            name: decode!(r),
            perm: decode!(r),
            mode: decode!(r),
        },
        RCreate => FCall::RCreate {
            qid: decode!(r),
            iounit: decode!(r),
        },
        TRead => FCall::TRead {
            fid: decode!(r),
            offset: decode!(r),
            count: decode!(r),
        },
        RRead => FCall::RRead { data: decode!(r) },
        TWrite => FCall::TWrite {
            fid: decode!(r),
            offset: decode!(r),
            data: decode!(r),
        },
        RWrite => FCall::RWrite { count: decode!(r) },
        TClunk => FCall::TClunk { fid: decode!(r) },
        RClunk => FCall::RClunk,
        TRemove => FCall::TRemove { fid: decode!(r) },
        RRemove => FCall::RRemove,
        TStat => FCall::TStat { fid: decode!(r) },
        RStat => {
            let nstat: u16 = decode!(r);
            if nstat as usize != r.remaining() {
                return Err(Error::Protocol("nstat disagrees with message size"));
            }
            FCall::RStat { stat: decode!(r) }
        }
        TWStat => {
            let fid = decode!(r);
            let nstat: u16 = decode!(r);
            if nstat as usize != r.remaining() {
                return Err(Error::Protocol("nstat disagrees with message size"));
            }
            FCall::TWStat {
                fid,
                stat: decode!(r),
            }
        }
        RWStat => FCall::RWStat,
    })
}

#[cfg(test)]
fn frame(msg: &Msg) -> Vec<u8> {
    let mut buf = Buffer::with_capacity(1 << 16);
    write_msg(&mut buf, msg, 1 << 16).unwrap();
    buf.to_vec()
}

#[cfg(test)]
fn seed_stat() -> Stat {
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

#[test]
fn size_field_matches_bytes_written() {
    let msg = Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    let buf = frame(&msg);
    assert_eq!(LittleEndian::read_u32(&buf[..4]) as usize, buf.len());
    // size[4] type[1] tag[2] msize[4] version[2 + 6]
    assert_eq!(buf.len(), 19);
}

#[test]
fn representative_messages_round_trip() {
    let msgs = vec![
        Msg {
            tag: 0xdead,
            body: FCall::RVersion {
                msize: 40,
                version: P92000.to_owned(),
            },
        },
        Msg {
            tag: 1,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["usr".to_owned(), "glenda".to_owned()],
            },
        },
        Msg {
            tag: 2,
            body: FCall::RWalk {
                wqids: vec![QId::default(), seed_stat().qid],
            },
        },
        Msg {
            tag: 3,
            body: FCall::TWrite {
                fid: 7,
                offset: 512,
                data: Data(b"hello, plan 9".to_vec()),
            },
        },
        Msg {
            tag: 4,
            body: FCall::RError {
                ename: "permission denied".to_owned(),
            },
        },
        Msg {
            tag: 5,
            body: FCall::RStat { stat: seed_stat() },
        },
        Msg {
            tag: 6,
            body: FCall::TWStat {
                fid: 9,
                stat: seed_stat(),
            },
        },
        Msg {
            tag: 7,
            body: FCall::RClunk,
        },
    ];
    for expected in msgs {
        let buf = frame(&expected);
        let actual = read_msg(&buf[4..]).unwrap();
        assert_eq!(expected, actual);
    }
}

#[test]
fn seed_stat_has_documented_wire_size() {
    let msg = Msg {
        tag: 1,
        body: FCall::RStat { stat: seed_stat() },
    };
    // size[4] type[1] tag[2] nstat[2] size[2] + 75 stat bytes
    assert_eq!(frame(&msg).len(), 86);
}

#[test]
fn oversize_frame_is_rejected_on_marshal() {
    let mut buf = Buffer::with_capacity(1 << 16);
    let msg = Msg {
        tag: 1,
        body: FCall::TRead {
            fid: 0,
            offset: 0,
            count: 128,
        },
    };
    assert!(matches!(
        write_msg(&mut buf, &msg, 10),
        Err(Error::Oversize { size: 23, msize: 10 })
    ));
}

#[test]
fn buffer_refuses_appends_past_capacity() {
    let mut buf = Buffer::with_capacity(4);
    assert!(0u32.encode(&mut buf).is_ok());
    assert!(matches!(0u8.encode(&mut buf), Err(Error::BufferFull)));
}

#[test]
fn reader_bounds_the_primitives() {
    let mut r = Reader::new(&[1, 2]);
    let byte: u8 = Decodable::decode(&mut r).unwrap();
    assert_eq!(byte, 1);
    assert!(matches!(
        <u32 as Decodable>::decode(&mut r),
        Err(Error::ShortBuffer)
    ));

    // A string prefix claiming more bytes than the region holds.
    let mut r = Reader::new(&[10, 0, b'a', b'b', b'c']);
    assert!(matches!(
        <String as Decodable>::decode(&mut r),
        Err(Error::StringTooLong(10))
    ));
}

#[test]
fn undefined_type_is_rejected() {
    // 106 is the never-used Terror slot.
    assert!(matches!(read_msg(&[106, 0, 0]), Err(Error::UnknownType(106))));
}

#[test]
fn leftover_body_bytes_are_malformed() {
    let mut buf = frame(&Msg {
        tag: 1,
        body: FCall::RClunk,
    });
    buf.push(0);
    assert!(matches!(
        read_msg(&buf[4..]),
        Err(Error::MalformedBody(MsgType::RClunk))
    ));
}

#[test]
fn truncated_string_body_is_malformed() {
    let buf = frame(&Msg {
        tag: NOTAG,
        body: FCall::RVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    });
    // Drop the last version byte; the string prefix now overruns.
    assert!(matches!(
        read_msg(&buf[4..buf.len() - 1]),
        Err(Error::MalformedBody(MsgType::RVersion))
    ));
}

#[test]
fn nstat_mismatch_is_malformed() {
    let mut buf = frame(&Msg {
        tag: 1,
        body: FCall::RStat { stat: seed_stat() },
    });
    // nstat sits right after size[4] type[1] tag[2].
    LittleEndian::write_u16(&mut buf[7..9], 1337);
    assert!(matches!(
        read_msg(&buf[4..]),
        Err(Error::MalformedBody(MsgType::RStat))
    ));
}

#[test]
fn walk_lists_are_capped_at_maxwelem() {
    let mut buf = frame(&Msg {
        tag: 1,
        body: FCall::RWalk { wqids: Vec::new() },
    });
    // Claim 17 qids without providing them.
    LittleEndian::write_u16(&mut buf[7..9], 17);
    assert!(matches!(
        read_msg(&buf[4..]),
        Err(Error::MalformedBody(MsgType::RWalk))
    ));
}

#[test]
fn consecutive_stats_decode_from_one_region() {
    let first = seed_stat();
    let second = Stat {
        name: "other".to_owned(),
        ..seed_stat()
    };
    let mut buf = Buffer::with_capacity(1 << 16);
    first.encode(&mut buf).unwrap();
    second.encode(&mut buf).unwrap();

    let mut r = Reader::new(&buf);
    let a: Stat = Decodable::decode(&mut r).unwrap();
    let b: Stat = Decodable::decode(&mut r).unwrap();
    assert_eq!(a, first);
    assert_eq!(b, second);
    assert_eq!(r.remaining(), 0);
}
