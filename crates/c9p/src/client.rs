//! Synchronous client side 9P library.
//!
//! # Protocol
//! 9P2000

use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use byteorder::{ByteOrder, LittleEndian};
use log::{error, info};

use crate::error::Error;
use crate::fcall::*;
use crate::ids::{FidPool, TagPool};
use crate::serialize::{self, Buffer};
use crate::utils::Result;

/// Open-mode bits a client may set: an access mode in the low bits plus
/// OTRUNC and ORCLOSE.
const MODE_MASK: u8 = 0x03 | om::TRUNC | om::RCLOSE;

/// Reliable ordered byte stream carrying a 9P session.
///
/// The client does its own framing; implementations only move bytes.
/// Both transfer calls block until at least one byte moved or the peer
/// went away.
pub trait Transport {
    /// Write a prefix of `buf`, returning the number of bytes taken.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes, returning the number of bytes
    /// filled. `Ok(0)` means the peer closed the stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Tear the stream down.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl Transport for TcpStream {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

/// Session lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No successful Tversion yet; nothing else may be sent.
    Unversioned,
    /// msize and version agreed, no root fid yet.
    Versioned,
    /// Attached to the server's file tree.
    Attached,
    /// Torn down; every further operation fails.
    Closed,
}

/// A single 9P2000 session over a [`Transport`].
///
/// The engine is synchronous and keeps at most one request in flight;
/// a caller wanting concurrency serializes access externally. Any
/// framing or correlation failure leaves the byte stream untrustworthy,
/// so the session closes and stays closed.
///
/// The session owns one send buffer and one receive buffer, both msize
/// bytes after negotiation. Read payloads are copied out into the
/// caller's buffer.
pub struct Client<T: Transport> {
    transport: T,
    phase: Phase,
    msize: u32,
    version: String,
    tags: TagPool,
    fids: FidPool,
    root: u32,
    tx: Buffer,
    rx: Vec<u8>,
}

impl<T: Transport> Client<T> {
    /// Create a session in the Unversioned phase with the default
    /// msize cap.
    pub fn new(transport: T) -> Client<T> {
        Client::with_msize(transport, DEFAULT_MSIZE)
    }

    /// Create a session whose buffers hold frames of up to `msize`
    /// bytes. The cap is the build parameter negotiation starts from;
    /// values below the protocol minimum are raised to it.
    pub fn with_msize(transport: T, msize: u32) -> Client<T> {
        let msize = msize.max(MIN_MSIZE);
        Client {
            transport,
            phase: Phase::Unversioned,
            msize,
            version: String::new(),
            tags: TagPool::new(),
            fids: FidPool::new(),
            root: NOFID,
            tx: Buffer::with_capacity(msize as usize),
            rx: vec![0; msize as usize],
        }
    }

    /// The negotiated maximum frame size (the configured cap before
    /// negotiation).
    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// The negotiated protocol version; empty before negotiation.
    pub fn protocol_version(&self) -> &str {
        &self.version
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Negotiate the protocol version and maximum message size.
    ///
    /// Tversion travels under NOTAG. The server must answer with a
    /// msize no larger than offered and no smaller than the protocol
    /// minimum, and with the offered version string; `"unknown"` or any
    /// other string is `VersionUnsupported`. Every failure in this
    /// operation closes the session.
    pub fn version(&mut self, msize: u32, version: &str) -> Result<u32> {
        self.ensure(Phase::Unversioned)?;
        if version != P92000 {
            return Err(Error::InvalidArgument("only 9P2000 is supported"));
        }
        let offer = msize.clamp(MIN_MSIZE, self.msize);

        match self.negotiate_inner(offer, version) {
            Ok(msize) => {
                self.msize = msize;
                self.tx.set_capacity(msize as usize);
                self.rx.resize(msize as usize, 0);
                self.version = version.to_owned();
                self.phase = Phase::Versioned;
                Ok(msize)
            }
            Err(e) => {
                self.shutdown();
                Err(e)
            }
        }
    }

    fn negotiate_inner(&mut self, offer: u32, version: &str) -> Result<u32> {
        let resp = self.rpc(
            NOTAG,
            FCall::TVersion {
                msize: offer,
                version: version.to_owned(),
            },
        )?;
        match resp {
            FCall::RVersion {
                msize: server_msize,
                version: server_version,
            } => {
                if server_version != version {
                    return Err(Error::VersionUnsupported(server_version));
                }
                if server_msize > offer || server_msize < MIN_MSIZE {
                    return Err(Error::Protocol("server msize out of range"));
                }
                Ok(server_msize)
            }
            _ => Err(Error::Protocol("reply type does not match request")),
        }
    }

    /// Attach to the server's file tree without authenticating,
    /// returning the root fid and its qid. Failures here close the
    /// session.
    pub fn attach(&mut self, uname: &str, aname: &str) -> Result<(u32, QId)> {
        self.ensure(Phase::Versioned)?;
        let fid = self.fids.alloc()?;
        match self.transact(FCall::TAttach {
            fid,
            afid: NOFID,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        }) {
            Ok(FCall::RAttach { qid }) => {
                self.root = fid;
                self.phase = Phase::Attached;
                Ok((fid, qid))
            }
            Ok(_) => {
                self.fids.free(fid);
                self.shutdown();
                Err(Error::Protocol("reply type does not match request"))
            }
            Err(e) => {
                self.fids.free(fid);
                self.shutdown();
                Err(e)
            }
        }
    }

    /// Walk `names` starting from `fid`, returning a new fid and the
    /// qids visited. An empty `names` clones `fid`.
    ///
    /// When the walk stops early the server has created no new fid; the
    /// local slot is released and `WalkPartial` carries the number of
    /// elements that succeeded.
    pub fn walk(&mut self, fid: u32, names: &[&str]) -> Result<(u32, Vec<QId>)> {
        self.ensure(Phase::Attached)?;
        if names.len() > MAXWELEM {
            return Err(Error::InvalidArgument("walk of more than MAXWELEM names"));
        }
        if !self.fids.contains(fid) {
            return Err(Error::UnknownFid(fid));
        }
        let newfid = self.fids.alloc()?;
        let wnames = names.iter().map(|name| (*name).to_owned()).collect();

        match self.transact(FCall::TWalk { fid, newfid, wnames }) {
            Ok(FCall::RWalk { wqids }) => {
                if wqids.len() > names.len() {
                    self.fids.free(newfid);
                    Err(self.violation("walk returned more qids than names"))
                } else if wqids.len() < names.len() {
                    self.fids.free(newfid);
                    Err(Error::WalkPartial(wqids.len() as u16))
                } else {
                    Ok((newfid, wqids))
                }
            }
            Ok(_) => {
                self.fids.free(newfid);
                Err(Error::Protocol("reply type does not match request"))
            }
            Err(e) => {
                self.fids.free(newfid);
                Err(e)
            }
        }
    }

    /// Open `fid` with an `om` mode byte, returning the qid and the
    /// effective iounit read and write chunks are clipped to.
    pub fn open(&mut self, fid: u32, mode: u8) -> Result<(QId, u32)> {
        self.ensure(Phase::Attached)?;
        if mode & !MODE_MASK != 0 {
            return Err(Error::InvalidArgument("unsupported open mode bits"));
        }
        if !self.fids.contains(fid) {
            return Err(Error::UnknownFid(fid));
        }
        match self.transact(FCall::TOpen { fid, mode })? {
            FCall::ROpen { qid, iounit } => {
                let iounit = effective_iounit(iounit, self.msize);
                self.fids.set_open(fid, iounit);
                Ok((qid, iounit))
            }
            _ => Err(Error::Protocol("reply type does not match request")),
        }
    }

    /// Create `name` in the directory `fid` points at and open it. The
    /// fid moves onto the created file.
    pub fn create(&mut self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<(QId, u32)> {
        self.ensure(Phase::Attached)?;
        if mode & !MODE_MASK != 0 {
            return Err(Error::InvalidArgument("unsupported open mode bits"));
        }
        if !self.fids.contains(fid) {
            return Err(Error::UnknownFid(fid));
        }
        match self.transact(FCall::TCreate {
            fid,
            name: name.to_owned(),
            perm,
            mode,
        })? {
            FCall::RCreate { qid, iounit } => {
                let iounit = effective_iounit(iounit, self.msize);
                self.fids.set_open(fid, iounit);
                Ok((qid, iounit))
            }
            _ => Err(Error::Protocol("reply type does not match request")),
        }
    }

    /// Read at `offset` into `buf`, returning the bytes filled.
    ///
    /// The request is clipped to `buf.len()` and to the fid's iounit.
    /// A return of 0 for a non-empty `buf` is end of file.
    pub fn read(&mut self, fid: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure(Phase::Attached)?;
        let iounit = self.open_iounit(fid)?;
        let count = buf.len().min(iounit as usize) as u32;

        match self.transact(FCall::TRead { fid, offset, count })? {
            FCall::RRead { data } => {
                if data.0.len() as u32 > count {
                    return Err(self.violation("read returned more bytes than requested"));
                }
                buf[..data.0.len()].copy_from_slice(&data.0);
                Ok(data.0.len())
            }
            _ => Err(Error::Protocol("reply type does not match request")),
        }
    }

    /// Write `data` at `offset`, returning the bytes the server took.
    ///
    /// The chunk is clipped to the fid's iounit and the server may
    /// accept less than that; callers loop to write everything.
    pub fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure(Phase::Attached)?;
        let iounit = self.open_iounit(fid)?;
        let chunk = data.len().min(iounit as usize);

        match self.transact(FCall::TWrite {
            fid,
            offset,
            data: Data(data[..chunk].to_vec()),
        })? {
            FCall::RWrite { count } => {
                if count as usize > chunk {
                    return Err(self.violation("write acknowledged more bytes than sent"));
                }
                Ok(count as usize)
            }
            _ => Err(Error::Protocol("reply type does not match request")),
        }
    }

    /// Fetch the stat record of `fid`.
    pub fn stat(&mut self, fid: u32) -> Result<Stat> {
        self.ensure(Phase::Attached)?;
        if !self.fids.contains(fid) {
            return Err(Error::UnknownFid(fid));
        }
        match self.transact(FCall::TStat { fid })? {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(Error::Protocol("reply type does not match request")),
        }
    }

    /// Ask the server to change the stat record of `fid`. The server
    /// may reject any individual field.
    pub fn wstat(&mut self, fid: u32, stat: &Stat) -> Result<()> {
        self.ensure(Phase::Attached)?;
        if !self.fids.contains(fid) {
            return Err(Error::UnknownFid(fid));
        }
        self.transact(FCall::TWStat {
            fid,
            stat: stat.clone(),
        })
        .map(|_| ())
    }

    /// Retire `fid`. The fid leaves service even when the server
    /// answers with an error; that is how 9P defines clunk. Clunking
    /// the root fid ends the session.
    pub fn clunk(&mut self, fid: u32) -> Result<()> {
        self.ensure(Phase::Attached)?;
        if !self.fids.contains(fid) {
            return Err(Error::UnknownFid(fid));
        }
        let res = self.transact(FCall::TClunk { fid });
        self.fids.free(fid);
        if fid == self.root {
            self.root = NOFID;
            self.shutdown();
        }
        res.map(|_| ())
    }

    /// Remove the file `fid` points at. Like clunk, the fid leaves
    /// service whatever the server answers.
    pub fn remove(&mut self, fid: u32) -> Result<()> {
        self.ensure(Phase::Attached)?;
        if !self.fids.contains(fid) {
            return Err(Error::UnknownFid(fid));
        }
        let res = self.transact(FCall::TRemove { fid });
        self.fids.free(fid);
        res.map(|_| ())
    }

    /// Ask the server to abort the request sent under `oldtag`. With at
    /// most one request in flight there is normally nothing left to
    /// flush; the call exists for callers recovering out of band.
    pub fn flush(&mut self, oldtag: u16) -> Result<()> {
        self.ensure_live()?;
        self.transact(FCall::TFlush { oldtag }).map(|_| ())
    }

    /// Tear the session down, clunking the root fid when one is live.
    pub fn close(&mut self) -> Result<()> {
        if self.phase == Phase::Attached && self.fids.contains(self.root) {
            self.clunk(self.root)
        } else {
            self.shutdown();
            Ok(())
        }
    }

    fn ensure(&self, phase: Phase) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(Error::TransportClosed);
        }
        if self.phase != phase {
            return Err(Error::InvalidArgument(
                "operation not valid in this session phase",
            ));
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        match self.phase {
            Phase::Closed => Err(Error::TransportClosed),
            Phase::Unversioned => Err(Error::InvalidArgument("session is not versioned")),
            _ => Ok(()),
        }
    }

    fn open_iounit(&self, fid: u32) -> Result<u32> {
        match self.fids.iounit(fid) {
            Some(iounit) => Ok(iounit),
            None if self.fids.contains(fid) => Err(Error::InvalidArgument("fid is not open")),
            None => Err(Error::UnknownFid(fid)),
        }
    }

    /// Run one request under a pool tag.
    fn transact(&mut self, req: FCall) -> Result<FCall> {
        let tag = self.tags.alloc()?;
        let res = self.rpc(tag, req);
        self.tags.free(tag);
        res
    }

    /// Send one T-message and block for the matching reply.
    ///
    /// The reply must carry the request's tag and either the R-type
    /// paired with the request or `Rerror`; everything else closes the
    /// session.
    fn rpc(&mut self, tag: u16, body: FCall) -> Result<FCall> {
        let req = Msg { tag, body };
        match self.rpc_inner(&req) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                if e.is_fatal() {
                    error!("{:?}: {}", MsgType::from(&req.body), e);
                    self.shutdown();
                }
                Err(e)
            }
        }
    }

    fn rpc_inner(&mut self, req: &Msg) -> Result<FCall> {
        serialize::write_msg(&mut self.tx, req, self.msize)?;
        info!("\t→ {:?}", req);
        self.send_frame()?;

        let resp = self.recv_msg()?;
        info!("\t← {:?}", resp);
        if resp.tag != req.tag {
            return Err(Error::TagMismatch {
                want: req.tag,
                got: resp.tag,
            });
        }
        if let FCall::RError { ename } = resp.body {
            return Err(Error::Server(ename));
        }
        let typ = MsgType::from(&resp.body);
        if typ.is_t() {
            return Err(Error::Protocol("T-message type in a reply"));
        }
        if typ != MsgType::from(&req.body).reply() {
            return Err(Error::Protocol("reply type does not match request"));
        }
        Ok(resp.body)
    }

    fn send_frame(&mut self) -> Result<()> {
        let mut sent = 0;
        while sent < self.tx.len() {
            let n = self
                .transport
                .send(&self.tx[sent..])
                .map_err(Error::TransportWrite)?;
            if n == 0 {
                return Err(Error::TransportClosed);
            }
            sent += n;
        }
        Ok(())
    }

    /// Read exactly one frame and unmarshal it, validating the outer
    /// size field before trusting it.
    fn recv_msg(&mut self) -> Result<Msg> {
        let mut header = [0u8; 4];
        let mut got = 0;
        while got < header.len() {
            let n = self
                .transport
                .recv(&mut header[got..])
                .map_err(Error::TransportRead)?;
            if n == 0 {
                // A stream that ends inside the size prefix framed
                // nothing at all.
                return Err(if got == 0 {
                    Error::TransportClosed
                } else {
                    Error::ShortHeader(got as u32)
                });
            }
            got += n;
        }

        let size = LittleEndian::read_u32(&header);
        if size < HDRSZ {
            return Err(Error::ShortHeader(size));
        }
        if size > self.msize {
            return Err(Error::Oversize {
                size,
                msize: self.msize,
            });
        }

        let rest = (size - 4) as usize;
        let mut got = 0;
        while got < rest {
            let n = self
                .transport
                .recv(&mut self.rx[got..rest])
                .map_err(Error::TransportRead)?;
            if n == 0 {
                return Err(Error::Truncated {
                    size,
                    actual: got as u32 + 4,
                });
            }
            got += n;
        }
        serialize::read_msg(&self.rx[..rest])
    }

    fn violation(&mut self, msg: &'static str) -> Error {
        error!("protocol violation: {}", msg);
        self.shutdown();
        Error::Protocol(msg)
    }

    fn shutdown(&mut self) {
        self.phase = Phase::Closed;
        let _ = self.transport.close();
    }
}

// 0 from the server means "whatever fits in a frame"; a larger value
// would not fit either.
fn effective_iounit(iounit: u32, msize: u32) -> u32 {
    let max = msize - IOHDRSZ;
    if iounit == 0 || iounit > max {
        max
    } else {
        iounit
    }
}
