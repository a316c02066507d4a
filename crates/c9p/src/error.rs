//! Error types reported by the client.

use std::{error, fmt, io};

use crate::fcall::MsgType;

/// Everything a client operation can fail with.
///
/// Variants are grouped by origin: transport failures, framing and
/// decoding failures, correlation failures, version negotiation, errors
/// the server reports in an `Rerror`, and local resource or argument
/// errors. [`Error::is_fatal`] tells the classes apart: a fatal error
/// leaves the receive stream in an unknown state, so the session closes
/// and stays closed.
#[derive(Debug)]
pub enum Error {
    /// Reading from the transport failed.
    TransportRead(io::Error),
    /// Writing to the transport failed.
    TransportWrite(io::Error),
    /// The peer went away, or the session was already closed.
    TransportClosed,
    /// The size field of a reply is below the minimal frame of 7 bytes
    /// (size[4] type[1] tag[2]). Carries the offending size, or the
    /// byte count when fewer than the 4 size bytes arrived at all.
    ShortHeader(u32),
    /// The size field announces more bytes than the transport delivered.
    Truncated { size: u32, actual: u32 },
    /// A frame exceeds the negotiated msize.
    Oversize { size: u32, msize: u32 },
    /// The type byte is not a defined 9P2000 message type.
    UnknownType(u8),
    /// The message body does not decode to exactly the layout of its
    /// type within the declared size.
    MalformedBody(MsgType),
    /// A fixed-width read overran the end of a buffer.
    ShortBuffer,
    /// A string does not fit: its length prefix overruns the buffer
    /// holding it, or exceeds the 2-byte prefix on encode.
    StringTooLong(usize),
    /// An append overran the capacity of a bounded buffer.
    BufferFull,
    /// The reply carries a tag different from the pending request.
    TagMismatch { want: u16, got: u16 },
    /// The reply is well-formed but breaks a protocol rule.
    Protocol(&'static str),
    /// The server offered a protocol version this client does not speak.
    VersionUnsupported(String),
    /// The server answered with `Rerror`.
    Server(String),
    /// The walk stopped early; the server created no new fid. Carries
    /// the number of elements that succeeded.
    WalkPartial(u16),
    /// Every request tag is in flight.
    TagsExhausted,
    /// Every fid slot is in service.
    FidsExhausted,
    /// The fid is not currently in service.
    UnknownFid(u32),
    /// The caller asked for something the protocol cannot express.
    InvalidArgument(&'static str),
}

impl Error {
    /// Whether the error closes the session.
    ///
    /// Server-reported errors, partial walks, and local resource or
    /// argument errors leave the session usable; everything else means
    /// the next bytes on the wire can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Server(_)
                | Error::WalkPartial(_)
                | Error::TagsExhausted
                | Error::FidsExhausted
                | Error::UnknownFid(_)
                | Error::InvalidArgument(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransportRead(e) => write!(f, "transport read: {}", e),
            Error::TransportWrite(e) => write!(f, "transport write: {}", e),
            Error::TransportClosed => write!(f, "transport closed"),
            Error::ShortHeader(size) => write!(f, "reply header too short (size {})", size),
            Error::Truncated { size, actual } => {
                write!(f, "frame announces {} bytes but {} arrived", size, actual)
            }
            Error::Oversize { size, msize } => {
                write!(f, "frame of {} bytes exceeds msize {}", size, msize)
            }
            Error::UnknownType(typ) => write!(f, "unknown message type {}", typ),
            Error::MalformedBody(typ) => write!(f, "malformed {:?} body", typ),
            Error::ShortBuffer => write!(f, "read past end of buffer"),
            Error::StringTooLong(len) => write!(f, "string of {} bytes does not fit", len),
            Error::BufferFull => write!(f, "write past end of buffer"),
            Error::TagMismatch { want, got } => {
                write!(f, "reply tag {} does not match request tag {}", got, want)
            }
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::VersionUnsupported(version) => {
                write!(f, "server version {:?} is not supported", version)
            }
            Error::Server(ename) => write!(f, "server error: {}", ename),
            Error::WalkPartial(n) => write!(f, "walk stopped after {} elements", n),
            Error::TagsExhausted => write!(f, "all request tags are in flight"),
            Error::FidsExhausted => write!(f, "all fid slots are in service"),
            Error::UnknownFid(fid) => write!(f, "fid {} is not in service", fid),
            Error::InvalidArgument(msg) => write!(f, "{}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::TransportRead(e) | Error::TransportWrite(e) => Some(e),
            _ => None,
        }
    }
}
