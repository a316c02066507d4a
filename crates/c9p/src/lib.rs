#![forbid(unsafe_code)]
//! Synchronous 9P2000 client library for Rust.
//!
//! This crate implements the client side of the classic Plan 9 file
//! protocol: a bit-exact marshaller/unmarshaller for every T- and
//! R-message, strict validation of each reply against its pending
//! request, and a small file-oriented API over the fid/qid abstractions.
//! It is written for constrained deployments: one session per engine,
//! one request in flight, two scratch buffers sized by the negotiated
//! msize, and tag/fid tables sized at compile time.
//!
//! # Getting started
//!
//! Connect a transport, negotiate, attach, and work with fids:
//!
//! ```no_run
//! use c9p::{om, Client};
//! use std::net::TcpStream;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = TcpStream::connect("127.0.0.1:564")?;
//!     let mut nine = Client::new(stream);
//!
//!     nine.version(8192, "9P2000")?;
//!     let (root, _) = nine.attach("glenda", "")?;
//!
//!     let (fid, _) = nine.walk(root, &["lib", "ndb", "local"])?;
//!     nine.open(fid, om::READ)?;
//!
//!     let mut buf = vec![0; 4096];
//!     let n = nine.read(fid, 0, &mut buf)?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!     nine.clunk(fid)?;
//!     nine.close()?;
//!     Ok(())
//! }
//! ```
//!
//! # Message flow
//!
//! 1. **Version negotiation**: `Tversion`/`Rversion` under NOTAG agree
//!    on the protocol string (exactly `"9P2000"`) and the maximum frame
//!    size.
//! 2. **Attach**: `Tattach` binds a fresh fid to the server's root.
//! 3. **Operations**: walk, open, create, read, write, stat, wstat.
//! 4. **Cleanup**: clunk releases fids; clunking the root ends the
//!    session.
//!
//! # Fid management
//!
//! A fid is a client-chosen 32-bit handle for a file or directory. The
//! engine allocates fids from a fixed table, refuses operations on fids
//! it never issued, and retires a fid on clunk or remove even when the
//! server reports an error for the operation, as the protocol demands.
//!
//! # Error handling
//!
//! Every operation returns [`Result`]. [`Error::is_fatal`] separates
//! the recoverable outcomes (server-reported errors, partial walks,
//! exhausted tables, bad arguments) from the ones that close the
//! session (transport, framing, and correlation failures). After a
//! fatal error every call fails with `TransportClosed`.
//!
//! # Transports
//!
//! The engine consumes any [`client::Transport`]: a reliable ordered
//! byte stream with blocking send/recv. Implementations for
//! `TcpStream` and `UnixStream` ship in the crate; the engine performs
//! its own framing.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`). Every
//! length field read off the wire is validated against the negotiated
//! msize and the bytes actually received before it is trusted.
pub mod client;
pub mod error;
pub mod fcall;
pub mod ids;
pub mod serialize;
pub mod utils;

pub use crate::client::{Client, Phase, Transport};
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
