//! Server side of the milter protocol, the mail filter interface of sendmail
//! and postfix.
//!
//! Implement [`Milter`] for the filter logic and hand a factory for it to a
//! [`Server`]. Every MTA connection gets its own [`Session`] on its own thread.
//!
//! ```no_run
//! use milterd::milter::constants::*;
//! use milterd::{CallbackResult, Milter, Modifier, Response, Server};
//! use std::net::TcpListener;
//!
//! struct Tag;
//! impl Milter for Tag {
//!     fn end_of_body(&mut self, m: &mut Modifier<'_>) -> CallbackResult {
//!         m.add_header("X-Filtered", "yes")?;
//!         Ok(Response::ACCEPT)
//!     }
//! }
//!
//! let listener = TcpListener::bind("127.0.0.1:7044").unwrap();
//! let server = Server::new(listener.into(), || (Tag, SMFIF_ADDHDRS, SMFIP_NOCONNECT));
//! server.serve().unwrap();
//! ```

pub mod cli;
pub mod cstrings;
pub mod daemon;
mod error;
pub mod framing;
mod headers;
pub mod message;
pub mod milter;
mod modifier;
mod response;
pub mod server;
pub mod session;

pub use error::{Error, Result};
pub use headers::Headers;
pub use message::RawMessage;
pub use milter::{CallbackError, CallbackResult, Family, Milter};
pub use modifier::Modifier;
pub use response::Response;
pub use server::{ErrorObserver, Server, ServerBuilder};
pub use session::{Session, SessionEnd};
