use crate::headers::Headers;
use crate::modifier::Modifier;
use crate::response::Response;
use std::fmt;
use std::net::IpAddr;

/// Error type callbacks may fail with. Any failure ends the session.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type CallbackResult = Result<Response, CallbackError>;

pub mod constants {
    /// Protocol version sent in the negotiation reply.
    pub const SMFI_VERSION: u32 = 2;

    // actions
    pub const SMFIF_ADDHDRS: u32 = 0x00000001;
    pub const SMFIF_CHGBODY: u32 = 0x00000002;
    pub const SMFIF_ADDRCPT: u32 = 0x00000004;
    pub const SMFIF_DELRCPT: u32 = 0x00000008;
    pub const SMFIF_CHGHDRS: u32 = 0x00000010;
    pub const SMFIF_QUARANTINE: u32 = 0x00000020;
    pub const SMFIF_CHGFROM: u32 = 0x00000040;

    // protocol flags, each masks out one stage of the SMTP transaction
    pub const SMFIP_NOCONNECT: u32 = 0x00000001;
    pub const SMFIP_NOHELO: u32 = 0x00000002;
    pub const SMFIP_NOMAIL: u32 = 0x00000004;
    pub const SMFIP_NORCPT: u32 = 0x00000008;
    pub const SMFIP_NOBODY: u32 = 0x00000010;
    pub const SMFIP_NOHDRS: u32 = 0x00000020;
    pub const SMFIP_NOEOH: u32 = 0x00000040;
}

/// Protocol family of the SMTP client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unknown,
    Unix,
    Tcp4,
    Tcp6,
}

impl Family {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'U' => Some(Family::Unknown),
            b'L' => Some(Family::Unix),
            b'4' => Some(Family::Tcp4),
            b'6' => Some(Family::Tcp6),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Unknown => "unknown",
            Family::Unix => "unix",
            Family::Tcp4 => "tcp4",
            Family::Tcp6 => "tcp6",
        }
    }

    /// Whether a port number follows the family byte.
    pub fn has_port(&self) -> bool {
        matches!(self, Family::Tcp4 | Family::Tcp6)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter callbacks, one per SMTP phase.
///
/// A fresh instance serves each MTA connection. Every method defaults to
/// [`Response::CONTINUE`]. Mutations go through the [`Modifier`], which writes
/// them to the MTA immediately.
#[allow(unused_variables)]
pub trait Milter {
    /// Connection data of the SMTP client. Suppressed with `SMFIP_NOCONNECT`.
    ///
    /// `address` is `None` when the MTA sent something that is not an IP
    /// address, e.g. for Unix socket clients.
    fn connect(
        &mut self,
        hostname: &str,
        family: Family,
        port: u16,
        address: Option<IpAddr>,
        m: &mut Modifier<'_>,
    ) -> CallbackResult {
        Ok(Response::CONTINUE)
    }

    /// HELO/EHLO name. Suppressed with `SMFIP_NOHELO`.
    fn helo(&mut self, name: &str, m: &mut Modifier<'_>) -> CallbackResult {
        Ok(Response::CONTINUE)
    }

    /// Envelope sender with angle brackets removed. Suppressed with `SMFIP_NOMAIL`.
    fn mail_from(&mut self, sender: &str, m: &mut Modifier<'_>) -> CallbackResult {
        Ok(Response::CONTINUE)
    }

    /// Envelope recipient with angle brackets removed. Suppressed with `SMFIP_NORCPT`.
    fn rcpt_to(&mut self, recipient: &str, m: &mut Modifier<'_>) -> CallbackResult {
        Ok(Response::CONTINUE)
    }

    /// Called once per header. Suppressed with `SMFIP_NOHDRS`.
    fn header(&mut self, name: &str, value: &str, m: &mut Modifier<'_>) -> CallbackResult {
        Ok(Response::CONTINUE)
    }

    /// All headers seen so far. Suppressed with `SMFIP_NOEOH`.
    fn end_of_headers(&mut self, headers: &Headers, m: &mut Modifier<'_>) -> CallbackResult {
        Ok(Response::CONTINUE)
    }

    /// One chunk of the message body (at most 64KB). Suppressed with `SMFIP_NOBODY`.
    fn body_chunk(&mut self, chunk: &[u8], m: &mut Modifier<'_>) -> CallbackResult {
        Ok(Response::CONTINUE)
    }

    /// The whole message has been delivered. Modifications are only allowed here.
    fn end_of_body(&mut self, m: &mut Modifier<'_>) -> CallbackResult {
        Ok(Response::CONTINUE)
    }
}
