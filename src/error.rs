use crate::framing::MAX_PACKET_LEN;
use crate::milter::CallbackError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The MTA closed the connection between two packets.
    #[error("connection closed by peer")]
    Disconnected,

    /// The MTA asked to end the session, or sent a command we cannot handle.
    #[error("stop current milter processing")]
    CloseSession,

    #[error("received empty packet")]
    EmptyPacket,

    #[error("received packet too long ({0} > {MAX_PACKET_LEN})")]
    PacketTooLarge(u32),

    #[error("macro definition with odd number of fields ({0})")]
    MalformedMacros(usize),

    #[error("milter callback failed: {0}")]
    Callback(#[source] CallbackError),

    #[error("milter session panicked: {0}")]
    Panic(String),

    #[error("server is shut down")]
    ServerStopped,
}
