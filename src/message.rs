/// One milter packet: a command (from the MTA) or action (to the MTA) code
/// plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub code: u8,
    pub data: Vec<u8>,
}

impl RawMessage {
    pub fn new(code: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }
}

// https://github.com/emersion/go-milter/blob/master/milter-protocol.txt

/// Command codes sent by the MTA.
pub mod command {
    pub const ABORT: u8 = b'A';
    pub const BODY: u8 = b'B';
    pub const CONNECT: u8 = b'C';
    pub const MACRO: u8 = b'D';
    pub const BODY_END: u8 = b'E';
    pub const HELO: u8 = b'H';
    pub const HEADER: u8 = b'L';
    pub const MAIL: u8 = b'M';
    pub const HEADERS_END: u8 = b'N';
    pub const NEGOTIATE: u8 = b'O';
    pub const QUIT: u8 = b'Q';
    pub const RCPT: u8 = b'R';
    pub const DATA: u8 = b'T';
}

/// Response and modification codes sent by the filter.
pub mod action {
    pub const ACCEPT: u8 = b'a';
    pub const CONTINUE: u8 = b'c';
    pub const DISCARD: u8 = b'd';
    pub const REJECT: u8 = b'r';
    pub const TEMPFAIL: u8 = b't';

    pub const ADD_RCPT: u8 = b'+';
    pub const DEL_RCPT: u8 = b'-';
    pub const REPLACE_BODY: u8 = b'b';
    pub const ADD_HEADER: u8 = b'h';
    pub const INSERT_HEADER: u8 = b'i';
    pub const CHANGE_HEADER: u8 = b'm';
    pub const CHANGE_FROM: u8 = b'e';
    pub const QUARANTINE: u8 = b'q';
    pub const NEGOTIATE: u8 = b'O';
}
