use crate::message::{RawMessage, action};

/// Decision returned by a [`Milter`](crate::Milter) callback.
///
/// `Simple` carries just a code (the canned accept/continue/reject/... replies),
/// `Custom` carries a code and payload (negotiation replies, modifications).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Simple(u8),
    Custom { code: u8, data: Vec<u8> },
}

impl Response {
    pub const ACCEPT: Response = Response::Simple(action::ACCEPT);
    pub const CONTINUE: Response = Response::Simple(action::CONTINUE);
    pub const DISCARD: Response = Response::Simple(action::DISCARD);
    pub const REJECT: Response = Response::Simple(action::REJECT);
    pub const TEMPFAIL: Response = Response::Simple(action::TEMPFAIL);

    pub fn simple(code: u8) -> Self {
        Response::Simple(code)
    }

    pub fn custom(code: u8, data: impl Into<Vec<u8>>) -> Self {
        Response::Custom {
            code,
            data: data.into(),
        }
    }

    /// Custom response whose payload is `data` followed by a NUL.
    pub fn custom_str(code: u8, data: &str) -> Self {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.extend_from_slice(data.as_bytes());
        payload.push(0);
        Response::custom(code, payload)
    }

    pub fn code(&self) -> u8 {
        match self {
            Response::Simple(code) | Response::Custom { code, .. } => *code,
        }
    }

    pub fn to_message(&self) -> RawMessage {
        match self {
            Response::Simple(code) => RawMessage::new(*code, Vec::new()),
            Response::Custom { code, data } => RawMessage::new(*code, data.clone()),
        }
    }

    /// False for the terminal codes (accept, discard, reject, temp-fail), true
    /// for every other code.
    pub fn should_continue(&self) -> bool {
        !matches!(
            self.code(),
            action::ACCEPT | action::DISCARD | action::REJECT | action::TEMPFAIL
        )
    }
}

#[test]
fn test_should_continue() {
    assert!(!Response::ACCEPT.should_continue());
    assert!(!Response::DISCARD.should_continue());
    assert!(!Response::REJECT.should_continue());
    assert!(!Response::TEMPFAIL.should_continue());
    assert!(Response::CONTINUE.should_continue());
    assert!(Response::custom(action::NEGOTIATE, [0u8; 12]).should_continue());
    assert!(Response::simple(b'Z').should_continue());
    assert!(!Response::custom(action::REJECT, b"why".to_vec()).should_continue());
}

#[test]
fn test_should_continue_all_codes() {
    for code in 0..=u8::MAX {
        let terminal = b"adrt".contains(&code);
        assert_eq!(Response::simple(code).should_continue(), !terminal);
        assert_eq!(Response::custom(code, Vec::new()).should_continue(), !terminal);
    }
}

#[test]
fn test_to_message() {
    assert_eq!(
        Response::ACCEPT.to_message(),
        RawMessage::new(b'a', Vec::new())
    );
    assert_eq!(
        Response::custom_str(action::QUARANTINE, "spam").to_message(),
        RawMessage::new(b'q', b"spam\0".to_vec())
    );
}
