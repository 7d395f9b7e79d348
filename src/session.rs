use crate::cstrings::{decode_cstrings, read_cstring, split_cstring};
use crate::error::{Error, Result};
use crate::framing;
use crate::headers::Headers;
use crate::message::{RawMessage, action, command};
use crate::milter::constants::SMFI_VERSION;
use crate::milter::{CallbackResult, Family, Milter};
use crate::modifier::Modifier;
use crate::response::Response;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::net::IpAddr;

// https://www.postfix.org/MILTER_README.html
// https://github.com/emersion/go-milter/blob/master/milter-protocol.txt

/// How a session loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The MTA closed the connection between two packets.
    Disconnected,
    /// The MTA sent quit, or a command we do not understand.
    Quit,
    /// A terminal response (accept, discard, reject, temp-fail) was sent.
    Completed(u8),
}

/// State of one MTA connection.
pub struct Session<M, S: Read + Write> {
    milter: M,
    actions: u32,
    protocol: u32,
    transport: BufReader<S>,
    macros: HashMap<String, String>,
    headers: Headers,
}

impl<M: Milter, S: Read + Write> Session<M, S> {
    /// `actions` (`SMFIF_*`) and `protocol` (`SMFIP_*`) are sent to the MTA
    /// on negotiation.
    pub fn new(milter: M, actions: u32, protocol: u32, transport: S) -> Self {
        Self {
            milter,
            actions,
            protocol,
            transport: BufReader::new(transport),
            macros: HashMap::new(),
            headers: Headers::new(),
        }
    }

    pub fn read_packet(&mut self) -> Result<RawMessage> {
        framing::read_packet(&mut self.transport)
    }

    pub fn write_packet(&mut self, msg: &RawMessage) -> Result<()> {
        framing::write_packet(self.transport.get_mut(), msg)
    }

    /// Applies one command to the session and returns the reply to send, if
    /// any. [`Error::CloseSession`] asks the caller to end the session.
    pub fn process(&mut self, msg: &RawMessage) -> Result<Option<Response>> {
        let data = msg.data.as_slice();
        debug!("received command {:?} ({} bytes)", msg.code as char, data.len());
        match msg.code {
            command::ABORT => {
                self.macros = HashMap::new();
                self.headers = Headers::new();
                // no reply to SMFIC_ABORT
                Ok(None)
            }
            command::BODY => self.invoke(|milter, m| milter.body_chunk(data, m)),
            command::CONNECT => self.connect(data),
            command::MACRO => {
                // first byte names the command these macros belong to
                let fields = decode_cstrings(data.get(1..).unwrap_or_default());
                if fields.len() % 2 != 0 {
                    return Err(Error::MalformedMacros(fields.len()));
                }
                self.macros = fields
                    .chunks_exact(2)
                    .map(|kv| (kv[0].clone(), kv[1].clone()))
                    .collect();
                // no reply to SMFIC_MACRO
                Ok(None)
            }
            command::BODY_END => self.invoke(|milter, m| milter.end_of_body(m)),
            command::HELO => {
                let name = read_cstring(data);
                self.invoke(|milter, m| milter.helo(&name, m))
            }
            command::HEADER => {
                let fields = decode_cstrings(data);
                let [name, value] = fields.as_slice() else {
                    debug!("ignoring header with {} fields", fields.len());
                    return Ok(None);
                };
                self.headers.add(name.as_str(), value.as_str());
                self.invoke(|milter, m| milter.header(name, value, m))
            }
            command::MAIL => {
                // possibly followed by more strings (ESMTP arguments)
                let sender = read_cstring(data);
                self.invoke(|milter, m| milter.mail_from(anglestrip(&sender), m))
            }
            command::HEADERS_END => self.invoke(|milter, m| {
                let headers = m.headers();
                milter.end_of_headers(headers, m)
            }),
            command::NEGOTIATE => {
                // the MTA's offer is ignored, we always answer with our own flags
                let mut reply = Vec::with_capacity(12);
                for value in [SMFI_VERSION, self.actions, self.protocol] {
                    reply.extend_from_slice(&value.to_be_bytes());
                }
                Ok(Some(Response::custom(action::NEGOTIATE, reply)))
            }
            command::QUIT => Err(Error::CloseSession),
            command::RCPT => {
                let recipient = read_cstring(data);
                self.invoke(|milter, m| milter.rcpt_to(anglestrip(&recipient), m))
            }
            command::DATA => Ok(Some(Response::CONTINUE)),
            code => {
                warn!("unrecognized milter command {:?}", code as char);
                Err(Error::CloseSession)
            }
        }
    }

    /// Reads and answers commands until the MTA disconnects or quits, or a
    /// terminal response has been sent. The transport is closed on return.
    pub fn handle_commands(mut self) -> Result<SessionEnd> {
        self.run()
    }

    fn run(&mut self) -> Result<SessionEnd> {
        loop {
            let msg = match self.read_packet() {
                Ok(msg) => msg,
                Err(Error::Disconnected) => return Ok(SessionEnd::Disconnected),
                Err(e) => {
                    error!("error reading milter command: {e}");
                    return Err(e);
                }
            };
            let response = match self.process(&msg) {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(Error::CloseSession) => return Ok(SessionEnd::Quit),
                Err(e) => {
                    error!("error performing milter command {:?}: {e}", msg.code as char);
                    return Err(e);
                }
            };
            if let Err(e) = self.write_packet(&response.to_message()) {
                error!("error writing milter response: {e}");
                return Err(e);
            }
            if !response.should_continue() {
                return Ok(SessionEnd::Completed(response.code()));
            }
        }
    }

    fn connect(&mut self, data: &[u8]) -> Result<Option<Response>> {
        let (hostname, rest) = split_cstring(data);
        let hostname = String::from_utf8_lossy(hostname).into_owned();
        let Some((&family, mut rest)) = rest.split_first() else {
            warn!("connect from {hostname} without protocol family");
            return Ok(Some(Response::TEMPFAIL));
        };
        let Some(family) = Family::from_byte(family) else {
            warn!("connect from {hostname} with unknown protocol family {:?}", family as char);
            return Ok(Some(Response::TEMPFAIL));
        };
        let mut port = 0;
        if family.has_port() {
            let Some((port_bytes, tail)) = rest.split_first_chunk::<2>() else {
                warn!("connect from {hostname} without port");
                return Ok(Some(Response::TEMPFAIL));
            };
            port = u16::from_be_bytes(*port_bytes);
            rest = tail;
            if family == Family::Tcp6 {
                rest = rest.strip_prefix(b"IPv6:").unwrap_or(rest);
            }
        }
        let address = read_cstring(rest).parse::<IpAddr>().ok();
        self.invoke(|milter, m| milter.connect(&hostname, family, port, address, m))
    }

    fn invoke<F>(&mut self, f: F) -> Result<Option<Response>>
    where
        F: FnOnce(&mut M, &mut Modifier<'_>) -> CallbackResult,
    {
        let transport = &mut self.transport;
        let mut write = |msg: &RawMessage| framing::write_packet(transport.get_mut(), msg);
        let mut modifier = Modifier::new(&self.macros, &self.headers, &mut write);
        f(&mut self.milter, &mut modifier)
            .map(Some)
            .map_err(Error::Callback)
    }
}

fn anglestrip(s: &str) -> &str {
    s.strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milter::CallbackError;
    use std::io::{self, Cursor};
    use std::net::Ipv4Addr;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect(String, Family, u16, Option<IpAddr>),
        Helo(String),
        MailFrom(String),
        RcptTo(String),
        Header(String, String),
        EndOfHeaders(Vec<(String, String)>),
        BodyChunk(Vec<u8>),
        EndOfBody(HashMap<String, String>),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        end_of_body: Option<Response>,
        fail_helo: bool,
    }

    impl Milter for Recorder {
        fn connect(
            &mut self,
            hostname: &str,
            family: Family,
            port: u16,
            address: Option<IpAddr>,
            _m: &mut Modifier<'_>,
        ) -> CallbackResult {
            self.calls
                .push(Call::Connect(hostname.into(), family, port, address));
            Ok(Response::CONTINUE)
        }
        fn helo(&mut self, name: &str, _m: &mut Modifier<'_>) -> CallbackResult {
            if self.fail_helo {
                return Err(CallbackError::from("helo refused"));
            }
            self.calls.push(Call::Helo(name.into()));
            Ok(Response::CONTINUE)
        }
        fn mail_from(&mut self, sender: &str, _m: &mut Modifier<'_>) -> CallbackResult {
            self.calls.push(Call::MailFrom(sender.into()));
            Ok(Response::CONTINUE)
        }
        fn rcpt_to(&mut self, recipient: &str, _m: &mut Modifier<'_>) -> CallbackResult {
            self.calls.push(Call::RcptTo(recipient.into()));
            Ok(Response::CONTINUE)
        }
        fn header(&mut self, name: &str, value: &str, _m: &mut Modifier<'_>) -> CallbackResult {
            self.calls.push(Call::Header(name.into(), value.into()));
            Ok(Response::CONTINUE)
        }
        fn end_of_headers(&mut self, headers: &Headers, _m: &mut Modifier<'_>) -> CallbackResult {
            let headers = headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect();
            self.calls.push(Call::EndOfHeaders(headers));
            Ok(Response::CONTINUE)
        }
        fn body_chunk(&mut self, chunk: &[u8], _m: &mut Modifier<'_>) -> CallbackResult {
            self.calls.push(Call::BodyChunk(chunk.to_vec()));
            Ok(Response::CONTINUE)
        }
        fn end_of_body(&mut self, m: &mut Modifier<'_>) -> CallbackResult {
            self.calls.push(Call::EndOfBody(m.macros().clone()));
            m.add_header("X-Checked", "yes")?;
            Ok(self.end_of_body.clone().unwrap_or(Response::ACCEPT))
        }
    }

    /// Scripted input, captured output.
    struct Transport {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Transport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Transport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn session(milter: Recorder) -> Session<Recorder, Transport> {
        session_with_input(milter, &[])
    }

    fn session_with_input(
        milter: Recorder,
        packets: &[RawMessage],
    ) -> Session<Recorder, Transport> {
        let mut input = Vec::new();
        for packet in packets {
            framing::write_packet(&mut input, packet).unwrap();
        }
        let transport = Transport {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        Session::new(milter, 0x01, 0x02, transport)
    }

    fn msg(code: u8, data: &[u8]) -> RawMessage {
        RawMessage::new(code, data)
    }

    fn written(session: &mut Session<Recorder, Transport>) -> Vec<RawMessage> {
        let output = std::mem::take(&mut session.transport.get_mut().output);
        let mut reader = &output[..];
        let mut packets = Vec::new();
        while let Ok(packet) = framing::read_packet(&mut reader) {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn process_all_commands() {
        let mut s = session(Recorder::default());
        let cases: &[(RawMessage, bool)] = &[
            (msg(b'A', b""), false),
            (msg(b'B', b""), false),
            (msg(b'C', b"server.domain.com\x004\x01\x01127.0.0.1\x00"), false),
            (msg(b'C', b"server.domain.com\x004\x00"), false),
            (
                msg(
                    b'C',
                    b"server.domain.com\x006\x01\x01IPv6:2001:db8:1234:ffff:ffff:ffff:ffff:ffff",
                ),
                false,
            ),
            (msg(b'D', b"Ckey\x00value\x00"), false),
            (msg(b'E', b""), false),
            (msg(b'H', b"mail.domain.com\x00"), false),
            (msg(b'L', b"From\x00user@domain.com\x00"), false),
            (msg(b'M', b"user@domain.com\x00"), false),
            (msg(b'N', b""), false),
            (msg(b'O', b""), false),
            (msg(b'Q', b""), true),
            (msg(b'R', b""), false),
            (msg(b'T', b""), false),
            (msg(b'Z', b""), true),
        ];
        for (message, should_fail) in cases {
            let result = s.process(message);
            if *should_fail {
                assert!(matches!(result, Err(Error::CloseSession)), "{message:?}");
            } else {
                assert!(result.is_ok(), "{message:?}: {result:?}");
            }
        }
    }

    #[test]
    fn connect_ipv4() {
        let mut s = session(Recorder::default());
        let response = s
            .process(&msg(b'C', b"host\x004\x01\x01127.0.0.1\x00"))
            .unwrap();
        assert_eq!(response, Some(Response::CONTINUE));
        assert_eq!(
            s.milter.calls,
            [Call::Connect(
                "host".into(),
                Family::Tcp4,
                0x0101,
                Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
            )]
        );
    }

    #[test]
    fn connect_ipv6_strips_prefix() {
        let mut s = session(Recorder::default());
        s.process(&msg(b'C', b"host\x006\x00\x19IPv6:::1\x00"))
            .unwrap();
        assert_eq!(
            s.milter.calls,
            [Call::Connect(
                "host".into(),
                Family::Tcp6,
                25,
                Some("::1".parse().unwrap())
            )]
        );
    }

    #[test]
    fn connect_unix_has_no_port() {
        let mut s = session(Recorder::default());
        s.process(&msg(b'C', b"localhost\x00L/var/run/smtp.sock\x00"))
            .unwrap();
        assert_eq!(
            s.milter.calls,
            [Call::Connect("localhost".into(), Family::Unix, 0, None)]
        );
    }

    #[test]
    fn connect_malformed_is_tempfailed() {
        let mut s = session(Recorder::default());
        for data in [&b"host\x004\x01"[..], b"host\x006", b"host\x00", b"host\x00X\x00\x19"] {
            assert_eq!(s.process(&msg(b'C', data)).unwrap(), Some(Response::TEMPFAIL));
        }
        assert!(s.milter.calls.is_empty());
    }

    #[test]
    fn abort_clears_macros_and_headers() {
        let mut s = session(Recorder::default());
        assert_eq!(s.process(&msg(b'D', b"Mk\x00v\x00")).unwrap(), None);
        assert_eq!(s.macros.get("k").map(String::as_str), Some("v"));
        s.process(&msg(b'L', b"N\x00V\x00")).unwrap();
        assert_eq!(s.headers.len(), 1);
        assert_eq!(s.process(&msg(b'A', b"")).unwrap(), None);
        assert!(s.macros.is_empty());
        s.process(&msg(b'N', b"")).unwrap();
        assert_eq!(s.milter.calls.last(), Some(&Call::EndOfHeaders(Vec::new())));
    }

    #[test]
    fn macros_are_replaced() {
        let mut s = session(Recorder::default());
        s.process(&msg(b'D', b"Ci\x00ABC\x00j\x00mx\x00")).unwrap();
        assert_eq!(s.macros.len(), 2);
        s.process(&msg(b'D', b"E{rcpt}\x00\x00")).unwrap();
        assert_eq!(
            s.macros,
            HashMap::from([("{rcpt}".to_string(), String::new())])
        );
        s.process(&msg(b'D', b"")).unwrap();
        assert!(s.macros.is_empty());
    }

    #[test]
    fn macros_with_odd_fields_are_rejected() {
        let mut s = session(Recorder::default());
        s.process(&msg(b'D', b"Ci\x00ABC\x00")).unwrap();
        assert!(matches!(
            s.process(&msg(b'D', b"Ci\x00ABC\x00j\x00")),
            Err(Error::MalformedMacros(3))
        ));
        assert_eq!(s.macros.len(), 1);
    }

    #[test]
    fn headers_accumulate_in_order() {
        let mut s = session(Recorder::default());
        s.process(&msg(b'L', b"From\x00a@b\x00")).unwrap();
        s.process(&msg(b'L', b"Subject\x00\x00")).unwrap();
        assert_eq!(s.process(&msg(b'L', b"Broken\x00")).unwrap(), None);
        assert_eq!(s.process(&msg(b'L', b"")).unwrap(), None);
        s.process(&msg(b'N', b"")).unwrap();
        assert_eq!(
            s.milter.calls,
            [
                Call::Header("From".into(), "a@b".into()),
                Call::Header("Subject".into(), String::new()),
                Call::EndOfHeaders(vec![
                    ("From".into(), "a@b".into()),
                    ("Subject".into(), String::new()),
                ]),
            ]
        );
    }

    #[test]
    fn envelope_addresses_are_stripped() {
        let mut s = session(Recorder::default());
        s.process(&msg(b'M', b"<user@domain.com>\x00SIZE=100\x00")).unwrap();
        s.process(&msg(b'R', b"<rcpt@domain.com>\x00")).unwrap();
        s.process(&msg(b'M', b"<>\x00")).unwrap();
        s.process(&msg(b'H', b"mx.domain.com\x00")).unwrap();
        assert_eq!(
            s.milter.calls,
            [
                Call::MailFrom("user@domain.com".into()),
                Call::RcptTo("rcpt@domain.com".into()),
                Call::MailFrom(String::new()),
                Call::Helo("mx.domain.com".into()),
            ]
        );
    }

    #[test]
    fn negotiate_reply() {
        let mut s = session(Recorder::default());
        let response = s.process(&msg(b'O', b"\0\0\0\x06\0\0\x01\xff\0\x1f\xff\xff")).unwrap();
        assert_eq!(
            response,
            Some(Response::custom(
                b'O',
                b"\0\0\0\x02\0\0\0\x01\0\0\0\x02".to_vec()
            ))
        );
    }

    #[test]
    fn callback_error_is_reported() {
        let mut s = session(Recorder {
            fail_helo: true,
            ..Default::default()
        });
        match s.process(&msg(b'H', b"x\0")) {
            Err(Error::Callback(e)) => assert_eq!(e.to_string(), "helo refused"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn modifier_writes_go_out_before_reply() {
        let mut s = session_with_input(
            Recorder::default(),
            &[
                msg(b'D', b"Ei\x004F2A1\x00"),
                msg(b'E', b""),
                msg(b'H', b"never read\x00"),
            ],
        );
        let end = {
            let mut packets = Vec::new();
            loop {
                let packet = s.read_packet().unwrap();
                if let Some(response) = s.process(&packet).unwrap() {
                    s.write_packet(&response.to_message()).unwrap();
                    packets.push(response);
                    break;
                }
            }
            packets
        };
        assert_eq!(end, [Response::ACCEPT]);
        assert_eq!(
            written(&mut s),
            [msg(b'h', b"X-Checked\0yes\0"), msg(b'a', b"")]
        );
        assert_eq!(
            s.milter.calls,
            [Call::EndOfBody(HashMap::from([(
                "i".to_string(),
                "4F2A1".to_string()
            )]))]
        );
    }

    #[test]
    fn loop_stops_after_terminal_response() {
        let mut s = session_with_input(
            Recorder::default(),
            &[
                msg(b'O', b""),
                msg(b'H', b"mx\0"),
                msg(b'E', b""),
                msg(b'H', b"never read\x00"),
            ],
        );
        assert_eq!(s.run().unwrap(), SessionEnd::Completed(b'a'));
        assert_eq!(
            s.milter.calls,
            [Call::Helo("mx".into()), Call::EndOfBody(HashMap::new())]
        );
        // the packet after the terminal response is still queued
        assert_eq!(s.read_packet().unwrap(), msg(b'H', b"never read\x00"));
    }

    #[test]
    fn loop_continues_on_non_terminal_end_of_body() {
        let s = session_with_input(
            Recorder {
                end_of_body: Some(Response::CONTINUE),
                ..Default::default()
            },
            &[msg(b'E', b""), msg(b'A', b""), msg(b'Q', b"")],
        );
        assert_eq!(s.handle_commands().unwrap(), SessionEnd::Quit);
    }

    #[test]
    fn loop_ends_quietly_on_eof() {
        let s = session_with_input(Recorder::default(), &[msg(b'H', b"mx\0")]);
        assert_eq!(s.handle_commands().unwrap(), SessionEnd::Disconnected);
    }

    #[test]
    fn loop_reports_short_read() {
        let mut s = session(Recorder::default());
        s.transport.get_mut().input = Cursor::new(b"\0\0\0\x09Hmx".to_vec());
        assert!(matches!(s.handle_commands(), Err(Error::Io(_))));
    }

    #[test]
    fn quit_writes_nothing() {
        let mut s = session_with_input(Recorder::default(), &[msg(b'Q', b"")]);
        let packet = s.read_packet().unwrap();
        assert!(matches!(s.process(&packet), Err(Error::CloseSession)));
        assert!(written(&mut s).is_empty());
    }

    #[test]
    fn test_anglestrip() {
        assert_eq!(anglestrip("<a@b>"), "a@b");
        assert_eq!(anglestrip("<>"), "");
        assert_eq!(anglestrip("<a@b"), "<a@b");
        assert_eq!(anglestrip("a@b>"), "a@b>");
        assert_eq!(anglestrip("a@b"), "a@b");
    }
}
