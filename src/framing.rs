//! Packet framing: `length:u32be | code:u8 | data`, where `length` counts the
//! code byte plus the data.

use crate::error::{Error, Result};
use crate::message::RawMessage;
use std::io::{self, Read, Write};

/// Largest accepted packet: a full 64KB body chunk plus headroom for the code
/// and anything the MTA adds.
pub const MAX_PACKET_LEN: u32 = 65536 + 4096;

pub trait ReadExt {
    fn read_u8(&mut self) -> io::Result<u8>;
    /// Reads a big-endian length prefix. `None` if the stream ends before its
    /// first byte.
    fn read_frame_len(&mut self) -> io::Result<Option<u32>>;
    fn read_bytes(&mut self, len: usize, data: &mut Vec<u8>) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_frame_len(&mut self) -> io::Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }
        Ok(Some(u32::from_be_bytes(buf)))
    }

    fn read_bytes(&mut self, len: usize, data: &mut Vec<u8>) -> io::Result<()> {
        data.resize(len, 0u8);
        self.read_exact(data)?;
        Ok(())
    }
}

/// Reads one packet. A stream that ends cleanly between packets yields
/// [`Error::Disconnected`]; one that ends inside a packet is an I/O error.
pub fn read_packet(reader: &mut impl Read) -> Result<RawMessage> {
    let len = reader.read_frame_len()?.ok_or(Error::Disconnected)?;
    if len == 0 {
        return Err(Error::EmptyPacket);
    }
    if len > MAX_PACKET_LEN {
        return Err(Error::PacketTooLarge(len));
    }
    let code = reader.read_u8()?;
    let mut data = Vec::new();
    reader.read_bytes(len as usize - 1, &mut data)?;
    Ok(RawMessage { code, data })
}

/// Writes one packet as a single buffer and flushes it.
pub fn write_packet(writer: &mut impl Write, msg: &RawMessage) -> Result<()> {
    let len = u32::try_from(msg.data.len() + 1)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too long"))?;
    let mut frame = Vec::with_capacity(msg.data.len() + 5);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(msg.code);
    frame.extend_from_slice(&msg.data);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

#[test]
fn test_read_frame_len() {
    let input = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    let mut reader = &input[..];
    assert_eq!(reader.read_frame_len().unwrap(), Some(0x11223344));
    let err = reader.read_frame_len().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    assert_eq!(reader.read_frame_len().unwrap(), None);
}

#[test]
fn test_read_bytes() {
    let input = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    let mut reader = &input[..];
    let mut out: Vec<u8> = Vec::new();
    reader.read_bytes(3, &mut out).unwrap();
    assert_eq!(out, [0x11, 0x22, 0x33]);
    reader.read_bytes(0, &mut out).unwrap();
    assert!(out.is_empty());
    reader.read_bytes(4, &mut out).unwrap_err();
}

#[test]
fn test_write_packet_layout() {
    let mut out = Vec::new();
    write_packet(&mut out, &RawMessage::new(b'h', b"X\0y\0".to_vec())).unwrap();
    assert_eq!(out, b"\0\0\0\x05hX\0y\0");

    out.clear();
    write_packet(&mut out, &RawMessage::new(b'c', Vec::new())).unwrap();
    assert_eq!(out, b"\0\0\0\x01c");
}

#[test]
fn test_read_packet() {
    let input = b"\0\0\0\x06Hhost\0\0\0\0\x01T";
    let mut reader = &input[..];
    assert_eq!(
        read_packet(&mut reader).unwrap(),
        RawMessage::new(b'H', b"host\0".to_vec())
    );
    assert_eq!(
        read_packet(&mut reader).unwrap(),
        RawMessage::new(b'T', Vec::new())
    );
    assert!(matches!(read_packet(&mut reader), Err(Error::Disconnected)));
}

#[test]
fn test_read_packet_short_block() {
    // declares 2 bytes, delivers 1
    let input = b"\0\0\0\x02a";
    let mut reader = &input[..];
    match read_packet(&mut reader) {
        Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_read_packet_bad_length() {
    let mut reader = &b"\0\0\0\0"[..];
    assert!(matches!(read_packet(&mut reader), Err(Error::EmptyPacket)));

    let too_long = (MAX_PACKET_LEN + 1).to_be_bytes();
    let mut reader = &too_long[..];
    assert!(matches!(
        read_packet(&mut reader),
        Err(Error::PacketTooLarge(len)) if len == MAX_PACKET_LEN + 1
    ));
}

#[test]
fn test_round_trip_over_socket() {
    use std::os::unix::net::UnixStream;
    use std::thread;

    let (mut a, mut b) = UnixStream::pair().unwrap();
    let data: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    let sent = RawMessage::new(b'B', data);
    let expected = sent.clone();
    let writer = thread::spawn(move || write_packet(&mut a, &sent).unwrap());
    let received = read_packet(&mut b).unwrap();
    writer.join().unwrap();
    assert_eq!(received, expected);
}
