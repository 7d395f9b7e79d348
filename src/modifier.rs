use crate::error::Result;
use crate::headers::Headers;
use crate::message::{RawMessage, action};
use crate::response::Response;
use std::collections::HashMap;

/// Writes one packet to the MTA.
pub type WritePacket<'a> = dyn FnMut(&RawMessage) -> Result<()> + 'a;

/// View of the current session handed to each callback.
///
/// Exposes the macros and headers received so far and the message
/// modifications. Each modification is sent to the MTA as soon as it is
/// called; a write failure is returned to the callback.
pub struct Modifier<'a> {
    macros: &'a HashMap<String, String>,
    headers: &'a Headers,
    write_packet: &'a mut WritePacket<'a>,
}

impl<'a> Modifier<'a> {
    pub fn new(
        macros: &'a HashMap<String, String>,
        headers: &'a Headers,
        write_packet: &'a mut WritePacket<'a>,
    ) -> Self {
        Self {
            macros,
            headers,
            write_packet,
        }
    }

    /// Macros sent by the MTA for the current command.
    pub fn macros(&self) -> &'a HashMap<String, String> {
        self.macros
    }

    pub fn macro_value(&self, name: &str) -> Option<&'a str> {
        self.macros.get(name).map(String::as_str)
    }

    /// Headers received so far for the current message.
    pub fn headers(&self) -> &'a Headers {
        self.headers
    }

    fn send(&mut self, response: Response) -> Result<()> {
        (self.write_packet)(&response.to_message())
    }

    /// Adds an envelope recipient. Needs `SMFIF_ADDRCPT`.
    pub fn add_recipient(&mut self, recipient: &str) -> Result<()> {
        self.send(Response::custom_str(
            action::ADD_RCPT,
            &format!("<{recipient}>"),
        ))
    }

    /// Removes an envelope recipient. Needs `SMFIF_DELRCPT`.
    pub fn delete_recipient(&mut self, recipient: &str) -> Result<()> {
        self.send(Response::custom_str(
            action::DEL_RCPT,
            &format!("<{recipient}>"),
        ))
    }

    /// Replaces the message body. Needs `SMFIF_CHGBODY`.
    pub fn replace_body(&mut self, body: &[u8]) -> Result<()> {
        self.send(Response::custom(action::REPLACE_BODY, body))
    }

    /// Appends a header. Needs `SMFIF_ADDHDRS`.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.send(Response::custom(action::ADD_HEADER, header_field(None, name, value)))
    }

    /// Inserts a header at `index`. Needs `SMFIF_ADDHDRS`.
    pub fn insert_header(&mut self, index: u32, name: &str, value: &str) -> Result<()> {
        self.send(Response::custom(
            action::INSERT_HEADER,
            header_field(Some(index), name, value),
        ))
    }

    /// Replaces the `index`th occurrence (1-based) of header `name`; an empty
    /// value deletes it. Needs `SMFIF_CHGHDRS`.
    pub fn change_header(&mut self, index: u32, name: &str, value: &str) -> Result<()> {
        self.send(Response::custom(
            action::CHANGE_HEADER,
            header_field(Some(index), name, value),
        ))
    }

    /// Replaces the envelope sender. Needs `SMFIF_CHGFROM`.
    pub fn change_from(&mut self, sender: &str) -> Result<()> {
        self.send(Response::custom_str(action::CHANGE_FROM, sender))
    }

    /// Puts the message on hold. Needs `SMFIF_QUARANTINE`.
    pub fn quarantine(&mut self, reason: &str) -> Result<()> {
        self.send(Response::custom_str(action::QUARANTINE, reason))
    }
}

fn header_field(index: Option<u32>, name: &str, value: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(name.len() + value.len() + 6);
    if let Some(index) = index {
        data.extend_from_slice(&index.to_be_bytes());
    }
    data.extend_from_slice(name.as_bytes());
    data.push(0);
    data.extend_from_slice(value.as_bytes());
    data.push(0);
    data
}
