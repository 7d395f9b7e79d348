use log::info;
use milterd::milter::constants::*;
use milterd::{CallbackResult, Milter, Modifier, Response};
use std::process::ExitCode;

/// Logs the envelope and stamps each message with an `X-Milterd` header.
#[derive(Default)]
struct Stamp {
    helo: String,
    recipients: usize,
}

impl Milter for Stamp {
    fn helo(&mut self, name: &str, _m: &mut Modifier<'_>) -> CallbackResult {
        self.helo = name.to_string();
        Ok(Response::CONTINUE)
    }

    fn mail_from(&mut self, sender: &str, m: &mut Modifier<'_>) -> CallbackResult {
        let id = m.macro_value("i").unwrap_or("-");
        info!("{id}: from <{sender}> helo {}", self.helo);
        self.recipients = 0;
        Ok(Response::CONTINUE)
    }

    fn rcpt_to(&mut self, recipient: &str, m: &mut Modifier<'_>) -> CallbackResult {
        let id = m.macro_value("i").unwrap_or("-");
        info!("{id}: to <{recipient}>");
        self.recipients += 1;
        Ok(Response::CONTINUE)
    }

    fn end_of_body(&mut self, m: &mut Modifier<'_>) -> CallbackResult {
        let stamp = format!("helo={}; recipients={}", self.helo, self.recipients);
        m.add_header("X-Milterd", &stamp)?;
        Ok(Response::ACCEPT)
    }
}

fn main() -> ExitCode {
    let protocol = SMFIP_NOCONNECT | SMFIP_NOHDRS | SMFIP_NOEOH | SMFIP_NOBODY;
    match milterd::cli::cli(move || (Stamp::default(), SMFIF_ADDHDRS, protocol)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
