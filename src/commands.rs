//! Link command triggers.
//!
//! Code mode: `#code`, `.code`, `code` or `/code`, followed by a phone number.
//! QR mode: `#qr`, `.qr`, `qr` or `/qr`. Telegram's `/code@botname` form is
//! accepted too.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::linking::pairing::phone_digits;

static TRIGGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*[#./]?(code|qr)(?:@\w+)?(?:\s+(.*))?$").expect("valid trigger regex"));

/// E.164 numbers carry at most 15 digits.
const PHONE_DIGITS: std::ops::RangeInclusive<usize> = 7..=15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Link by pairing code for `phone` (digits only).
    Code { phone: String },
    Qr,
    /// A code trigger without a usable phone number.
    CodeUsage,
}

/// Parse a chat message into a link command. `None` for anything else.
pub fn parse_command(text: &str) -> Option<LinkCommand> {
    let captures = TRIGGER.captures(text)?;
    let keyword = captures.get(1)?.as_str().to_ascii_lowercase();
    let rest = captures.get(2).map(|m| m.as_str().trim()).unwrap_or_default();

    match keyword.as_str() {
        "qr" if rest.is_empty() => Some(LinkCommand::Qr),
        "code" => {
            let phone = phone_digits(rest);
            if PHONE_DIGITS.contains(&phone.len()) {
                Some(LinkCommand::Code { phone })
            } else {
                Some(LinkCommand::CodeUsage)
            }
        }
        _ => None,
    }
}

pub const CODE_USAGE: &str = "Usage: /code <phone number with country code>, e.g. /code +52 1 555 000 1234";

/// Reply for a request still inside its cooldown. Seconds are rounded up.
pub fn cooldown_reply(remaining: Duration) -> String {
    let secs = remaining.as_millis().div_ceil(1000);
    format!("⏳ Please wait {secs}s before requesting another link.")
}
