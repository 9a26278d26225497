//! Pairing-code negotiation with bounded retries.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use super::protocol::Connection;

/// Result of a negotiation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Raw code as returned by the library.
    Code(String),
    NotObtained,
}

/// Requests a pairing code up to `max_attempts` times, `interval` apart.
#[derive(Debug, Clone)]
pub struct PairingNegotiator {
    max_attempts: u32,
    interval: Duration,
}

impl PairingNegotiator {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// The first non-empty code wins. Errors count as failed attempts.
    pub async fn negotiate(&self, connection: &dyn Connection, phone: &str) -> PairingOutcome {
        for attempt in 1..=self.max_attempts {
            match connection.request_pairing_code(phone).await {
                Ok(Some(code)) if !code.trim().is_empty() => {
                    info!("🔑 Pairing code obtained on attempt {attempt}/{}", self.max_attempts);
                    return PairingOutcome::Code(code);
                }
                Ok(_) => warn!("Pairing attempt {attempt}/{} returned no code", self.max_attempts),
                Err(e) => warn!("Pairing attempt {attempt}/{} failed: {e}", self.max_attempts),
            }

            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }

        warn!("No pairing code after {} attempts", self.max_attempts);
        PairingOutcome::NotObtained
    }
}

/// Group a raw code into 4-character blocks joined by `-`.
///
/// `"ABCD1234EFGH"` becomes `"ABCD-1234-EFGH"`.
pub fn format_pairing_code(raw: &str) -> String {
    let compact: Vec<char> = raw.chars().filter(|c| !c.is_whitespace()).collect();
    compact
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Keep only the digits of a phone number.
pub fn phone_digits(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}
