//! The 48-byte alphanumeric one-shot ticket redeemed on `OPEN`.

use crate::error::ProtocolError;

pub const TICKET_LENGTH: usize = 48;

/// A ticket that has already been validated for length and charset.
///
/// Constructing a `Ticket` is the only way bytes from the wire reach the
/// broker client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ticket(String);

impl Ticket {
    /// Validate `raw` as a ticket. Fails closed on wrong length or any byte
    /// outside `[A-Za-z0-9]`.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() != TICKET_LENGTH {
            return Err(ProtocolError::BadTicketLength(raw.len()));
        }
        for (pos, &b) in raw.iter().enumerate() {
            if !b.is_ascii_alphanumeric() {
                return Err(ProtocolError::BadTicketChar(pos));
            }
        }
        // Safe: every byte is ASCII alphanumeric.
        Ok(Ticket(String::from_utf8(raw.to_vec()).unwrap()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket_of(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    #[test]
    fn accepts_48_alphanumeric_bytes() {
        let raw = ticket_of(b'A', 48);
        let ticket = Ticket::parse(&raw).expect("valid ticket");
        assert_eq!(ticket.as_str().len(), 48);
    }

    #[test]
    fn rejects_47_bytes() {
        let raw = ticket_of(b'A', 47);
        match Ticket::parse(&raw) {
            Err(ProtocolError::BadTicketLength(47)) => {}
            other => panic!("expected BadTicketLength(47), got {other:?}"),
        }
    }

    #[test]
    fn rejects_49_bytes() {
        let raw = ticket_of(b'A', 49);
        match Ticket::parse(&raw) {
            Err(ProtocolError::BadTicketLength(49)) => {}
            other => panic!("expected BadTicketLength(49), got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_alphanumeric_byte() {
        let mut raw = ticket_of(b'A', 48);
        raw[10] = b'-';
        match Ticket::parse(&raw) {
            Err(ProtocolError::BadTicketChar(10)) => {}
            other => panic!("expected BadTicketChar(10), got {other:?}"),
        }
    }
}
