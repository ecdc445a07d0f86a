//! Wire framing constants and the 4-byte command parser.

use crate::error::ProtocolError;

pub const COMMAND_LENGTH: usize = 4;
pub const PASSWORD_LENGTH: usize = 40;

pub const COMMAND_OPEN: &[u8; 4] = b"OPEN";
pub const COMMAND_TEST: &[u8; 4] = b"TEST";
pub const COMMAND_STAT: &[u8; 4] = b"STAT";
pub const COMMAND_INFO: &[u8; 4] = b"INFO";

pub const REPLY_OK: &[u8] = b"OK";
pub const REPLY_ERROR_COMMAND: &[u8] = b"ERROR_COMMAND";
pub const REPLY_ERROR_TICKET: &[u8] = b"ERROR_TICKET";
pub const REPLY_FORBIDDEN: &[u8] = b"FORBIDDEN";

/// A parsed 4-byte command header, before its argument has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Test,
    Stat,
    Info,
}

impl Command {
    /// Parse the first 4 bytes of a connection into a known command.
    pub fn parse(head: &[u8; 4]) -> Result<Self, ProtocolError> {
        match head {
            COMMAND_OPEN => Ok(Command::Open),
            COMMAND_TEST => Ok(Command::Test),
            COMMAND_STAT => Ok(Command::Stat),
            COMMAND_INFO => Ok(Command::Info),
            other => Err(ProtocolError::UnknownCommand(*other)),
        }
    }

    /// Number of argument bytes that must follow the 4-byte command before
    /// it can be dispatched.
    pub fn argument_len(self) -> usize {
        match self {
            Command::Open => crate::ticket::TICKET_LENGTH,
            Command::Test => 0,
            Command::Stat | Command::Info => PASSWORD_LENGTH,
        }
    }
}
