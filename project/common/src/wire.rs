//! Plain-ASCII payloads exchanged on the election and health ports. One
//! message per TCP connection, no framing beyond read-until-deadline.

use std::fmt;

/// Health probe request, exactly 4 bytes.
pub const PING: &[u8] = b"PING";
/// Health probe reply, exactly 4 bytes.
pub const PONG: &[u8] = b"PONG";

/// Messages of the Bully election protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMessage {
    /// "I claim leadership unless someone higher responds."
    Election,
    /// "I am alive and outrank you; stand down": the reply to [`Election`](Self::Election).
    Ok,
    /// Leadership announcement; doubles as the heartbeat.
    Leader,
}

impl ElectionMessage {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Election => b"ELECTION",
            Self::Ok => b"OK",
            Self::Leader => b"LEADER",
        }
    }

    /// Decodes a raw payload. Anything that is not an exact message is
    /// `None`; the caller drops the connection silently.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"ELECTION" => Some(Self::Election),
            b"OK" => Some(Self::Ok),
            b"LEADER" => Some(Self::Leader),
            _ => None,
        }
    }
}

impl fmt::Display for ElectionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Election => write!(f, "ELECTION"),
            Self::Ok => write!(f, "OK"),
            Self::Leader => write!(f, "LEADER"),
        }
    }
}

#[macro_export]
macro_rules! log_error {
    ($maybe_error:expr) => {
        if let Err(e) = $maybe_error {
            $crate::_private::error!("{e:#}");
        }
    };
}
