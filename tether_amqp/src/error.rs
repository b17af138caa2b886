use crate::ReturnedMessage;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Shorthand for results produced by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The reason given by the broker when it closes a channel or a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloseReason {
    /// The AMQP reply code.
    pub code: u16,
    /// The human-readable reply text.
    pub text: String,
}

impl CloseReason {
    /// `312 NO_ROUTE`: a mandatory message could not be routed.
    pub const NO_ROUTE: u16 = 312;
    /// `320 CONNECTION_FORCED`: an operator closed the connection.
    pub const CONNECTION_FORCED: u16 = 320;
    /// `403 ACCESS_REFUSED`.
    pub const ACCESS_REFUSED: u16 = 403;
    /// `404 NOT_FOUND`: the referenced entity does not exist.
    pub const NOT_FOUND: u16 = 404;
    /// `405 RESOURCE_LOCKED`: the entity is exclusive to another connection.
    pub const RESOURCE_LOCKED: u16 = 405;
    /// `406 PRECONDITION_FAILED`: e.g., re-declaring with different properties.
    pub const PRECONDITION_FAILED: u16 = 406;
    /// `530 NOT_ALLOWED`.
    pub const NOT_ALLOWED: u16 = 530;

    /// Creates a new close reason.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Reports whether the broker reported a missing entity.
    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }

    /// Reports whether the broker reported a failed precondition.
    pub fn is_precondition_failed(&self) -> bool {
        self.code == Self::PRECONDITION_FAILED
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Represents every failure surfaced by connections, channels and topology
/// entities of this crate.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Could not connect to the broker, or the link to it has been lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The connection has been closed and will not come back.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The channel has been closed, either explicitly or by the broker.
    #[error("channel is closed ({})", describe_reason(.0))]
    ChannelClosed(Option<CloseReason>),

    /// The operation is not allowed, and was refused without contacting the
    /// broker.
    #[error("operation not allowed: {0}")]
    Policy(String),

    /// A basic get found no message in the queue.
    #[error("queue '{0}' is empty")]
    QueueEmpty(String),

    /// The operation did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The broker returned a mandatory message as unroutable.
    #[error("message returned by the broker: {} {}", .0.reply_code(), .0.reply_text())]
    MessageReturned(Box<ReturnedMessage>),

    /// The broker negatively acknowledged a published message.
    #[error("message was negatively acknowledged by the broker")]
    Nacked,

    /// The message body could not be decoded.
    #[error("failed to decode message: {0}")]
    Deserialization(String),

    /// The waiting was cancelled because the owner went away.
    #[error("operation cancelled")]
    Cancelled,
}

fn describe_reason(reason: &Option<CloseReason>) -> String {
    match reason {
        Some(reason) => reason.to_string(),
        None => "no reason given".to_string(),
    }
}

impl Error {
    /// Reports whether this error indicates a dead link to the broker, as
    /// opposed to an error in the operation itself.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Exposes the broker's close reason, if this error carries one.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Error::ChannelClosed(reason) => reason.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_channel_closed() {
        // Given
        let with_reason = Error::ChannelClosed(Some(CloseReason::new(404, "NOT_FOUND - no queue")));
        let without_reason = Error::ChannelClosed(None);

        // Then
        assert_eq!(
            with_reason.to_string(),
            "channel is closed (404 NOT_FOUND - no queue)",
        );
        assert_eq!(without_reason.to_string(), "channel is closed (no reason given)");
    }

    #[test]
    fn link_loss() {
        assert!(Error::Connection("reset by peer".into()).is_link_loss());
        assert!(!Error::ChannelClosed(None).is_link_loss());
        assert!(!Error::ConnectionClosed.is_link_loss());
    }
}
