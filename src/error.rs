use thiserror::Error;

/// The error type returned by the public surface of the crate.
///
/// Argument validation fails synchronously with [`ClientError::InvalidArg`]
/// and never mutates any state. Everything else is wrapped in
/// [`ClientError::Other`] with enough context to diagnose the failure.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An argument failed validation before any work was attempted.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    /// The tick source could not provide the current time.
    #[error("tick source is unavailable")]
    IndefiniteTime,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        ClientError::Other(anyhow::anyhow!(message.into()))
    }
}

/// The outcome reported to a send-confirmation callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// The message was accepted by the hub.
    Ok,
    /// The message could not be sent, for example because it exceeds the
    /// transport's size cap.
    Error,
    /// The per-message timeout elapsed before the transport claimed the
    /// message.
    MessageTimeout,
    /// The client was destroyed while the message was still queued.
    Destroyed,
}

/// Connection state reported through the connection-status callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Authenticated,
    Unauthenticated,
}

/// The reason accompanying a connection-status change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatusReason {
    ExpiredSasToken,
    DeviceDisabled,
    BadCredential,
    RetryExpired,
    NoNetwork,
    CommunicationError,
    Ok,
}
