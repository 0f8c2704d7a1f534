//! Channel-level errors.

use crate::cipher::CipherError;
use crate::handshake::HandshakeError;
use crate::identity::PeerId;
use crate::protocol::ProtocolError;
use crate::session::{StoreError, TransitionError};
use crate::transfer::TransferError;
use crate::wire::{FrameDecodeError, FrameEncodeError};

/// How an error ends the channel. Both classes are fatal; the split is for callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    FatalChannel,
    ProtocolViolation,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("malformed envelope: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("connection from {0} refused")]
    ConnectRefused(PeerId),
    #[error("peer closed channel: {0}")]
    PeerClosed(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("action handler failed: {0}")]
    Action(#[source] anyhow::Error),
    #[error("no resumable session {0:?}")]
    SessionNotFound(String),
}

impl From<bincode::Error> for ChannelError {
    fn from(e: bincode::Error) -> Self {
        ChannelError::Protocol(ProtocolError::Payload(e))
    }
}

impl ChannelError {
    pub fn violation(msg: impl Into<String>) -> Self {
        ChannelError::ProtocolViolation(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ChannelError::ProtocolViolation(_)
            | ChannelError::Transition(_)
            | ChannelError::SessionNotFound(_) => ErrorClass::ProtocolViolation,
            ChannelError::Transfer(e) => match e {
                TransferError::Violation(_)
                | TransferError::InvalidName(_)
                | TransferError::SizeMismatch { .. }
                | TransferError::DigestMismatch(_) => ErrorClass::ProtocolViolation,
                _ => ErrorClass::FatalChannel,
            },
            _ => ErrorClass::FatalChannel,
        }
    }
}
