//! xbridge wire protocol: envelopes, handshake messages and control messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cipher::{CipherContext, CipherError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// First param of a `Reply` that refuses an action.
pub const REFUSED_ACTION: &str = "refused action";

/// Outermost wire unit. `File` and `Encrypted` payloads need a cipher to interpret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Hello,
    Connect,
    Complete,
    /// Raw encrypted file chunk for the transfer in flight.
    File,
    /// Encrypted [`ControlMessage`].
    Encrypted,
}

/// First handshake message, one per peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Key exchange (client -> server) or its acknowledgement (server -> client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connect {
    Exchange {
        encrypted_key: Vec<u8>,
        encrypted_iv: Vec<u8>,
        signature: Vec<u8>,
    },
    Ack,
}

/// Terminal notice: the sender is closing the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complete {
    pub reason: String,
}

impl Envelope {
    pub fn hello(hello: &Hello) -> Result<Self, bincode::Error> {
        Self::plain(EnvelopeKind::Hello, hello)
    }

    pub fn connect(connect: &Connect) -> Result<Self, bincode::Error> {
        Self::plain(EnvelopeKind::Connect, connect)
    }

    pub fn complete(reason: impl Into<String>) -> Result<Self, bincode::Error> {
        Self::plain(
            EnvelopeKind::Complete,
            &Complete {
                reason: reason.into(),
            },
        )
    }

    /// An already-encrypted file chunk.
    pub fn file(chunk: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::File,
            payload: chunk,
        }
    }

    /// Serialize then encrypt a control message.
    pub fn encrypted(msg: &ControlMessage, cipher: &CipherContext) -> Result<Self, ProtocolError> {
        let plain = bincode::serialize(msg)?;
        Ok(Self {
            kind: EnvelopeKind::Encrypted,
            payload: cipher.encrypt(&plain)?,
        })
    }

    fn plain<T: Serialize>(kind: EnvelopeKind, body: &T) -> Result<Self, bincode::Error> {
        Ok(Self {
            kind,
            payload: bincode::serialize(body)?,
        })
    }

    pub fn open_hello(&self) -> Result<Hello, ProtocolError> {
        self.open_plain(EnvelopeKind::Hello)
    }

    pub fn open_connect(&self) -> Result<Connect, ProtocolError> {
        self.open_plain(EnvelopeKind::Connect)
    }

    pub fn open_complete(&self) -> Result<Complete, ProtocolError> {
        self.open_plain(EnvelopeKind::Complete)
    }

    /// Decrypt then parse an `Encrypted` payload.
    pub fn open_control(&self, cipher: &CipherContext) -> Result<ControlMessage, ProtocolError> {
        self.expect_kind(EnvelopeKind::Encrypted)?;
        let plain = cipher.decrypt(&self.payload)?;
        Ok(bincode::deserialize(&plain)?)
    }

    fn open_plain<T: for<'de> Deserialize<'de>>(
        &self,
        kind: EnvelopeKind,
    ) -> Result<T, ProtocolError> {
        self.expect_kind(kind)?;
        Ok(bincode::deserialize(&self.payload)?)
    }

    fn expect_kind(&self, kind: EnvelopeKind) -> Result<(), ProtocolError> {
        if self.kind != kind {
            return Err(ProtocolError::WrongKind {
                expected: kind,
                got: self.kind,
            });
        }
        Ok(())
    }
}

/// Control message types carried inside `Encrypted` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Request,
    Reply,
    Done,
    Later,
    Resume,
    GetFile,
    SendFileCipher,
    SendFileInfo,
    SendFileEnd,
}

/// A single positional parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Param {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Param::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Param::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Param {
    fn from(s: &str) -> Self {
        Param::Str(s.to_string())
    }
}

impl From<String> for Param {
    fn from(s: String) -> Self {
        Param::Str(s)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Bytes(v)
    }
}

/// Typed step of the request/reply exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub kind: MsgType,
    pub session_id: String,
    pub params: Vec<Param>,
    /// Filenames the sender offers to the peer. Empty means none.
    pub files: Vec<String>,
    pub action: Option<String>,
}

impl ControlMessage {
    pub fn new(kind: MsgType, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            params: Vec::new(),
            files: Vec::new(),
            action: None,
        }
    }

    /// New request with a fresh session id.
    pub fn request(action: impl Into<String>, params: Vec<Param>, files: Vec<String>) -> Self {
        Self {
            kind: MsgType::Request,
            session_id: uuid::Uuid::new_v4().to_string(),
            params,
            files,
            action: Some(action.into()),
        }
    }

    pub fn reply(
        session_id: impl Into<String>,
        action: Option<String>,
        params: Vec<Param>,
        files: Vec<String>,
    ) -> Self {
        Self {
            kind: MsgType::Reply,
            session_id: session_id.into(),
            params,
            files,
            action,
        }
    }

    /// Reply refusing `request`'s action; offers no files.
    pub fn refusal(request: &ControlMessage) -> Self {
        Self::reply(
            request.session_id.clone(),
            request.action.clone(),
            vec![Param::from(REFUSED_ACTION)],
            Vec::new(),
        )
    }

    pub fn resume(session_id: impl Into<String>) -> Self {
        Self::new(MsgType::Resume, session_id)
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self
    }

    pub fn is_refusal(&self) -> bool {
        self.kind == MsgType::Reply
            && self.params.first().and_then(Param::as_str) == Some(REFUSED_ACTION)
    }

    pub fn action(&self) -> &str {
        self.action.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.kind, self.session_id)?;
        if let Some(action) = &self.action {
            write!(f, " action={action}")?;
        }
        if !self.params.is_empty() {
            write!(f, " params={}", self.params.len())?;
        }
        if !self.files.is_empty() {
            write!(f, " files={:?}", self.files)?;
        }
        Ok(())
    }
}

/// How a transferred file must be materialised by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    Plain,
    /// Tar archive of a directory; unpack after the last chunk.
    TarArchived,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Plain => "plain",
            FileFormat::TarArchived => "tar",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(FileFormat::Plain),
            "tar" => Some(FileFormat::TarArchived),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected {expected:?} envelope, got {got:?}")]
    WrongKind {
        expected: EnvelopeKind,
        got: EnvelopeKind,
    },
    #[error("payload decode error: {0}")]
    Payload(#[from] bincode::Error),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}
