//! xbridge: encrypted, resumable request/reply sessions between two peers.
//! One byte stream per channel; the host supplies the stream and the collaborators.

pub mod archive;
pub mod channel;
pub mod cipher;
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod integrity;
pub mod permission;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod subscriber;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use archive::{Archive, TarArchive};
pub use channel::{Channel, ChannelBuilder, InitMessage, Outcome, ReplyCallback};
pub use cipher::CipherContext;
pub use config::ChannelConfig;
pub use error::{ChannelError, ErrorClass};
pub use identity::{Identity, Keypair, PeerId};
pub use permission::{Permission, PermissionRules};
pub use protocol::{ControlMessage, Envelope, EnvelopeKind, MsgType, Param, PROTOCOL_VERSION};
pub use registry::{ActionRegistry, HandlerMap};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionState, SessionStore};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
