//! Session: durable record of one request/reply exchange, and where it is kept.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::protocol::ControlMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Issued the request.
    Initiator,
    /// Services the request.
    Handler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    Initial,
    RequestTransferring,
    /// Handler only: request files are all in, reply not yet sent.
    RequestReceived,
    ReplyTransferring,
    Done,
}

impl SessionState {
    /// Next state along the exchange for `role`, `None` once done.
    pub fn successor(self, role: SessionRole) -> Option<SessionState> {
        match (self, role) {
            (SessionState::Initial, _) => Some(SessionState::RequestTransferring),
            (SessionState::RequestTransferring, SessionRole::Handler) => {
                Some(SessionState::RequestReceived)
            }
            (SessionState::RequestTransferring, SessionRole::Initiator) => {
                Some(SessionState::ReplyTransferring)
            }
            (SessionState::RequestReceived, _) => Some(SessionState::ReplyTransferring),
            (SessionState::ReplyTransferring, _) => Some(SessionState::Done),
            (SessionState::Done, _) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub peer_id: PeerId,
    pub role: SessionRole,
    pub state: SessionState,
    pub request: Option<ControlMessage>,
    pub reply: Option<ControlMessage>,
    /// Names we advertised and will serve on `GetFile`.
    pub files_provided: Vec<String>,
    /// Names the peer advertised for us to fetch.
    pub files_accessible: Vec<String>,
    /// Fetched files, by advertised name, in fetch order.
    #[serde(default)]
    pub received: BTreeMap<String, PathBuf>,
    /// Working directory for received files.
    #[serde(default)]
    pub dir: PathBuf,
}

impl Session {
    pub fn new(id: impl Into<String>, peer_id: PeerId, role: SessionRole, work_dir: &Path) -> Self {
        let id = id.into();
        let dir = work_dir.join(&id);
        Self {
            id,
            peer_id,
            role,
            state: SessionState::Initial,
            request: None,
            reply: None,
            files_provided: Vec::new(),
            files_accessible: Vec::new(),
            received: BTreeMap::new(),
            dir,
        }
    }

    /// Move one step forward. Skips and reversals are rejected.
    pub fn advance(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if self.state.successor(self.role) != Some(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
                role: self.role,
            });
        }
        tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.state == SessionState::Done
    }

    pub fn is_provided(&self, name: &str) -> bool {
        self.files_provided.iter().any(|f| f == name)
    }

    /// Accessible files not fetched yet, in advertised order.
    pub fn pending_files(&self) -> Vec<String> {
        self.files_accessible
            .iter()
            .filter(|f| !self.received.contains_key(*f))
            .cloned()
            .collect()
    }

    /// Local paths of fetched files, in advertised order.
    pub fn received_paths(&self) -> Vec<PathBuf> {
        self.files_accessible
            .iter()
            .filter_map(|f| self.received.get(f).cloned())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid session transition {from:?} -> {to:?} for {role:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
    pub role: SessionRole,
}

/// Checkpoint storage for sessions.
pub trait SessionStore: Send + Sync {
    fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
    fn save(&self, session: &Session) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid session id {0:?}")]
    InvalidId(String),
}

/// One pretty-printed JSON file per session under `root`.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(session_id.to_string()));
        }
        Ok(self.root.join(format!("{session_id}.json")))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.path(session_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.path(&session.id)?;
        std::fs::create_dir_all(&self.root)?;
        let content = serde_json::to_vec_pretty(session)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            tracing::error!(from = %tmp_path.display(), to = %path.display(), error = %e, "session rename failed");
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

/// In-process store; sessions survive as long as the store does.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| std::io::Error::other("session store poisoned"))?;
        Ok(sessions.get(session_id).cloned())
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| std::io::Error::other("session store poisoned"))?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }
}
