//! Channel: handshake, then one request/reply session over a single stream.
//!
//! [`Channel::run`] splits the stream into a [`Subscriber`] task (inbound), a
//! writer task (outbound) and the driver below, which owns the [`Session`],
//! blocks on the event queue and walks the session state machine. Every
//! state transition and every received file is checkpointed to the
//! [`SessionStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::archive::{Archive, TarArchive};
use crate::cipher::CipherContext;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::handshake::{self, ChannelRole, HandshakeState};
use crate::identity::{Identity, PeerId};
use crate::permission::{Permission, PermissionRules};
use crate::protocol::{Connect, ControlMessage, Envelope, MsgType};
use crate::registry::{ActionRegistry, HandlerMap};
use crate::session::{Session, SessionRole, SessionState, SessionStore};
use crate::subscriber::{IncomingEvent, Subscriber, SubscriberCommand};
use crate::transfer::{self, FileSender};
use crate::transport;

/// Called on the initiator with the reply and the local paths of the reply's files.
pub type ReplyCallback = Arc<dyn Fn(&ControlMessage, &[PathBuf]) + Send + Sync>;

/// How the client opens the session.
#[derive(Debug, Clone)]
pub enum InitMessage {
    Request(ControlMessage),
    Resume(String),
}

/// Result of one [`Channel::run`].
#[derive(Debug)]
pub enum Outcome {
    /// Session reached `Done`.
    Completed,
    /// Checkpointed after `Later`; resume with the same session id.
    Suspended,
    Failed(ChannelError),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

pub struct Channel {
    identity: Arc<dyn Identity>,
    permission: Arc<dyn Permission>,
    registry: Arc<dyn ActionRegistry>,
    store: Arc<dyn SessionStore>,
    archive: Arc<dyn Archive>,
    config: ChannelConfig,
    on_reply: Option<ReplyCallback>,
}

pub struct ChannelBuilder {
    identity: Arc<dyn Identity>,
    store: Arc<dyn SessionStore>,
    permission: Option<Arc<dyn Permission>>,
    registry: Option<Arc<dyn ActionRegistry>>,
    archive: Option<Arc<dyn Archive>>,
    config: ChannelConfig,
    on_reply: Option<ReplyCallback>,
}

impl ChannelBuilder {
    /// Defaults to [`PermissionRules::default`], which refuses every peer.
    pub fn permission(mut self, permission: Arc<dyn Permission>) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_reply<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ControlMessage, &[PathBuf]) + Send + Sync + 'static,
    {
        self.on_reply = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Channel {
        Channel {
            identity: self.identity,
            permission: self
                .permission
                .unwrap_or_else(|| Arc::new(PermissionRules::default())),
            registry: self.registry.unwrap_or_else(|| Arc::new(HandlerMap::new())),
            store: self.store,
            archive: self.archive.unwrap_or_else(|| Arc::new(TarArchive)),
            config: self.config,
            on_reply: self.on_reply,
        }
    }
}

impl Channel {
    pub fn builder(identity: Arc<dyn Identity>, store: Arc<dyn SessionStore>) -> ChannelBuilder {
        ChannelBuilder {
            identity,
            store,
            permission: None,
            registry: None,
            archive: None,
            config: ChannelConfig::default(),
            on_reply: None,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Drive one channel over `stream`. With `init` we are the client and
    /// open (or resume) the session; without it we serve the peer's.
    pub async fn run<S>(&self, stream: S, init: Option<InitMessage>) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let subscriber = Subscriber::new(
            reader,
            event_tx,
            cmd_rx,
            shutdown_rx,
            self.archive.clone(),
            &self.config,
        );
        let subscriber = tokio::spawn(subscriber.run());
        let writer = tokio::spawn(transport::run_writer(writer, out_rx));

        let role = if init.is_some() {
            ChannelRole::Client
        } else {
            ChannelRole::Server
        };
        let mut driver = Driver {
            channel: self,
            role,
            handshake: HandshakeState::NotStarted,
            out: out_tx,
            events: event_rx,
            commands: cmd_tx,
            cipher: None,
            peer: None,
            closed: false,
        };
        let mut session = None;
        let result = driver.drive(init, &mut session).await;
        let outcome = driver.teardown(result, session.as_ref()).await;
        drop(driver);

        // Joins the subscriber and any receive worker it still runs.
        let _ = shutdown_tx.send(());
        if let Err(e) = subscriber.await {
            tracing::debug!(error = %e, "subscriber task failed");
        }
        if let Ok(Err(e)) = writer.await {
            tracing::debug!(error = %e, "writer ended with error");
        }
        outcome
    }
}

struct Driver<'a> {
    channel: &'a Channel,
    role: ChannelRole,
    handshake: HandshakeState,
    out: mpsc::Sender<Envelope>,
    events: mpsc::UnboundedReceiver<IncomingEvent>,
    commands: mpsc::UnboundedSender<SubscriberCommand>,
    cipher: Option<CipherContext>,
    peer: Option<PeerId>,
    /// Peer already closed; no `Complete` on teardown.
    closed: bool,
}

impl Driver<'_> {
    async fn drive(
        &mut self,
        init: Option<InitMessage>,
        slot: &mut Option<Session>,
    ) -> Result<Outcome, ChannelError> {
        let peer = match self.role {
            ChannelRole::Client => self.client_handshake().await,
            ChannelRole::Server => self.server_handshake().await,
        }
        .inspect_err(|_| self.set_handshake(HandshakeState::Failed))?;
        self.set_handshake(HandshakeState::Ready);
        tracing::info!(peer = %peer, role = ?self.role, "channel ready");

        let session = slot.insert(self.open_session(init, peer).await?);
        tracing::info!(session = %session.id, role = ?session.role, state = ?session.state, "session open");
        self.run_session(session).await
    }

    async fn run_session(&mut self, session: &mut Session) -> Result<Outcome, ChannelError> {
        loop {
            match (session.role, session.state) {
                (_, SessionState::Done) => return Ok(Outcome::Completed),
                (_, SessionState::Initial) => {
                    return Err(ChannelError::violation("session never left Initial"));
                }
                (SessionRole::Initiator, SessionState::RequestTransferring) => {
                    let msg = self.serve_until(session).await?;
                    match msg.kind {
                        MsgType::Reply => {
                            tracing::info!(session = %session.id, refused = msg.is_refusal(), "reply received");
                            session.files_accessible = msg.files.clone();
                            session.reply = Some(msg);
                            self.advance(session, SessionState::ReplyTransferring)?;
                        }
                        MsgType::Later => {
                            tracing::info!(session = %session.id, "peer asked to resume later");
                            return Ok(Outcome::Suspended);
                        }
                        _ => return Err(unexpected(&msg, session.state)),
                    }
                }
                (SessionRole::Handler, SessionState::RequestTransferring) => {
                    for name in session.pending_files() {
                        self.request_file(session, &name).await?;
                    }
                    self.advance(session, SessionState::RequestReceived)?;
                }
                (SessionRole::Handler, SessionState::RequestReceived) => {
                    if session.reply.is_none() {
                        match self.run_action(session).await? {
                            Some(reply) => {
                                session.reply = Some(reply);
                                self.checkpoint(session)?;
                            }
                            None => {
                                let later = ControlMessage::new(MsgType::Later, &session.id);
                                self.send_control(&later).await?;
                                return Ok(Outcome::Suspended);
                            }
                        }
                    }
                    let reply = session
                        .reply
                        .clone()
                        .ok_or_else(|| ChannelError::violation("no reply recorded"))?;
                    session.files_provided = reply.files.clone();
                    self.send_control(&reply).await?;
                    self.advance(session, SessionState::ReplyTransferring)?;
                }
                (SessionRole::Initiator, SessionState::RequestReceived) => {
                    return Err(ChannelError::violation(
                        "initiator session in RequestReceived",
                    ));
                }
                (SessionRole::Initiator, SessionState::ReplyTransferring) => {
                    for name in session.pending_files() {
                        self.request_file(session, &name).await?;
                    }
                    if let (Some(callback), Some(reply)) =
                        (self.channel.on_reply.as_ref(), session.reply.as_ref())
                    {
                        callback(reply, &session.received_paths());
                    }
                    self.send_control(&ControlMessage::new(MsgType::Done, &session.id))
                        .await?;
                    self.advance(session, SessionState::Done)?;
                }
                (SessionRole::Handler, SessionState::ReplyTransferring) => {
                    let msg = self.serve_until(session).await?;
                    if msg.kind != MsgType::Done {
                        return Err(unexpected(&msg, session.state));
                    }
                    self.advance(session, SessionState::Done)?;
                }
            }
        }
    }

    async fn client_handshake(&mut self) -> Result<PeerId, ChannelError> {
        let channel = self.channel;
        let identity = channel.identity.as_ref();
        let nonce = handshake::random_nonce();
        self.send(Envelope::hello(&handshake::hello(identity, &nonce))?)
            .await?;
        self.set_handshake(HandshakeState::HelloSent);

        let server_hello = match self.next_event().await? {
            IncomingEvent::Hello(hello) => hello,
            other => return Err(unexpected_event(&other, "Hello")),
        };
        let peer = handshake::accept_hello(&server_hello)?;
        self.set_handshake(HandshakeState::HelloReceived);

        let (cipher, connect) = handshake::client_key_exchange(identity, &server_hello, &nonce)?;
        self.install_cipher(cipher)?;
        self.send(Envelope::connect(&connect)?).await?;
        self.set_handshake(HandshakeState::KeyExchanged);

        match self.next_event().await? {
            IncomingEvent::Connect(Connect::Ack) => {}
            other => return Err(unexpected_event(&other, "Connect(Ack)")),
        }
        self.peer = Some(peer);
        Ok(peer)
    }

    async fn server_handshake(&mut self) -> Result<PeerId, ChannelError> {
        let channel = self.channel;
        let identity = channel.identity.as_ref();
        let client_hello = match self.next_event().await? {
            IncomingEvent::Hello(hello) => hello,
            other => return Err(unexpected_event(&other, "Hello")),
        };
        let peer = handshake::accept_hello(&client_hello)?;
        self.set_handshake(HandshakeState::HelloReceived);
        if !channel.permission.allow_connect(&peer) {
            tracing::warn!(peer = %peer, "connection refused");
            return Err(ChannelError::ConnectRefused(peer));
        }

        let nonce = handshake::random_nonce();
        self.send(Envelope::hello(&handshake::hello(identity, &nonce))?)
            .await?;
        self.set_handshake(HandshakeState::HelloSent);

        let connect = match self.next_event().await? {
            IncomingEvent::Connect(connect) => connect,
            other => return Err(unexpected_event(&other, "Connect")),
        };
        let cipher = handshake::server_accept(identity, &client_hello, &connect, &nonce)?;
        self.set_handshake(HandshakeState::KeyExchanged);
        self.install_cipher(cipher)?;
        self.send(Envelope::connect(&Connect::Ack)?).await?;
        self.peer = Some(peer);
        Ok(peer)
    }

    async fn open_session(
        &mut self,
        init: Option<InitMessage>,
        peer: PeerId,
    ) -> Result<Session, ChannelError> {
        let channel = self.channel;
        match init {
            Some(InitMessage::Request(request)) => {
                if request.kind != MsgType::Request {
                    return Err(ChannelError::violation(format!(
                        "cannot open a session with {}",
                        request
                    )));
                }
                let mut session = Session::new(
                    request.session_id.clone(),
                    peer,
                    SessionRole::Initiator,
                    &channel.config.work_dir,
                );
                session.files_provided = request.files.clone();
                session.request = Some(request.clone());
                self.send_control(&request).await?;
                self.advance(&mut session, SessionState::RequestTransferring)?;
                Ok(session)
            }
            Some(InitMessage::Resume(id)) => {
                let session = self.resumable(&id, peer, SessionRole::Initiator)?;
                self.send_control(&ControlMessage::resume(&id)).await?;
                Ok(session)
            }
            None => {
                let msg = self.next_control().await?;
                match msg.kind {
                    MsgType::Request => self.accept_request(msg, peer),
                    MsgType::Resume => {
                        let session =
                            self.resumable(&msg.session_id, peer, SessionRole::Handler)?;
                        if session.state == SessionState::ReplyTransferring {
                            // The initiator may never have seen the reply.
                            let reply = session
                                .reply
                                .as_ref()
                                .ok_or_else(|| ChannelError::violation("no reply recorded"))?;
                            tracing::debug!(session = %session.id, "re-sending reply on resume");
                            self.send_control(reply).await?;
                        }
                        Ok(session)
                    }
                    _ => Err(unexpected(&msg, SessionState::Initial)),
                }
            }
        }
    }

    fn accept_request(
        &self,
        request: ControlMessage,
        peer: PeerId,
    ) -> Result<Session, ChannelError> {
        if self.channel.store.load(&request.session_id)?.is_some() {
            return Err(ChannelError::violation(format!(
                "session {} already exists",
                request.session_id
            )));
        }
        let mut session = Session::new(
            request.session_id.clone(),
            peer,
            SessionRole::Handler,
            &self.channel.config.work_dir,
        );
        if self.channel.permission.allow_action(&peer, request.action()) {
            session.files_accessible = request.files.clone();
        } else {
            tracing::info!(session = %session.id, peer = %peer, action = request.action(), "action refused");
            session.reply = Some(ControlMessage::refusal(&request));
        }
        session.request = Some(request);
        self.advance(&mut session, SessionState::RequestTransferring)?;
        Ok(session)
    }

    /// Reload a checkpointed session for the same peer and role.
    fn resumable(
        &self,
        id: &str,
        peer: PeerId,
        role: SessionRole,
    ) -> Result<Session, ChannelError> {
        let session = self
            .channel
            .store
            .load(id)?
            .ok_or_else(|| ChannelError::SessionNotFound(id.to_string()))?;
        if session.peer_id != peer {
            return Err(ChannelError::violation(format!(
                "session {id} belongs to another peer"
            )));
        }
        if session.role != role {
            return Err(ChannelError::violation(format!(
                "session {id} has role {:?}",
                session.role
            )));
        }
        if session.state == SessionState::Initial {
            return Err(ChannelError::violation(format!(
                "session {id} was never started"
            )));
        }
        Ok(session)
    }

    /// Serve `GetFile` until any other control message arrives.
    async fn serve_until(&mut self, session: &Session) -> Result<ControlMessage, ChannelError> {
        loop {
            let msg = self.next_control().await?;
            if msg.kind != MsgType::GetFile {
                return Ok(msg);
            }
            self.serve_file(session, &msg).await?;
        }
    }

    async fn serve_file(
        &self,
        session: &Session,
        msg: &ControlMessage,
    ) -> Result<(), ChannelError> {
        let name = transfer::requested_name(msg)?;
        if !session.is_provided(name) {
            return Err(ChannelError::violation(format!(
                "peer requested unadvertised file {name:?}"
            )));
        }
        let path = Path::new(name);
        if !path.exists() {
            return Err(ChannelError::violation(format!(
                "advertised file {name:?} does not exist"
            )));
        }
        let config = &self.channel.config;
        let mut sender = FileSender::prepare(
            path,
            &session.id,
            self.cipher()?,
            self.channel.archive.clone(),
            &config.work_dir.join(".outgoing"),
            config.chunk_size,
        )
        .await?;
        tracing::info!(session = %session.id, file = name, size = sender.info().size, "sending file");
        while let Some(envelope) = sender.next_envelope().await? {
            self.send(envelope).await?;
        }
        Ok(())
    }

    async fn request_file(
        &mut self,
        session: &mut Session,
        name: &str,
    ) -> Result<(), ChannelError> {
        // The subscriber must know where to put the file before the peer can answer.
        self.command(SubscriberCommand::ExpectFile {
            dest_dir: session.dir.clone(),
        })?;
        self.send_control(&transfer::get_file_message(&session.id, name))
            .await?;
        let path = loop {
            match self.next_event().await? {
                IncomingEvent::FileReceived(path) => break path,
                IncomingEvent::Control(msg) if is_repeated_reply(&msg, session) => {
                    tracing::debug!(session = %session.id, "ignoring repeated reply");
                }
                other => return Err(unexpected_event(&other, "file transfer")),
            }
        };
        tracing::info!(session = %session.id, file = name, path = %path.display(), "file received");
        session.received.insert(name.to_string(), path);
        self.checkpoint(session)
    }

    /// Run the registered action. `None` when there is no handler or it yields nothing.
    async fn run_action(&self, session: &Session) -> Result<Option<ControlMessage>, ChannelError> {
        let request = session
            .request
            .as_ref()
            .ok_or_else(|| ChannelError::violation("session has no request"))?;
        let Some(handler) = self.channel.registry.lookup(request.action()) else {
            tracing::info!(session = %session.id, action = request.action(), "no handler for action");
            return Ok(None);
        };
        let mut replies = handler(request.clone(), session.received_paths());
        let mut last = None;
        while let Some(reply) = replies.next().await {
            last = Some(reply.map_err(ChannelError::Action)?);
        }
        Ok(last.map(|mut reply| {
            reply.kind = MsgType::Reply;
            reply.session_id = session.id.clone();
            reply
        }))
    }

    fn advance(&self, session: &mut Session, next: SessionState) -> Result<(), ChannelError> {
        session.advance(next)?;
        self.checkpoint(session)
    }

    fn checkpoint(&self, session: &Session) -> Result<(), ChannelError> {
        Ok(self.channel.store.save(session)?)
    }

    async fn teardown(
        &self,
        result: Result<Outcome, ChannelError>,
        session: Option<&Session>,
    ) -> Outcome {
        let (outcome, reason) = match result {
            Ok(Outcome::Completed) => (Outcome::Completed, "done".to_string()),
            Ok(Outcome::Suspended) => (Outcome::Suspended, "later".to_string()),
            Ok(Outcome::Failed(e)) | Err(e) => {
                tracing::warn!(peer = ?self.peer, class = ?e.class(), error = %e, "channel failed");
                let reason = e.to_string();
                (Outcome::Failed(e), reason)
            }
        };
        if !self.closed {
            if let Ok(envelope) = Envelope::complete(reason) {
                let _ = self.out.send(envelope).await;
            }
        }
        if let Some(session) = session {
            if let Err(e) = self.channel.store.save(session) {
                tracing::error!(session = %session.id, error = %e, "failed to persist session");
            }
        }
        outcome
    }

    async fn next_event(&mut self) -> Result<IncomingEvent, ChannelError> {
        match self.events.recv().await {
            Some(IncomingEvent::Complete(reason)) => {
                self.closed = true;
                Err(ChannelError::PeerClosed(reason))
            }
            Some(IncomingEvent::Failed(e)) => Err(e),
            Some(event) => Ok(event),
            None => {
                self.closed = true;
                Err(ChannelError::PeerClosed("inbound stream gone".into()))
            }
        }
    }

    async fn next_control(&mut self) -> Result<ControlMessage, ChannelError> {
        match self.next_event().await? {
            IncomingEvent::Control(msg) => Ok(msg),
            other => Err(unexpected_event(&other, "control message")),
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.out
            .send(envelope)
            .await
            .map_err(|_| ChannelError::PeerClosed("outbound stream gone".into()))
    }

    async fn send_control(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        tracing::debug!(msg = %msg, "send");
        self.send(Envelope::encrypted(msg, self.cipher()?)?).await
    }

    fn install_cipher(&mut self, cipher: CipherContext) -> Result<(), ChannelError> {
        self.command(SubscriberCommand::InstallCipher(cipher.clone()))?;
        self.cipher = Some(cipher);
        Ok(())
    }

    fn command(&self, cmd: SubscriberCommand) -> Result<(), ChannelError> {
        self.commands
            .send(cmd)
            .map_err(|_| ChannelError::PeerClosed("inbound stream gone".into()))
    }

    fn cipher(&self) -> Result<&CipherContext, ChannelError> {
        self.cipher
            .as_ref()
            .ok_or_else(|| ChannelError::violation("no session cipher"))
    }

    fn set_handshake(&mut self, state: HandshakeState) {
        tracing::debug!(from = ?self.handshake, to = ?state, "handshake");
        self.handshake = state;
    }
}

/// A handler resumed in `ReplyTransferring` sends its reply again; an
/// initiator already past `Reply` skips it.
fn is_repeated_reply(msg: &ControlMessage, session: &Session) -> bool {
    msg.kind == MsgType::Reply
        && msg.session_id == session.id
        && session.role == SessionRole::Initiator
        && session.state == SessionState::ReplyTransferring
}

fn unexpected(msg: &ControlMessage, state: SessionState) -> ChannelError {
    ChannelError::violation(format!("unexpected {msg} in {state:?}"))
}

fn unexpected_event(event: &IncomingEvent, wanted: &str) -> ChannelError {
    let got = match event {
        IncomingEvent::Hello(_) => "Hello".to_string(),
        IncomingEvent::Connect(_) => "Connect".to_string(),
        IncomingEvent::Complete(reason) => format!("Complete({reason})"),
        IncomingEvent::Control(msg) => msg.to_string(),
        IncomingEvent::FileReceived(path) => format!("file {}", path.display()),
        IncomingEvent::Failed(e) => e.to_string(),
    };
    ChannelError::violation(format!("expected {wanted}, got {got}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::handshake::{accept_hello, hello, random_nonce, server_accept};
    use crate::identity::Keypair;
    use crate::protocol::{Param, REFUSED_ACTION};
    use crate::session::MemorySessionStore;
    use crate::transport::{read_envelope, write_envelope};
    use crate::wire::MAX_FRAME_LEN;

    struct Peer {
        keypair: Arc<Keypair>,
        store: Arc<MemorySessionStore>,
        work: tempfile::TempDir,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                keypair: Arc::new(Keypair::generate()),
                store: Arc::new(MemorySessionStore::new()),
                work: tempfile::tempdir().unwrap(),
            }
        }

        fn builder(&self) -> ChannelBuilder {
            Channel::builder(self.keypair.clone(), self.store.clone()).config(ChannelConfig {
                chunk_size: 1000,
                ..ChannelConfig::with_work_dir(self.work.path())
            })
        }

        fn session(&self, id: &str) -> Session {
            self.store.load(id).unwrap().unwrap()
        }
    }

    type Replies = Arc<Mutex<Vec<(ControlMessage, Vec<PathBuf>)>>>;

    fn recording(builder: ChannelBuilder) -> (ChannelBuilder, Replies) {
        let replies: Replies = Arc::default();
        let sink = replies.clone();
        let builder = builder.on_reply(move |reply, paths| {
            sink.lock().unwrap().push((reply.clone(), paths.to_vec()));
        });
        (builder, replies)
    }

    async fn pair(client: &Channel, server: &Channel, init: InitMessage) -> (Outcome, Outcome) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::join!(client.run(a, Some(init)), server.run(b, None))
    }

    /// A session as a previous run on `local` would have checkpointed it.
    fn parked(
        local: &Peer,
        remote: &Peer,
        id: &str,
        role: SessionRole,
        state: SessionState,
    ) -> Session {
        let mut session = Session::new(id, remote.keypair.fingerprint(), role, local.work.path());
        session.state = state;
        session
    }

    async fn resume(client: &Channel, server: &Channel, id: &str) -> (Outcome, Outcome) {
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            pair(client, server, InitMessage::Resume(id.to_string())),
        )
        .await
        .expect("resume stalled")
    }

    fn trusting(peer: &Peer, actions: &[&str]) -> Arc<PermissionRules> {
        let mut rules = PermissionRules::default();
        rules.grant(&peer.keypair.fingerprint(), actions);
        Arc::new(rules)
    }

    #[tokio::test]
    async fn request_reply_with_files_both_ways() {
        let alice = Peer::new();
        let bob = Peer::new();

        let src = tempfile::tempdir().unwrap();
        let upload = src.path().join("a.txt");
        let upload_bytes: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&upload, &upload_bytes).unwrap();

        let results = tempfile::tempdir().unwrap();
        let result_dir = results.path().join("report");
        std::fs::create_dir_all(result_dir.join("img")).unwrap();
        std::fs::write(result_dir.join("summary.txt"), b"ok").unwrap();
        std::fs::write(result_dir.join("img/plot.bin"), vec![5u8; 4321]).unwrap();

        let seen: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
        let seen_by_handler = seen.clone();
        let reply_file = result_dir.display().to_string();
        let mut handlers = HandlerMap::new();
        handlers.register_fn("echo", move |req, files| {
            seen_by_handler.lock().unwrap().extend(files.iter().cloned());
            Ok(ControlMessage::reply(
                &req.session_id,
                req.action.clone(),
                req.params.clone(),
                vec![reply_file.clone()],
            ))
        });

        let (client, replies) = recording(alice.builder());
        let client = client.build();
        let server = bob
            .builder()
            .permission(trusting(&alice, &["echo"]))
            .registry(Arc::new(handlers))
            .build();

        let request = ControlMessage::request(
            "echo",
            vec![Param::from("hi")],
            vec![upload.display().to_string()],
        );
        let id = request.session_id.clone();
        let (c, s) = pair(&client, &server, InitMessage::Request(request)).await;
        assert!(c.is_completed(), "client: {c:?}");
        assert!(s.is_completed(), "server: {s:?}");

        let fetched = seen.lock().unwrap().clone();
        assert_eq!(fetched, vec![bob.work.path().join(&id).join("a.txt")]);
        assert_eq!(std::fs::read(&fetched[0]).unwrap(), upload_bytes);

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        let (reply, paths) = &replies[0];
        assert_eq!(reply.params, vec![Param::from("hi")]);
        let unpacked = alice.work.path().join(&id).join("report");
        assert_eq!(paths, &vec![unpacked.clone()]);
        assert_eq!(std::fs::read(unpacked.join("summary.txt")).unwrap(), b"ok");
        assert_eq!(
            std::fs::read(unpacked.join("img/plot.bin")).unwrap(),
            vec![5u8; 4321]
        );

        assert_eq!(alice.session(&id).state, SessionState::Done);
        assert_eq!(bob.session(&id).state, SessionState::Done);
        assert_eq!(bob.session(&id).files_provided, vec![result_dir.display().to_string()]);
    }

    #[tokio::test]
    async fn refused_action_completes_without_transfer() {
        let alice = Peer::new();
        let bob = Peer::new();
        let src = tempfile::tempdir().unwrap();
        let upload = src.path().join("a.txt");
        std::fs::write(&upload, b"secret").unwrap();

        let (client, replies) = recording(alice.builder());
        let client = client.build();
        // Alice may connect but has no actions.
        let server = bob.builder().permission(trusting(&alice, &[])).build();

        let request =
            ControlMessage::request("echo", vec![], vec![upload.display().to_string()]);
        let id = request.session_id.clone();
        let (c, s) = pair(&client, &server, InitMessage::Request(request)).await;
        assert!(c.is_completed(), "client: {c:?}");
        assert!(s.is_completed(), "server: {s:?}");

        let replies = replies.lock().unwrap();
        let (reply, paths) = &replies[0];
        assert!(reply.is_refusal());
        assert_eq!(reply.params[0], Param::from(REFUSED_ACTION));
        assert!(paths.is_empty());
        assert!(!bob.work.path().join(&id).exists());
        let handler_session = bob.session(&id);
        assert!(handler_session.files_accessible.is_empty());
        assert!(handler_session.received.is_empty());
    }

    #[tokio::test]
    async fn later_then_resume_without_refetch() {
        let alice = Peer::new();
        let bob = Peer::new();
        let src = tempfile::tempdir().unwrap();
        let upload = src.path().join("a.txt");
        std::fs::write(&upload, b"payload").unwrap();

        // No handler registered yet: bob fetches the file, then says Later.
        let client = alice.builder().build();
        let server = bob.builder().permission(trusting(&alice, &["*"])).build();
        let request =
            ControlMessage::request("slow", vec![], vec![upload.display().to_string()]);
        let id = request.session_id.clone();
        let (c, s) = pair(&client, &server, InitMessage::Request(request)).await;
        assert!(matches!(c, Outcome::Suspended), "client: {c:?}");
        assert!(matches!(s, Outcome::Suspended), "server: {s:?}");
        assert_eq!(alice.session(&id).state, SessionState::RequestTransferring);
        let parked = bob.session(&id);
        assert_eq!(parked.state, SessionState::RequestReceived);
        assert_eq!(parked.received.len(), 1);

        // The file is gone from the initiator; a re-fetch would fail.
        std::fs::remove_file(&upload).unwrap();

        let calls: Arc<Mutex<Vec<Vec<PathBuf>>>> = Arc::default();
        let calls_seen = calls.clone();
        let mut handlers = HandlerMap::new();
        handlers.register_fn("slow", move |req, files| {
            calls_seen.lock().unwrap().push(files.to_vec());
            Ok(ControlMessage::reply(&req.session_id, None, vec![Param::from(1i64)], vec![]))
        });
        let (client, replies) = recording(alice.builder());
        let client = client.build();
        let server = bob
            .builder()
            .permission(trusting(&alice, &["*"]))
            .registry(Arc::new(handlers))
            .build();
        let (c, s) = pair(&client, &server, InitMessage::Resume(id.clone())).await;
        assert!(c.is_completed(), "client: {c:?}");
        assert!(s.is_completed(), "server: {s:?}");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![bob.work.path().join(&id).join("a.txt")]);
        assert!(!bob.work.path().join(&id).join("dup-1").exists());
        assert_eq!(replies.lock().unwrap()[0].0.params, vec![Param::from(1i64)]);
        assert_eq!(bob.session(&id).state, SessionState::Done);
    }

    #[tokio::test]
    async fn missing_advertised_file_fails_both_sides() {
        let alice = Peer::new();
        let bob = Peer::new();
        let client = alice.builder().build();
        let server = bob.builder().permission(trusting(&alice, &["*"])).build();

        let missing = alice.work.path().join("nope.txt").display().to_string();
        let request = ControlMessage::request("echo", vec![], vec![missing]);
        let id = request.session_id.clone();
        let (c, s) = pair(&client, &server, InitMessage::Request(request)).await;
        match c {
            Outcome::Failed(e) => assert_eq!(e.class(), crate::error::ErrorClass::ProtocolViolation),
            other => panic!("client: {other:?}"),
        }
        assert!(matches!(s, Outcome::Failed(ChannelError::PeerClosed(_))), "server: {s:?}");
        assert!(bob.session(&id).received.is_empty());
    }

    #[tokio::test]
    async fn connect_refused() {
        let alice = Peer::new();
        let bob = Peer::new();
        let client = alice.builder().build();
        let server = bob.builder().build();
        let (c, s) = pair(
            &client,
            &server,
            InitMessage::Request(ControlMessage::request("echo", vec![], vec![])),
        )
        .await;
        match s {
            Outcome::Failed(ChannelError::ConnectRefused(peer)) => {
                assert_eq!(peer, alice.keypair.fingerprint())
            }
            other => panic!("server: {other:?}"),
        }
        assert!(matches!(c, Outcome::Failed(ChannelError::PeerClosed(_))), "client: {c:?}");
        assert!(alice.store.is_empty());
        assert!(bob.store.is_empty());
    }

    #[tokio::test]
    async fn resume_of_unknown_session_is_rejected() {
        let alice = Peer::new();
        let bob = Peer::new();
        let client = alice.builder().build();
        let server = bob.builder().permission(trusting(&alice, &["*"])).build();
        let (c, _) = pair(&client, &server, InitMessage::Resume("missing".into())).await;
        assert!(matches!(c, Outcome::Failed(ChannelError::SessionNotFound(_))));
    }

    /// Reply plus one result file, recorded by a handler that already sent it.
    fn recorded_reply(id: &str, result_file: &Path) -> ControlMessage {
        ControlMessage::reply(
            id,
            None,
            vec![Param::from(7i64)],
            vec![result_file.display().to_string()],
        )
    }

    fn park_handler_after_reply(
        bob: &Peer,
        alice: &Peer,
        request: &ControlMessage,
        reply: &ControlMessage,
    ) {
        let mut handler = parked(
            bob,
            alice,
            &request.session_id,
            SessionRole::Handler,
            SessionState::ReplyTransferring,
        );
        handler.request = Some(request.clone());
        handler.files_provided = reply.files.clone();
        handler.reply = Some(reply.clone());
        bob.store.save(&handler).unwrap();
    }

    #[tokio::test]
    async fn resume_after_reply_lost_in_transit() {
        let alice = Peer::new();
        let bob = Peer::new();
        let results = tempfile::tempdir().unwrap();
        let result_file = results.path().join("out.txt");
        std::fs::write(&result_file, b"result").unwrap();

        let request = ControlMessage::request("echo", vec![], vec![]);
        let id = request.session_id.clone();
        let reply = recorded_reply(&id, &result_file);
        // Bob sent the reply and moved on; the link dropped before Alice saw it.
        let mut initiator = parked(
            &alice,
            &bob,
            &id,
            SessionRole::Initiator,
            SessionState::RequestTransferring,
        );
        initiator.request = Some(request.clone());
        alice.store.save(&initiator).unwrap();
        park_handler_after_reply(&bob, &alice, &request, &reply);

        let (client, replies) = recording(alice.builder());
        let client = client.build();
        let server = bob.builder().permission(trusting(&alice, &["*"])).build();
        let (c, s) = resume(&client, &server, &id).await;
        assert!(c.is_completed(), "client: {c:?}");
        assert!(s.is_completed(), "server: {s:?}");

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.params, vec![Param::from(7i64)]);
        let fetched = alice.work.path().join(&id).join("out.txt");
        assert_eq!(replies[0].1, vec![fetched.clone()]);
        assert_eq!(std::fs::read(fetched).unwrap(), b"result");
        assert_eq!(alice.session(&id).state, SessionState::Done);
        assert_eq!(bob.session(&id).state, SessionState::Done);
    }

    #[tokio::test]
    async fn resume_mid_reply_fetch_skips_repeated_reply() {
        let alice = Peer::new();
        let bob = Peer::new();
        let results = tempfile::tempdir().unwrap();
        let result_file = results.path().join("out.txt");
        std::fs::write(&result_file, b"result").unwrap();

        let request = ControlMessage::request("echo", vec![], vec![]);
        let id = request.session_id.clone();
        let reply = recorded_reply(&id, &result_file);
        // Both sides past the reply, result file not fetched yet.
        let mut initiator = parked(
            &alice,
            &bob,
            &id,
            SessionRole::Initiator,
            SessionState::ReplyTransferring,
        );
        initiator.request = Some(request.clone());
        initiator.files_accessible = reply.files.clone();
        initiator.reply = Some(reply.clone());
        alice.store.save(&initiator).unwrap();
        park_handler_after_reply(&bob, &alice, &request, &reply);

        let (client, replies) = recording(alice.builder());
        let client = client.build();
        let server = bob.builder().permission(trusting(&alice, &["*"])).build();
        let (c, s) = resume(&client, &server, &id).await;
        assert!(c.is_completed(), "client: {c:?}");
        assert!(s.is_completed(), "server: {s:?}");

        assert_eq!(replies.lock().unwrap().len(), 1);
        let dir = alice.work.path().join(&id);
        assert_eq!(std::fs::read(dir.join("out.txt")).unwrap(), b"result");
        assert!(!dir.join("dup-1").exists());
        assert_eq!(alice.session(&id).received.len(), 1);
    }

    /// Alice holds a valid initiator checkpoint; bob's record for the id is `handler`.
    async fn resume_against(alice: &Peer, bob: &Peer, handler: Session) -> (Outcome, Outcome) {
        let mut initiator = parked(
            alice,
            bob,
            &handler.id,
            SessionRole::Initiator,
            SessionState::RequestTransferring,
        );
        initiator.request = Some(ControlMessage::request("echo", vec![], vec![]));
        alice.store.save(&initiator).unwrap();
        bob.store.save(&handler).unwrap();
        let client = alice.builder().build();
        let server = bob.builder().permission(trusting(alice, &["*"])).build();
        resume(&client, &server, &handler.id).await
    }

    #[tokio::test]
    async fn resume_of_another_peers_session_is_violation() {
        let alice = Peer::new();
        let bob = Peer::new();
        let carol = Peer::new();
        let handler = parked(
            &bob,
            &carol,
            "s-carol",
            SessionRole::Handler,
            SessionState::RequestReceived,
        );
        let (c, s) = resume_against(&alice, &bob, handler.clone()).await;
        assert!(matches!(s, Outcome::Failed(ChannelError::ProtocolViolation(_))), "server: {s:?}");
        assert!(!c.is_completed(), "client: {c:?}");
        assert_eq!(bob.session("s-carol"), handler);
    }

    #[tokio::test]
    async fn resume_with_wrong_role_is_violation() {
        let alice = Peer::new();
        let bob = Peer::new();
        let mirrored = parked(
            &bob,
            &alice,
            "s-role",
            SessionRole::Initiator,
            SessionState::RequestTransferring,
        );
        let (c, s) = resume_against(&alice, &bob, mirrored).await;
        assert!(matches!(s, Outcome::Failed(ChannelError::ProtocolViolation(_))), "server: {s:?}");
        assert!(!c.is_completed(), "client: {c:?}");
        assert_eq!(bob.session("s-role").state, SessionState::RequestTransferring);
    }

    #[tokio::test]
    async fn resume_of_unstarted_session_is_violation() {
        let alice = Peer::new();
        let bob = Peer::new();
        let unstarted = parked(
            &bob,
            &alice,
            "s-initial",
            SessionRole::Handler,
            SessionState::Initial,
        );
        let (c, s) = resume_against(&alice, &bob, unstarted).await;
        assert!(matches!(s, Outcome::Failed(ChannelError::ProtocolViolation(_))), "server: {s:?}");
        assert!(!c.is_completed(), "client: {c:?}");

        // Same check on the initiator's own checkpoint.
        let unstarted = parked(
            &alice,
            &bob,
            "s-initial-2",
            SessionRole::Initiator,
            SessionState::Initial,
        );
        alice.store.save(&unstarted).unwrap();
        let client = alice.builder().build();
        let server = bob.builder().permission(trusting(&alice, &["*"])).build();
        let (c, _) = resume(&client, &server, "s-initial-2").await;
        assert!(matches!(c, Outcome::Failed(ChannelError::ProtocolViolation(_))), "client: {c:?}");
    }

    /// A hand-driven handler that asks for a file the initiator never offered.
    #[tokio::test]
    async fn unadvertised_get_file_is_never_served() {
        let alice = Peer::new();
        let rogue = Keypair::generate();
        let src = tempfile::tempdir().unwrap();
        let offered = src.path().join("a.txt");
        let secret = src.path().join("secret.txt");
        std::fs::write(&offered, b"fine").unwrap();
        std::fs::write(&secret, b"do not send").unwrap();

        let client = alice.builder().build();
        let request =
            ControlMessage::request("echo", vec![], vec![offered.display().to_string()]);
        let id = request.session_id.clone();
        let (a, mut b) = tokio::io::duplex(64 * 1024);

        let rogue_side = async move {
            let client_hello = read_envelope(&mut b, MAX_FRAME_LEN)
                .await
                .unwrap()
                .unwrap()
                .open_hello()
                .unwrap();
            accept_hello(&client_hello).unwrap();
            let nonce = random_nonce();
            write_envelope(&mut b, &Envelope::hello(&hello(&rogue, &nonce)).unwrap())
                .await
                .unwrap();
            let connect = read_envelope(&mut b, MAX_FRAME_LEN)
                .await
                .unwrap()
                .unwrap()
                .open_connect()
                .unwrap();
            let cipher = server_accept(&rogue, &client_hello, &connect, &nonce).unwrap();
            write_envelope(&mut b, &Envelope::connect(&Connect::Ack).unwrap())
                .await
                .unwrap();
            let req = read_envelope(&mut b, MAX_FRAME_LEN)
                .await
                .unwrap()
                .unwrap()
                .open_control(&cipher)
                .unwrap();
            assert_eq!(req.kind, MsgType::Request);
            let get = transfer::get_file_message(&req.session_id, &secret.display().to_string());
            write_envelope(&mut b, &Envelope::encrypted(&get, &cipher).unwrap())
                .await
                .unwrap();
            // Next thing on the wire must be the closing notice, not file data.
            read_envelope(&mut b, MAX_FRAME_LEN).await.unwrap().unwrap()
        };

        let (outcome, next) = tokio::join!(
            client.run(a, Some(InitMessage::Request(request))),
            rogue_side
        );
        assert!(matches!(outcome, Outcome::Failed(ChannelError::ProtocolViolation(_))));
        assert!(next.open_complete().is_ok(), "got {:?}", next.kind);
        assert_eq!(alice.session(&id).state, SessionState::RequestTransferring);
    }
}
