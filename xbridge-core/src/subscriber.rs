//! Inbound demultiplexer: reads envelopes off the stream and routes them.
//!
//! Handshake and control messages go to the driver's event queue. File
//! transfer envelopes go to the active [`FileReceiver`]; only its completion
//! reaches the queue. The driver steers this task through a command channel,
//! drained before each envelope is routed, and stops it with a shutdown
//! signal that joins any transfer still in flight.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};

use crate::archive::Archive;
use crate::cipher::CipherContext;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::protocol::{Connect, ControlMessage, Envelope, EnvelopeKind, Hello, MsgType};
use crate::transfer::{self, FileInfo, FileReceiver};
use crate::transport;

/// What the driver sees from the peer.
#[derive(Debug)]
pub enum IncomingEvent {
    Hello(Hello),
    Connect(Connect),
    /// Peer closed the channel, or the stream ended (synthetic).
    Complete(String),
    Control(ControlMessage),
    /// A requested file is fully written (and unpacked); its local path.
    FileReceived(PathBuf),
    /// Inbound error; the subscriber has stopped.
    Failed(ChannelError),
}

/// Driver to subscriber.
#[derive(Debug)]
pub enum SubscriberCommand {
    /// Session cipher for `Encrypted` envelopes from now on.
    InstallCipher(CipherContext),
    /// The next transfer answers a `GetFile` we sent; store it under `dest_dir`.
    ExpectFile { dest_dir: PathBuf },
}

pub struct Subscriber<R> {
    reader: R,
    events: mpsc::UnboundedSender<IncomingEvent>,
    commands: mpsc::UnboundedReceiver<SubscriberCommand>,
    shutdown: oneshot::Receiver<()>,
    archive: Arc<dyn Archive>,
    cipher: Option<CipherContext>,
    expected: VecDeque<PathBuf>,
    receiver: Option<FileReceiver>,
    sink_capacity: usize,
    max_frame_len: u32,
}

impl<R> Subscriber<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        events: mpsc::UnboundedSender<IncomingEvent>,
        commands: mpsc::UnboundedReceiver<SubscriberCommand>,
        shutdown: oneshot::Receiver<()>,
        archive: Arc<dyn Archive>,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            reader,
            events,
            commands,
            shutdown,
            archive,
            cipher: None,
            expected: VecDeque::new(),
            receiver: None,
            sink_capacity: config.sink_capacity,
            max_frame_len: config.max_frame_len,
        }
    }

    /// Run until the peer sends `Complete`, the stream ends, an error, or
    /// shutdown. Exactly one terminal event (`Complete` or `Failed`) is queued
    /// on exit, none on shutdown. An unfinished transfer is cancelled and its
    /// worker joined before this returns.
    pub async fn run(mut self) {
        let terminal = loop {
            let read = tokio::select! {
                biased;
                // A dropped sender counts as shutdown too.
                _ = &mut self.shutdown => break None,
                read = transport::read_envelope(&mut self.reader, self.max_frame_len) => read,
            };
            let envelope = match read {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break Some(IncomingEvent::Complete("stream closed".into())),
                Err(e) => break Some(IncomingEvent::Failed(e)),
            };
            self.drain_commands();
            match self.route(envelope).await {
                Ok(None) => {}
                Ok(Some(IncomingEvent::Complete(reason))) => {
                    break Some(IncomingEvent::Complete(reason));
                }
                Ok(Some(event)) => {
                    if self.events.send(event).is_err() {
                        // Driver is gone.
                        break None;
                    }
                }
                Err(e) => break Some(IncomingEvent::Failed(e)),
            }
        };
        if let Some(receiver) = self.receiver.take() {
            tracing::debug!("cancelling unfinished file transfer");
            receiver.cancel().await;
        }
        if let Some(terminal) = terminal {
            let _ = self.events.send(terminal);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                SubscriberCommand::InstallCipher(cipher) => self.cipher = Some(cipher),
                SubscriberCommand::ExpectFile { dest_dir } => self.expected.push_back(dest_dir),
            }
        }
    }

    async fn route(&mut self, envelope: Envelope) -> Result<Option<IncomingEvent>, ChannelError> {
        tracing::trace!(kind = ?envelope.kind, len = envelope.payload.len(), "inbound envelope");
        match envelope.kind {
            EnvelopeKind::Hello => Ok(Some(IncomingEvent::Hello(envelope.open_hello()?))),
            EnvelopeKind::Connect => Ok(Some(IncomingEvent::Connect(envelope.open_connect()?))),
            EnvelopeKind::Complete => Ok(Some(IncomingEvent::Complete(
                envelope.open_complete()?.reason,
            ))),
            EnvelopeKind::File => {
                let receiver = self
                    .receiver
                    .as_mut()
                    .ok_or_else(|| ChannelError::violation("file data outside a transfer"))?;
                receiver.chunk(envelope.payload).await?;
                Ok(None)
            }
            EnvelopeKind::Encrypted => {
                let cipher = self
                    .cipher
                    .as_ref()
                    .ok_or_else(|| ChannelError::violation("encrypted envelope before handshake"))?;
                let msg = envelope.open_control(cipher)?;
                self.route_control(msg).await
            }
        }
    }

    async fn route_control(
        &mut self,
        msg: ControlMessage,
    ) -> Result<Option<IncomingEvent>, ChannelError> {
        match msg.kind {
            MsgType::SendFileCipher => {
                if self.receiver.is_some() {
                    return Err(ChannelError::violation(
                        "file cipher before previous transfer ended",
                    ));
                }
                let dest_dir = self
                    .expected
                    .pop_front()
                    .ok_or_else(|| ChannelError::violation("unsolicited file transfer"))?;
                let file_cipher = transfer::cipher_from_message(&msg)?;
                self.receiver = Some(FileReceiver::start(
                    file_cipher,
                    dest_dir,
                    self.sink_capacity,
                ));
                Ok(None)
            }
            MsgType::SendFileInfo => {
                let receiver = self
                    .receiver
                    .as_mut()
                    .ok_or_else(|| ChannelError::violation("file info outside a transfer"))?;
                receiver.begin(FileInfo::from_message(&msg)?).await?;
                Ok(None)
            }
            MsgType::SendFileEnd => {
                let receiver = self
                    .receiver
                    .take()
                    .ok_or_else(|| ChannelError::violation("file end outside a transfer"))?;
                let path = receiver.finish(self.archive.clone()).await?;
                tracing::debug!(path = %path.display(), "file received");
                Ok(Some(IncomingEvent::FileReceived(path)))
            }
            _ => Ok(Some(IncomingEvent::Control(msg))),
        }
    }
}
