//! Chat channel manager.
//!
//! [`ChannelManager`] is an actor owning the one live socket to the chat
//! endpoint. Cloneable [`ChannelHandle`]s queue commands to it; decoded
//! application envelopes come out of the receiver returned by
//! [`chat_channel`] and are consumed by the message router.
//!
//! Application requests are gated by a pending-send flag: while a request
//! is in flight every further non-system send is dropped. System sends
//! (keepalive, reconnect notice) bypass the flag.

use crate::config::TransportConfig;
use crate::error::{ChatError, Result};
use crate::notify::{Notifier, Toast};
use crate::sanitize::sanitize_text;
use crate::transport::codec::FrameCodec;
use crate::transport::envelope::{InboundEnvelope, OutboundEnvelope, SystemCommand};
use crate::transport::keepalive::Keepalive;
use crate::transport::link::{ConnectionState, Link, LinkEvent};
use crate::transport::socket::{Connector, Frame};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Page/tab visibility as reported by the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Visible,
}

/// Per-send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Compress into a binary frame (subject to the channel-wide setting).
    pub compress: bool,
    /// Bypass the pending-send flag.
    pub system: bool,
}

impl SendOptions {
    /// Application request: compressed, gated by the pending flag.
    #[must_use]
    pub fn request() -> Self {
        Self {
            compress: true,
            system: false,
        }
    }

    /// System message: compressed, never gated.
    #[must_use]
    pub fn system() -> Self {
        Self {
            compress: true,
            system: true,
        }
    }

    #[must_use]
    pub fn uncompressed(self) -> Self {
        Self {
            compress: false,
            ..self
        }
    }
}

/// Observable channel state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub state: ConnectionState,
    /// Empty until the server assigns one on this connection.
    pub access_id: String,
    pub pending_send: bool,
}

enum ChannelCommand {
    Connect,
    Reconnect { forced: bool },
    Send {
        envelope: OutboundEnvelope,
        options: SendOptions,
    },
    Visibility(Visibility),
    ClearPending,
    Close,
}

/// Cloneable handle to a running [`ChannelManager`].
#[derive(Clone)]
pub struct ChannelHandle {
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    snapshot_rx: watch::Receiver<ChannelSnapshot>,
}

impl ChannelHandle {
    fn submit(&self, command: ChannelCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| ChatError::Channel("chat channel manager has stopped".into()))
    }

    /// Open the channel, replacing any live socket.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn connect(&self) -> Result<()> {
        self.submit(ChannelCommand::Connect)
    }

    /// Reconnect unless a socket is already live and `forced` is false.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn reconnect(&self, forced: bool) -> Result<()> {
        self.submit(ChannelCommand::Reconnect { forced })
    }

    /// Queue an envelope for transmission.
    ///
    /// Requests issued while another is pending, or while the channel is
    /// down, are dropped; the caller resends once the channel recovers.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn send(&self, envelope: OutboundEnvelope, options: SendOptions) -> Result<()> {
        self.submit(ChannelCommand::Send { envelope, options })
    }

    /// Send an application command with sanitized payload.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn send_command(&self, cmd: &str, data: Map<String, Value>) -> Result<()> {
        let envelope = OutboundEnvelope::new(cmd).with_data(data).sanitized();
        self.send(envelope, SendOptions::request())
    }

    /// Send a system message that bypasses the pending flag.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn send_system(&self, envelope: OutboundEnvelope) -> Result<()> {
        self.send(envelope, SendOptions::system())
    }

    /// Report a visibility change. Hidden tears the channel down; visible
    /// forces a reconnect and pings immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn set_visibility(&self, visibility: Visibility) -> Result<()> {
        self.submit(ChannelCommand::Visibility(visibility))
    }

    /// Clear the pending-send flag after a terminal response.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn clear_pending(&self) -> Result<()> {
        self.submit(ChannelCommand::ClearPending)
    }

    /// Close the channel and stop the keepalive.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the manager has stopped.
    pub fn close(&self) -> Result<()> {
        self.submit(ChannelCommand::Close)
    }

    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Actor owning the chat socket.
pub struct ChannelManager {
    link: Link,
    keepalive: Keepalive,
    codec: FrameCodec,
    compress: bool,
    access_id_field: String,
    command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    inbound_tx: mpsc::UnboundedSender<InboundEnvelope>,
    snapshot_tx: watch::Sender<ChannelSnapshot>,
    notifier: Arc<dyn Notifier>,
    pending_send: bool,
    access_id: String,
    /// System messages issued while connecting, flushed on open.
    outbox: Vec<OutboundEnvelope>,
}

/// Create a chat channel.
///
/// Returns the handle, the manager (to be driven with
/// [`ChannelManager::run`]) and the stream of application envelopes.
#[must_use]
pub fn chat_channel(
    config: &TransportConfig,
    connector: Arc<dyn Connector>,
    notifier: Arc<dyn Notifier>,
) -> (
    ChannelHandle,
    ChannelManager,
    mpsc::UnboundedReceiver<InboundEnvelope>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::default());

    let manager = ChannelManager {
        link: Link::new(connector, config.url.clone()),
        keepalive: Keepalive::new(config.keepalive_interval()),
        codec: FrameCodec::new(config.compression_quality),
        compress: config.compress,
        access_id_field: config.access_id_field.clone(),
        command_rx,
        inbound_tx,
        snapshot_tx,
        notifier,
        pending_send: false,
        access_id: String::new(),
        outbox: Vec::new(),
    };

    (
        ChannelHandle {
            command_tx,
            snapshot_rx,
        },
        manager,
        inbound_rx,
    )
}

impl ChannelManager {
    /// Drive the channel until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.link.next_event() => self.handle_link_event(event),
                () = self.keepalive.tick() => self.send_ping(),
            }
        }
        self.teardown();
        debug!("chat channel manager stopped");
    }

    fn handle_command(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::Connect => {
                self.link.connect(false);
                self.connect_started(false);
            }
            ChannelCommand::Reconnect { forced } => self.reconnect(forced),
            ChannelCommand::Send { envelope, options } => self.send(envelope, options),
            ChannelCommand::Visibility(Visibility::Hidden) => {
                info!("channel hidden, tearing down");
                self.teardown();
            }
            ChannelCommand::Visibility(Visibility::Visible) => {
                info!("channel visible, reconnecting");
                self.reconnect(true);
                self.send_ping();
            }
            ChannelCommand::ClearPending => self.set_pending(false),
            ChannelCommand::Close => self.teardown(),
        }
    }

    fn reconnect(&mut self, forced: bool) {
        let was_idle = self.link.state() == ConnectionState::Idle;
        if self.link.reconnect(forced) {
            self.connect_started(!was_idle);
        }
    }

    /// Reset per-connection state after a new socket was opened.
    fn connect_started(&mut self, reconnect: bool) {
        // The access id belongs to the discarded socket.
        self.access_id.clear();
        self.outbox.clear();
        if reconnect {
            self.notifier.notify(Toast::info("Reconnecting"));
        }
        self.publish();
    }

    fn teardown(&mut self) {
        self.link.close();
        self.keepalive.stop();
        self.outbox.clear();
        self.set_pending(false);
    }

    fn send(&mut self, envelope: OutboundEnvelope, options: SendOptions) {
        if !self.link.has_socket() {
            debug!(cmd = %envelope.cmd, "no channel, reconnecting and dropping send");
            self.reconnect(false);
            if options.system {
                self.outbox.push(envelope);
            }
            return;
        }

        if !options.system {
            if self.pending_send {
                debug!(cmd = %envelope.cmd, "request already in flight, dropping send");
                return;
            }
            self.set_pending(true);
        }

        match self.link.state() {
            ConnectionState::Open => self.transmit(envelope, options),
            ConnectionState::Connecting => {
                if options.system {
                    self.outbox.push(envelope);
                } else {
                    debug!(cmd = %envelope.cmd, "channel still connecting, dropping send");
                }
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {
                self.reconnect(false);
                if options.system {
                    self.outbox.push(envelope);
                }
            }
        }
    }

    fn transmit(&mut self, mut envelope: OutboundEnvelope, options: SendOptions) {
        envelope.extra.insert(
            self.access_id_field.clone(),
            Value::String(self.access_id.clone()),
        );

        let frame = match self.codec.encode(&envelope, options.compress && self.compress) {
            Ok(frame) => frame,
            Err(e) => {
                self.notifier.report(&e);
                if !options.system {
                    self.set_pending(false);
                }
                return;
            }
        };

        let Err(e) = self.link.send(frame) else {
            return;
        };
        warn!(cmd = %envelope.cmd, "transmit failed ({e}), retrying uncompressed");
        let retried = self
            .codec
            .encode(&envelope, false)
            .and_then(|frame| self.link.send(frame));
        let Err(e) = retried else {
            return;
        };
        if !options.system {
            self.set_pending(false);
        }
        // The socket task is gone while the link still reports it open.
        if self.link.state() == ConnectionState::Open {
            warn!(cmd = %envelope.cmd, "uncompressed transmit failed ({e}), reconnecting");
            self.reconnect(true);
        } else {
            debug!(cmd = %envelope.cmd, "transmit failed ({e}) while reconnecting");
        }
    }

    fn send_ping(&mut self) {
        self.send(
            OutboundEnvelope::system(SystemCommand::Ping),
            SendOptions::system(),
        );
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { reconnect } => {
                info!(reconnect, "chat channel open");
                self.notifier.notify(Toast::success("Connected"));
                self.pending_send = false;
                if reconnect {
                    // Sent raw so it never carries the previous access id.
                    let notice = Frame::Text(
                        serde_json::json!({"cmd": SystemCommand::Reconnect.as_str()}).to_string(),
                    );
                    if let Err(e) = self.link.send(notice) {
                        warn!("reconnect notice not sent: {e}");
                    }
                }
                self.keepalive.start();
                for envelope in std::mem::take(&mut self.outbox) {
                    self.transmit(envelope, SendOptions::system());
                }
                self.publish();
            }
            LinkEvent::Frame(frame) => self.handle_frame(&frame),
            LinkEvent::Closed { reason, requested } => {
                info!(?reason, requested, "chat channel closed");
                self.keepalive.stop();
                self.outbox.clear();
                if !requested {
                    self.notifier.notify(Toast::info("Disconnected"));
                }
                self.set_pending(false);
            }
            LinkEvent::Failed(reason) => {
                self.keepalive.stop();
                self.outbox.clear();
                self.notifier.report(&ChatError::Connection(reason));
                self.set_pending(false);
            }
        }
    }

    fn handle_frame(&mut self, frame: &Frame) {
        let envelope: InboundEnvelope = match self.codec.decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.notifier.report(&e);
                self.set_pending(false);
                return;
            }
        };

        match envelope.system_command() {
            Some(SystemCommand::Ping | SystemCommand::Pong | SystemCommand::Ack) => {
                trace!(cmd = %envelope.cmd, "ignoring keepalive frame");
            }
            Some(SystemCommand::WsClose) => {
                info!("server requested close");
                self.link.close();
                self.keepalive.stop();
                self.notifier.notify(Toast::info("Disconnected"));
                self.set_pending(false);
            }
            Some(SystemCommand::SetUserAccessId) => self.accept_access_id(&envelope),
            _ => {
                if self.inbound_tx.send(envelope).is_err() {
                    debug!("router has stopped, clearing pending flag");
                    self.set_pending(false);
                }
            }
        }
    }

    fn accept_access_id(&mut self, envelope: &InboundEnvelope) {
        if envelope.ok {
            match envelope.data_str("access_id") {
                Some(id) => {
                    self.access_id = sanitize_text(id);
                    debug!(access_id = %self.access_id, "access id assigned");
                }
                None => warn!("SetUserAccessId without access_id"),
            }
        } else {
            self.notifier.notify(Toast::error("Connection error"));
        }
        self.set_pending(false);
    }

    fn set_pending(&mut self, pending: bool) {
        self.pending_send = pending;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = ChannelSnapshot {
            state: self.link.state(),
            access_id: self.access_id.clone(),
            pending_send: self.pending_send,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
