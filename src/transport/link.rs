//! Connect/reconnect state machine shared by every socket owner.
//!
//! A [`Link`] holds at most one socket. Opening a new one always discards
//! the previous socket first, so two sockets are never live at once.

use crate::error::{ChatError, Result};
use crate::transport::socket::{Connector, Frame, SocketEvent, SocketLink};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle of a link's current socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    Connecting,
    Open,
    /// Graceful close requested, waiting for the socket task to confirm.
    Closing,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// Event surfaced by [`Link::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened {
        reconnect: bool,
    },
    Frame(Frame),
    Closed {
        reason: Option<String>,
        /// True when the close was requested locally.
        requested: bool,
    },
    Failed(String),
}

pub struct Link {
    connector: Arc<dyn Connector>,
    url: String,
    socket: Option<SocketLink>,
    state: ConnectionState,
    reconnecting: bool,
}

impl Link {
    pub fn new(connector: Arc<dyn Connector>, url: impl Into<String>) -> Self {
        Self {
            connector,
            url: url.into(),
            socket: None,
            state: ConnectionState::Idle,
            reconnecting: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    /// Open a new socket, discarding any existing one.
    pub fn connect(&mut self, reconnect: bool) {
        if self.socket.take().is_some() {
            debug!("discarding previous socket ({:?})", self.state);
        }
        self.socket = Some(self.connector.open(&self.url));
        self.state = ConnectionState::Connecting;
        self.reconnecting = reconnect;
    }

    /// Reconnect unless a live socket exists and `forced` is false.
    ///
    /// Before the first connect this is a plain [`connect`](Self::connect).
    /// Returns whether a new socket was opened.
    pub fn reconnect(&mut self, forced: bool) -> bool {
        if self.state == ConnectionState::Idle {
            self.connect(false);
            return true;
        }
        if !forced && self.state.is_live() {
            return false;
        }
        self.connect(true);
        true
    }

    /// Request a graceful close. No-op unless the socket is live.
    pub fn close(&mut self) {
        if !self.state.is_live() {
            return;
        }
        if let Some(socket) = self.socket.as_mut() {
            socket.shutdown();
        }
        self.state = ConnectionState::Closing;
    }

    /// Transmit a frame on the open socket.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Connection`] unless the socket is open and its
    /// task still running.
    pub fn send(&self, frame: Frame) -> Result<()> {
        match (&self.socket, self.state) {
            (Some(socket), ConnectionState::Open) => socket.send(frame),
            _ => Err(ChatError::Connection(format!(
                "cannot send while {:?}",
                self.state
            ))),
        }
    }

    /// Wait for the next event from the current socket.
    ///
    /// Pends forever while there is no socket. Frames arriving after a
    /// close was requested are dropped.
    pub async fn next_event(&mut self) -> LinkEvent {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return std::future::pending().await;
            };
            let event = socket.recv().await;
            let requested = self.state == ConnectionState::Closing;

            match event {
                Some(SocketEvent::Opened) => {
                    if requested {
                        continue;
                    }
                    self.state = ConnectionState::Open;
                    return LinkEvent::Opened {
                        reconnect: self.reconnecting,
                    };
                }
                Some(SocketEvent::Frame(frame)) => {
                    if requested {
                        debug!("dropping frame received while closing");
                        continue;
                    }
                    return LinkEvent::Frame(frame);
                }
                Some(SocketEvent::Closed { reason }) => {
                    self.socket = None;
                    self.state = ConnectionState::Closed;
                    return LinkEvent::Closed { reason, requested };
                }
                Some(SocketEvent::Failed(reason)) => {
                    self.socket = None;
                    self.state = ConnectionState::Closed;
                    if requested {
                        return LinkEvent::Closed {
                            reason: Some(reason),
                            requested,
                        };
                    }
                    return LinkEvent::Failed(reason);
                }
                None => {
                    self.socket = None;
                    self.state = ConnectionState::Closed;
                    return LinkEvent::Closed {
                        reason: None,
                        requested,
                    };
                }
            }
        }
    }
}
