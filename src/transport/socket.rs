//! Socket abstraction over WebSocket connections.
//!
//! A [`Connector`] opens a [`SocketLink`]: an outbound frame sender plus an
//! inbound [`SocketEvent`] receiver backed by a background task. Shutting a
//! link down closes the socket gracefully; dropping it abandons the socket
//! outright.

use crate::error::{ChatError, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// One WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(bytes) => Message::Binary(bytes),
        }
    }
}

/// Lifecycle and data events reported by a socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Frame(Frame),
    Closed { reason: Option<String> },
    Failed(String),
}

/// Handle to one socket owned by a background task.
#[derive(Debug)]
pub struct SocketLink {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
        }
    }

    /// Queue a frame for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Connection`] if the socket is shut down or its
    /// task has exited.
    pub fn send(&self, frame: Frame) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| ChatError::Connection("socket is shutting down".into()))?;
        outbound
            .send(frame)
            .map_err(|_| ChatError::Connection("socket task has exited".into()))
    }

    /// Ask the socket task to close gracefully. A final
    /// [`SocketEvent::Closed`] follows.
    pub fn shutdown(&mut self) {
        self.outbound = None;
    }

    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.inbound.recv().await
    }
}

/// Opens sockets.
pub trait Connector: Send + Sync + 'static {
    /// Start connecting to `url`. Progress is reported through the
    /// returned link's events.
    fn open(&self, url: &str) -> SocketLink;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: &str) -> SocketLink {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.to_owned(), outbound_rx, events_tx));
        SocketLink::new(outbound_tx, events_rx)
    }
}

async fn run_socket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);

    let ws_stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    let _ = events.send(SocketEvent::Failed(format!("connect {url}: {e}")));
                    return;
                }
            },
            frame = outbound.recv() => match frame {
                Some(_) => debug!("dropping frame queued before socket opened"),
                None => {
                    let _ = events.send(SocketEvent::Closed { reason: None });
                    return;
                }
            },
            // Link dropped while still connecting.
            () = events.closed() => return,
        }
    };

    info!("socket connected: {url}");
    if events.send(SocketEvent::Opened).is_err() {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => SocketEvent::Frame(Frame::Text(text)),
                    Some(Ok(Message::Binary(bytes))) => SocketEvent::Frame(Frame::Binary(bytes)),
                    Some(Ok(Message::Close(frame))) => {
                        let _ = events.send(SocketEvent::Closed {
                            reason: frame.map(|f| f.reason.to_string()),
                        });
                        return;
                    }
                    None => {
                        let _ = events.send(SocketEvent::Closed { reason: None });
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = events.send(SocketEvent::Failed(format!("read error: {e}")));
                        return;
                    }
                    // Ping/Pong frames are answered by tungstenite.
                    Some(Ok(_)) => continue,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write.send(frame.into_message()).await {
                        let _ = events.send(SocketEvent::Failed(format!("send error: {e}")));
                        return;
                    }
                }
                None => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!("close handshake failed: {e}");
                    }
                    let _ = events.send(SocketEvent::Closed { reason: None });
                    return;
                }
            },
        }
    }
}
