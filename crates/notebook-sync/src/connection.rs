//! Lifecycle of the real-time connection to the notebook server.
//!
//! The manager owns at most one WebSocket at a time. Each connection attempt
//! runs in its own task and reports back through a channel, tagged with a
//! generation number. Closing the manager (or reconnecting) bumps the
//! generation, so anything a torn-down socket still has in flight is
//! discarded instead of reaching the session.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::protocol::{ClientEvent, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

/// What a connection task reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    /// A decoded inbound event. Malformed frames never get this far.
    Event(ServerEvent),
    /// Transport-level failure. Always followed by `Closed`.
    Error(String),
    Closed { reason: Option<String> },
}

#[derive(Debug)]
struct Tagged {
    generation: u64,
    event: ConnectionEvent,
}

pub struct ConnectionManager {
    url: Url,
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<ClientEvent>>,
    task: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
}

impl ConnectionManager {
    pub fn new(url: Url) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            url,
            state: ConnectionState::Disconnected,
            generation: 0,
            outbound: None,
            task: None,
            events_tx,
            events_rx,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Start a connection attempt. Returns false (and does nothing) if one is
    /// already connecting or open.
    pub fn connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!(
                "[notebook-connection] Connect skipped, already {:?}",
                self.state
            );
            return false;
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);

        let url = self.url.clone();
        let generation = self.generation;
        let events_tx = self.events_tx.clone();
        info!(
            "[notebook-connection] Connecting to {} (generation {})",
            url, generation
        );
        self.task = Some(tokio::spawn(run_connection(
            url,
            generation,
            outbound_rx,
            events_tx,
        )));
        true
    }

    /// Queue an event on the live connection. Returns false if there is none.
    pub fn send(&self, event: ClientEvent) -> bool {
        if !self.is_open() {
            return false;
        }
        match &self.outbound {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Close the connection and forget it. Events it still emits are
    /// discarded.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected && self.task.is_none() {
            return;
        }
        info!("[notebook-connection] Closing connection to {}", self.url);
        // Dropping the sender makes the task send a close frame and exit.
        self.outbound = None;
        self.task = None;
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
    }

    /// Wait for the next event from the current connection.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            let Some(tagged) = self.events_rx.recv().await else {
                // We hold a sender ourselves, so this cannot end.
                return std::future::pending().await;
            };
            if tagged.generation != self.generation {
                debug!(
                    "[notebook-connection] Dropping {:?} from stale generation {}",
                    tagged.event, tagged.generation
                );
                continue;
            }
            match &tagged.event {
                ConnectionEvent::Opened => self.state = ConnectionState::Open,
                ConnectionEvent::Closed { .. } => {
                    self.state = ConnectionState::Disconnected;
                    self.outbound = None;
                    self.task = None;
                }
                _ => {}
            }
            return tagged.event;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Owns one WebSocket for its whole life.
async fn run_connection(
    url: Url,
    generation: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
    events_tx: mpsc::UnboundedSender<Tagged>,
) {
    let emit = |event: ConnectionEvent| {
        let _ = events_tx.send(Tagged { generation, event });
    };

    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!("[notebook-connection] Failed to connect to {}: {}", url, e);
            emit(ConnectionEvent::Error(e.to_string()));
            emit(ConnectionEvent::Closed { reason: None });
            return;
        }
    };
    info!("[notebook-connection] Connected to {}", url);
    emit(ConnectionEvent::Opened);

    let (mut sink, mut stream) = ws.split();
    let mut reason = None;

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(event) => {
                    let text = match event.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("[notebook-connection] Failed to encode {}: {}", event.name(), e);
                            continue;
                        }
                    };
                    debug!("[notebook-connection] -> {}", event.name());
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        emit(ConnectionEvent::Error(e.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    reason = Some("closed by client".to_string());
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerEvent::decode(&text) {
                    Ok(event) => {
                        debug!("[notebook-connection] <- {}", event.name());
                        emit(ConnectionEvent::Event(event));
                    }
                    Err(e) => {
                        warn!("[notebook-connection] Dropping malformed event: {}", e);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[notebook-connection] Transport error: {}", e);
                    emit(ConnectionEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    info!("[notebook-connection] Disconnected from {}", url);
    emit(ConnectionEvent::Closed { reason });
}
