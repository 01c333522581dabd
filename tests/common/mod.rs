#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the venue treats one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Accept the login, acknowledge requests, answer pings
    Normal,
    /// Reject the login with a non-zero return code
    RejectLogin,
    /// Accept the login, then stop reading so no pong is ever sent
    SilentAfterLogin,
    /// Accept the login, then hang up at once
    DropAfterLogin,
}

#[derive(Debug, Clone)]
pub enum VenueEvent {
    Connected(usize),
    Frame(usize, Value),
    Disconnected(usize),
}

enum Command {
    Send(String),
    Drop,
}

/// In-process realtime endpoint speaking the venue's frame format
pub struct MockVenue {
    pub url: String,
    events: mpsc::UnboundedReceiver<VenueEvent>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
}

impl MockVenue {
    /// Start listening; connection `n` uses `behaviours[n]`, the last entry repeats
    pub async fn start(behaviours: Vec<Behaviour>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (events_tx, events) = mpsc::unbounded_channel();
        let current = Arc::new(Mutex::new(None));

        let slot = current.clone();
        tokio::spawn(async move {
            let mut index = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                let behaviour = behaviours
                    .get(index)
                    .or_else(|| behaviours.last())
                    .copied()
                    .unwrap_or(Behaviour::Normal);
                let (command_tx, command_rx) = mpsc::unbounded_channel();
                *slot.lock().unwrap() = Some(command_tx);

                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        let _ = events_tx.send(VenueEvent::Connected(index));
                        serve(index, ws, behaviour, events_tx.clone(), command_rx).await;
                        let _ = events_tx.send(VenueEvent::Disconnected(index));
                    }
                });
                index += 1;
            }
        });

        Self {
            url,
            events,
            current,
        }
    }

    /// Push a raw text frame on the most recent connection
    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(Command::Send(text.into()));
        }
    }

    /// Drop the most recent connection without a close handshake
    pub fn drop_connection(&self) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(Command::Drop);
        }
    }

    pub async fn next_event(&mut self) -> VenueEvent {
        timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for venue event")
            .expect("venue stopped")
    }

    pub async fn wait_connected(&mut self, connection: usize) {
        loop {
            if let VenueEvent::Connected(n) = self.next_event().await {
                if n == connection {
                    return;
                }
            }
        }
    }

    pub async fn wait_disconnected(&mut self, connection: usize) {
        loop {
            if let VenueEvent::Disconnected(n) = self.next_event().await {
                if n == connection {
                    return;
                }
            }
        }
    }

    /// Collect `count` frames of kind `trnm` received on `connection`
    pub async fn frames(&mut self, connection: usize, trnm: &str, count: usize) -> Vec<Value> {
        let mut frames = Vec::new();
        while frames.len() < count {
            if let VenueEvent::Frame(n, frame) = self.next_event().await {
                if n == connection && frame["trnm"] == trnm {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    /// Events that arrive within `window`
    pub async fn drain_for(&mut self, window: Duration) -> Vec<VenueEvent> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            events.push(event);
        }
        events
    }
}

async fn serve<S>(
    index: usize,
    mut ws: tokio_tungstenite::WebSocketStream<S>,
    behaviour: Behaviour,
    events: mpsc::UnboundedSender<VenueEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut logged_in = false;

    loop {
        if logged_in && behaviour == Behaviour::SilentAfterLogin {
            // Hold the socket without reading it; pings stay unanswered.
            match commands.recv().await {
                Some(Command::Send(text)) => {
                    let _ = ws.send(Message::Text(text)).await;
                }
                Some(Command::Drop) | None => return,
            }
            continue;
        }

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if ws.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(Command::Drop) | None => return,
            },
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let _ = events.send(VenueEvent::Frame(index, frame.clone()));

                    let reply = match frame["trnm"].as_str() {
                        Some("LOGIN") if behaviour == Behaviour::RejectLogin => Some(json!({
                            "trnm": "LOGIN",
                            "return_code": 100_013,
                            "return_msg": "invalid token",
                        })),
                        Some("LOGIN") => {
                            logged_in = true;
                            Some(json!({"trnm": "LOGIN", "return_code": 0, "return_msg": ""}))
                        }
                        Some(kind @ ("REG" | "REMOVE")) => {
                            Some(json!({"trnm": kind, "return_code": 0, "return_msg": ""}))
                        }
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                    if logged_in && behaviour == Behaviour::DropAfterLogin {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// A data frame carrying one envelope
pub fn real_frame(subject: &str, group: Option<&str>, item: &str, values: Value) -> String {
    let mut entry = json!({
        "type": subject,
        "name": "test",
        "item": item,
        "values": values,
    });
    if let Some(group) = group {
        entry["grp_no"] = json!(group);
    }
    json!({"trnm": "REAL", "data": [entry]}).to_string()
}

/// `n` distinct six-digit instrument codes, starting with `first`
pub fn item_codes(first: &str, n: usize) -> Vec<String> {
    let mut codes = vec![first.to_string()];
    codes.extend((1..n).map(|i| format!("{:06}", 900_000 + i)));
    codes
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kiwoom=debug")),
        )
        .try_init();
}
