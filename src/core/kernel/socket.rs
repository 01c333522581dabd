use crate::core::errors::KiwoomError;
use crate::core::kernel::codec::WsCodec;
use crate::core::kernel::dispatch::CallbackDispatcher;
use crate::core::kernel::registry::{Callback, SubscriptionRegistry};
use crate::core::kernel::signer::TokenSource;
use crate::core::kernel::ws::{HeartbeatMonitor, TungsteniteWs, WsConfig, WsSession};
use crate::core::types::{ConnectionState, Frame, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, trace, warn};

/// Why one connection ended
enum Interrupt {
    Shutdown,
    Failed(KiwoomError),
}

/// Resolves once shutdown has been requested
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

struct Shared<C: WsCodec> {
    url: String,
    venue_name: String,
    config: WsConfig,
    codec: C,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: CallbackDispatcher,
    token: Arc<dyn TokenSource>,
    state: watch::Sender<ConnectionState>,
    fatal: watch::Sender<Option<KiwoomError>>,
    shutdown: watch::Sender<bool>,
    /// Present only while a connection is authenticated
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: mpsc::UnboundedSender<String>,
}

impl<C: WsCodec> Shared<C> {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(venue = %self.venue_name, from = %previous, to = %next, "connection state changed");
        }
    }

    fn fail(&self, error: KiwoomError) {
        error!(venue = %self.venue_name, error = %error, "realtime session failed");
        self.fatal.send_replace(Some(error));
        self.set_state(ConnectionState::Disconnected);
    }

    /// Queue a frame on the live connection; false when not live
    fn send_if_live(&self, message: Message) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        // reconnections since the last connection that stayed live long enough
        let mut reconnects: u32 = 0;
        let mut backoff = self.config.backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let mut live_since = None;
            let outcome = self.run_connection(&mut shutdown, &mut live_since).await;
            *self.outbound.lock() = None;

            let error = match outcome {
                Interrupt::Shutdown => break,
                Interrupt::Failed(error) => error,
            };
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Disconnected);

            if error.is_fatal() {
                self.fail(error);
                break;
            }

            let stable = self.config.stable_after();
            if live_since.is_some_and(|since: Instant| since.elapsed() >= stable) {
                reconnects = 0;
                backoff = self.config.backoff();
            }

            if reconnects >= self.config.max_reconnect_attempts {
                self.fail(KiwoomError::ConnectionLost { attempts: reconnects });
                break;
            }
            reconnects += 1;

            let delay = backoff
                .next()
                .unwrap_or_else(|| Duration::from_millis(self.config.max_reconnect_delay_ms));
            warn!(
                venue = %self.venue_name,
                attempt = reconnects,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "connection lost, reconnecting"
            );

            tokio::select! {
                () = sleep(delay) => {}
                () = wait_for_shutdown(&mut shutdown) => break,
            }
        }
    }

    #[instrument(skip_all, fields(venue = %self.venue_name, url = %self.url))]
    async fn run_connection(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        live_since: &mut Option<Instant>,
    ) -> Interrupt {
        let mut ws = TungsteniteWs::new(self.url.clone(), self.venue_name.clone())
            .with_config(self.config.clone());

        tokio::select! {
            biased;
            () = wait_for_shutdown(shutdown) => return Interrupt::Shutdown,
            result = ws.connect() => {
                if let Err(e) = result {
                    return Interrupt::Failed(e);
                }
            }
        }

        self.set_state(ConnectionState::Authenticating);
        if let Err(interrupt) = self.authenticate(&mut ws, shutdown).await {
            let _ = ws.close().await;
            return interrupt;
        }

        let (tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Live);
        *live_since = Some(Instant::now());

        let interrupt = match self.replay(&mut ws).await {
            Ok(()) => self.pump(&mut ws, outbound_rx, shutdown).await,
            Err(e) => Interrupt::Failed(e),
        };
        let _ = ws.close().await;

        let stats = ws.stats();
        debug!(
            live_ms = live_since.map_or(0, |since| since.elapsed().as_millis() as u64),
            messages_sent = stats.messages_sent,
            messages_received = stats.messages_received,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            "connection closed"
        );
        interrupt
    }

    /// Send the login frame and wait for its acknowledgement
    async fn authenticate(
        &self,
        ws: &mut TungsteniteWs,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), Interrupt> {
        let token = self.token.access_token().ok_or_else(|| {
            Interrupt::Failed(KiwoomError::AuthError("No access token available".to_string()))
        })?;
        let login = self.codec.encode_login(&token).map_err(Interrupt::Failed)?;
        ws.send_raw(login).await.map_err(Interrupt::Failed)?;

        let deadline = sleep(self.config.login_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                () = wait_for_shutdown(shutdown) => return Err(Interrupt::Shutdown),
                () = &mut deadline => {
                    return Err(Interrupt::Failed(KiwoomError::ConnectionTimeout(
                        "Login acknowledgement timed out".to_string(),
                    )));
                }
                message = ws.next_raw() => match message {
                    Some(Ok(Message::Text(text))) => match self.codec.decode_message(&text) {
                        Ok(Frame::Login { return_code: 0, .. }) => return Ok(()),
                        Ok(Frame::Login { return_code, return_msg }) => {
                            return Err(Interrupt::Failed(KiwoomError::AuthError(format!(
                                "Login rejected ({}): {}",
                                return_code, return_msg
                            ))));
                        }
                        // anything ahead of the acknowledgement keeps its place in the queue
                        _ => {
                            let _ = self.inbound.send(text);
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(Interrupt::Failed(KiwoomError::NetworkError(
                            "Connection closed during login".to_string(),
                        )));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(Interrupt::Failed(e)),
                },
            }
        }
    }

    /// Re-announce every active (group, subject) pair on a fresh connection
    async fn replay(&self, ws: &mut TungsteniteWs) -> Result<(), KiwoomError> {
        let snapshot = self.registry.snapshot();
        if !snapshot.is_empty() {
            info!(venue = %self.venue_name, subscriptions = snapshot.len(), "replaying subscriptions");
        }
        for subscription in &snapshot {
            let frame = self.codec.encode_subscription(subscription)?;
            ws.send_raw(frame).await?;
        }
        Ok(())
    }

    /// Move frames between the live connection and the queues until it ends
    async fn pump(
        &self,
        ws: &mut TungsteniteWs,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Interrupt {
        let interval = self.config.heartbeat_interval();
        let pong_timeout = self.config.pong_timeout();
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = HeartbeatMonitor::new();
        let pong_deadline = sleep(pong_timeout);
        tokio::pin!(pong_deadline);

        loop {
            tokio::select! {
                biased;
                () = wait_for_shutdown(shutdown) => return Interrupt::Shutdown,
                () = &mut pong_deadline, if heartbeat.awaiting_pong() => {
                    warn!(
                        venue = %self.venue_name,
                        timeout_ms = pong_timeout.as_millis() as u64,
                        since_pong_ms = heartbeat.last_pong().map(|at| at.elapsed().as_millis() as u64),
                        "heartbeat missed"
                    );
                    return Interrupt::Failed(KiwoomError::ConnectionTimeout(
                        "No pong within heartbeat timeout".to_string(),
                    ));
                }
                _ = ticker.tick() => {
                    if heartbeat.record_ping() {
                        if let Some(deadline) = heartbeat.pong_deadline(pong_timeout) {
                            pong_deadline.as_mut().reset(deadline);
                        }
                        trace!("ping");
                        if let Err(e) = ws.send_raw(Message::Ping(Vec::new())).await {
                            return Interrupt::Failed(e);
                        }
                    }
                }
                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = ws.send_raw(message).await {
                        return Interrupt::Failed(e);
                    }
                }
                message = ws.next_raw() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.inbound.send(text);
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            let _ = self.inbound.send(text);
                        }
                        Err(e) => warn!(error = %e, "dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Pong(_))) => heartbeat.record_pong(),
                    Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        return Interrupt::Failed(KiwoomError::NetworkError(format!(
                            "Connection closed by server: {:?}",
                            frame
                        )));
                    }
                    Some(Err(e)) => return Interrupt::Failed(e),
                    None => {
                        return Interrupt::Failed(KiwoomError::NetworkError(
                            "Connection closed".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Pop raw frames in arrival order, decode and dispatch them
    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => break,
                raw = inbound.recv() => match raw {
                    Some(text) => self.handle_frame(&text),
                    None => break,
                },
            }
        }

        let mut drained = 0usize;
        while inbound.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "discarded queued frames on shutdown");
        }
    }

    fn handle_frame(&self, text: &str) {
        match self.codec.decode_message(text) {
            Ok(Frame::Data(envelopes)) => {
                for envelope in &envelopes {
                    self.dispatcher.dispatch(envelope);
                }
            }
            Ok(Frame::Ping) => {
                if !self.send_if_live(Message::Text(text.to_string())) {
                    debug!("ping received while not live");
                }
            }
            Ok(Frame::Ack {
                kind,
                return_code,
                return_msg,
            }) => {
                if return_code == 0 {
                    debug!(?kind, "acknowledged");
                } else {
                    warn!(?kind, return_code, return_msg = %return_msg, "request rejected by server");
                }
            }
            Ok(Frame::Login { return_code, .. }) => debug!(return_code, "late login acknowledgement"),
            Ok(Frame::Other(kind)) => trace!(kind = %kind, "unrouted frame"),
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }
}

/// One realtime connection with login, heartbeat, reconnect-with-replay and
/// ordered dispatch
///
/// A supervisor task owns the WebSocket and pushes every text frame into an
/// internal FIFO; a dispatch task pops, decodes and hands envelopes to the
/// [`CallbackDispatcher`]. The heartbeat runs on the supervisor side, so a slow
/// callback never hides a dead connection.
pub struct SocketSession<C: WsCodec> {
    shared: Arc<Shared<C>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: WsCodec> std::fmt::Debug for SocketSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSession")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

impl<C: WsCodec> SocketSession<C> {
    /// Create a session; nothing connects until [`connect`](Self::connect)
    ///
    /// # Arguments
    /// * `url` - Realtime endpoint
    /// * `venue_name` - Name of the venue for logging/tracing
    /// * `config` - Timers and reconnect policy, validated here
    /// * `codec` - Frame encoding for the venue
    /// * `registry` - Desired subscriptions, replayed on every login
    /// * `token` - Source of the token presented at login
    pub fn new(
        url: String,
        venue_name: String,
        config: WsConfig,
        codec: C,
        registry: Arc<SubscriptionRegistry>,
        token: Arc<dyn TokenSource>,
    ) -> Result<Self, KiwoomError> {
        config.validate()?;

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (fatal, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                venue_name,
                config,
                codec,
                dispatcher: CallbackDispatcher::new(registry.clone()),
                registry,
                token,
                state,
                fatal,
                shutdown,
                outbound: Mutex::new(None),
                inbound,
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the connection tasks and wait until the session is live
    ///
    /// Connection failures go through the reconnect policy; the call returns
    /// the fatal error if login is rejected or the reconnect budget runs out.
    pub async fn connect(&self) -> Result<(), KiwoomError> {
        {
            let mut tasks = self.tasks.lock();
            if tasks.is_empty() {
                let inbound_rx = self.inbound_rx.lock().take().ok_or_else(|| {
                    KiwoomError::NotConnected("Session already closed".to_string())
                })?;
                tasks.push(tokio::spawn(
                    self.shared.clone().dispatch_loop(inbound_rx),
                ));
                tasks.push(tokio::spawn(self.shared.clone().supervise()));
            }
        }

        self.wait_live().await
    }

    async fn wait_live(&self) -> Result<(), KiwoomError> {
        let mut state = self.shared.state.subscribe();
        let mut fatal = self.shared.fatal.subscribe();
        let mut shutdown = self.shared.shutdown.subscribe();

        loop {
            if let Some(error) = fatal.borrow_and_update().clone() {
                return Err(error);
            }
            if *shutdown.borrow_and_update() {
                return Err(KiwoomError::NotConnected("Session closed".to_string()));
            }
            if *state.borrow_and_update() == ConnectionState::Live {
                return Ok(());
            }

            tokio::select! {
                _ = state.changed() => {}
                _ = fatal.changed() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Register subjects for items in a group, announcing them if live
    pub fn register(
        &self,
        group: &str,
        items: &[String],
        subjects: &[String],
        callback: Option<Callback>,
    ) -> Result<Subscription, KiwoomError> {
        let subscription = self
            .shared
            .registry
            .register_with(group, items, subjects, callback)?;
        let frame = self.shared.codec.encode_subscription(&subscription)?;
        if !self.shared.send_if_live(frame) {
            debug!(group, "registered while offline; will be announced on login");
        }
        Ok(subscription)
    }

    /// Remove subjects from a group, withdrawing them if live
    ///
    /// Removing subjects that are not active is a no-op.
    pub fn remove(&self, group: &str, subjects: &[String]) -> Result<(), KiwoomError> {
        let Some(subscription) = self.shared.registry.remove(group, subjects) else {
            return Ok(());
        };
        let frame = self.shared.codec.encode_unsubscription(&subscription)?;
        self.shared.send_if_live(frame);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver observing every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The fatal error that stopped the session, if any
    pub fn fatal_error(&self) -> Option<KiwoomError> {
        self.shared.fatal.borrow().clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.shared.registry
    }

    /// Stop the session: cancel heartbeat, receive and dispatch, drain the
    /// queue without dispatching and release the connection
    ///
    /// Tasks that do not stop within the shutdown deadline are aborted.
    pub async fn close(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        self.inbound_rx.lock().take();

        self.shared.set_state(ConnectionState::Closing);
        self.shared.shutdown.send_replace(true);

        let deadline = Instant::now() + self.shared.config.shutdown_timeout();
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!(venue = %self.shared.venue_name, "task did not stop before deadline, aborting");
                handle.abort();
            }
        }

        *self.shared.outbound.lock() = None;
        self.shared.registry.clear();
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl<C: WsCodec> Drop for SocketSession<C> {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
