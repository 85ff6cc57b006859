/// +----------------------------------------------------------+
/// | STRUCTS | TRAITS | ENUMS | FUNCTIONS                     |
/// +----------+-------+-------+------------------------------+
/// | Traits:                                                  |
/// |   - Connector                                            |
/// |   - Connection                                           |
/// | Structs:                                                 |
/// |   - Subscriber                                           |
/// |   - SubscriberStats                                      |
/// | Enums:                                                   |
/// |   - SubscriberState                                      |
/// +----------------------------------------------------------+

/// Websocket transport for the subscriber.
pub mod websocket;

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffState;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::handler::MessageHandler;

pub use websocket::WebSocketConnector;

/// One open connection to the queue server.
#[async_trait]
pub trait Connection: Send {
    /// Waits for the next inbound message.
    ///
    /// `Ok(None)` is a keep-alive or otherwise payload-less frame. An error means the
    /// connection is gone and must be re-established.
    async fn receive(&mut self) -> BridgeResult<Option<String>>;

    /// Closes the connection cleanly.
    async fn close(&mut self) -> BridgeResult<()>;
}

/// Opens connections to the queue server.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    async fn connect(&self) -> BridgeResult<Self::Connection>;

    /// Human readable address, for logs.
    fn endpoint(&self) -> &str;
}

/// Lifecycle of a subscriber.
///
/// ```text
/// Disconnected -> Connecting -> Listening -> ErrorBackoff -> Connecting
///                                         -> ShuttingDown -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Listening,
    ErrorBackoff,
    ShuttingDown,
}

/// Counters describing what a subscriber has done so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Messages handed to the handler, whatever the outcome.
    pub dispatched: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Empty messages and keep-alive frames that were not dispatched.
    pub skipped: u64,
    /// Connections established, the first one included.
    pub connections: u64,
}

/// Keeps one connection to the queue server alive and feeds every message to a handler.
///
/// Messages are handled one at a time, in the order they were received. The connection
/// is owned exclusively by the subscriber; nothing else reads from or writes to it.
pub struct Subscriber<C: Connector, H: MessageHandler> {
    connector: C,
    handler: H,
    connection: Option<C::Connection>,
    backoff: BackoffState,
    state: watch::Sender<SubscriberState>,
    stats: SubscriberStats,
}

enum Step<T> {
    Shutdown,
    Done(T),
}

impl<H: MessageHandler> Subscriber<WebSocketConnector, H> {
    /// Creates a subscriber for the configured websocket endpoint.
    pub fn websocket(config: &BridgeConfig, handler: H) -> Self {
        Self::new(WebSocketConnector::new(config), handler, config)
    }
}

impl<C: Connector, H: MessageHandler> Subscriber<C, H> {
    pub fn new(connector: C, handler: H, config: &BridgeConfig) -> Self {
        let (state, _) = watch::channel(SubscriberState::Disconnected);
        Self {
            connector,
            handler,
            connection: None,
            backoff: BackoffState::new(config.backoff(), config.max_reconnect_attempts()),
            state,
            stats: SubscriberStats::default(),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition, usable while `run()` is active.
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> SubscriberStats {
        self.stats
    }

    /// Number of messages handed to the handler so far.
    pub fn messages_dispatched(&self) -> u64 {
        self.stats.dispatched
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Establishes the connection with a single attempt.
    ///
    /// Does nothing when already connected.
    ///
    /// # Errors
    /// Returns `BridgeError::Connection` if the endpoint is unreachable or the handshake fails
    pub async fn connect(&mut self) -> BridgeResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        self.set_state(SubscriberState::Connecting);
        match self.connector.connect().await {
            Ok(connection) => {
                self.on_connected(connection);
                Ok(())
            }
            Err(err) => {
                self.set_state(SubscriberState::Disconnected);
                Err(err)
            }
        }
    }

    /// Receives and dispatches messages until shut down or until reconnecting fails.
    ///
    /// Connects first if `connect()` was not called. A lost connection is re-established
    /// with backoff; once `max_reconnect_attempts` consecutive attempts have failed the
    /// subscriber gives up.
    ///
    /// # Returns
    /// `Ok(())` after `shutdown` was cancelled and the connection was closed
    ///
    /// # Errors
    /// Returns `BridgeError::SubscriptionLost` when reconnect attempts are exhausted
    pub async fn run(&mut self, shutdown: CancellationToken) -> BridgeResult<()> {
        info!("Subscribing to {}", self.connector.endpoint());
        self.backoff.reset();

        if self.connection.is_some() {
            self.set_state(SubscriberState::Listening);
        } else {
            self.set_state(SubscriberState::Connecting);
        }

        loop {
            match self.state() {
                SubscriberState::Disconnected | SubscriberState::Connecting => {
                    self.set_state(SubscriberState::Connecting);
                    let step = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => Step::Shutdown,
                        result = self.connector.connect() => Step::Done(result),
                    };

                    match step {
                        Step::Shutdown => self.set_state(SubscriberState::ShuttingDown),
                        Step::Done(Ok(connection)) => self.on_connected(connection),
                        Step::Done(Err(err)) => {
                            warn!(
                                "Failed to connect to {}: {}",
                                self.connector.endpoint(),
                                err
                            );
                            self.set_state(SubscriberState::ErrorBackoff);
                        }
                    }
                }
                SubscriberState::Listening => {
                    let Some(connection) = self.connection.as_mut() else {
                        self.set_state(SubscriberState::Connecting);
                        continue;
                    };

                    let step = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => Step::Shutdown,
                        received = connection.receive() => Step::Done(received),
                    };

                    match step {
                        Step::Shutdown => self.set_state(SubscriberState::ShuttingDown),
                        Step::Done(Ok(Some(message))) if !message.is_empty() => {
                            self.dispatch(message).await;
                        }
                        Step::Done(Ok(_)) => {
                            debug!("Skipping empty message or keep-alive frame");
                            self.stats.skipped += 1;
                        }
                        Step::Done(Err(err)) => {
                            warn!("Connection to {} lost: {}", self.connector.endpoint(), err);
                            self.drop_connection().await;
                            self.set_state(SubscriberState::ErrorBackoff);
                        }
                    }
                }
                SubscriberState::ErrorBackoff => {
                    let Some(delay) = self.backoff.next_delay_and_advance() else {
                        let attempts = self.backoff.attempts();
                        error!(
                            "Giving up on {} after {} consecutive reconnect attempts",
                            self.connector.endpoint(),
                            attempts
                        );
                        self.set_state(SubscriberState::Disconnected);
                        return Err(BridgeError::SubscriptionLost { attempts });
                    };

                    info!(
                        "Reconnection attempt {} of {}, waiting {}ms",
                        self.backoff.attempts(),
                        self.backoff.max_attempts(),
                        delay.as_millis()
                    );

                    let step = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => Step::Shutdown,
                        _ = tokio::time::sleep(delay) => Step::Done(()),
                    };

                    match step {
                        Step::Shutdown => self.set_state(SubscriberState::ShuttingDown),
                        Step::Done(()) => self.set_state(SubscriberState::Connecting),
                    }
                }
                SubscriberState::ShuttingDown => {
                    if let Some(mut connection) = self.connection.take() {
                        if let Err(err) = connection.close().await {
                            warn!("Error while closing connection: {}", err);
                        }
                    }
                    info!("Subscriber for {} shut down", self.connector.endpoint());
                    self.set_state(SubscriberState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    fn on_connected(&mut self, connection: C::Connection) {
        info!("Connected to {}", self.connector.endpoint());
        self.connection = Some(connection);
        self.stats.connections += 1;
        self.backoff.reset();
        self.set_state(SubscriberState::Listening);
    }

    async fn drop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            // The connection is already broken, a failed close is expected here
            if let Err(err) = connection.close().await {
                debug!("Close after connection loss failed: {}", err);
            }
        }
    }

    async fn dispatch(&mut self, message: String) {
        self.stats.dispatched += 1;

        let outcome = AssertUnwindSafe(self.handler.handle(&message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.stats.handler_failures += 1;
                warn!("Handler failed for message {:?}: {:#}", message, err);
            }
            Err(panic) => {
                self.stats.handler_failures += 1;
                error!(
                    "Handler panicked for message {:?}: {}",
                    message,
                    panic_message(&*panic)
                );
            }
        }
    }

    fn set_state(&self, state: SubscriberState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Subscriber state {:?} -> {:?}", previous, state);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffSchedule;
    use crate::handler::ChannelHandler;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    enum Frame {
        Message(&'static str),
        KeepAlive,
        Drop,
    }

    /// Each queued session is one `connect()` outcome: `None` fails, `Some` succeeds
    /// and plays the frames back. An exhausted session stays silent until shutdown.
    #[derive(Default)]
    struct ScriptedConnector {
        sessions: Mutex<VecDeque<Option<Vec<Frame>>>>,
        connects: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
    }

    impl ScriptedConnector {
        fn new(sessions: Vec<Option<Vec<Frame>>>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                ..Default::default()
            }
        }
    }

    struct ScriptedConnection {
        frames: VecDeque<Frame>,
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn receive(&mut self) -> BridgeResult<Option<String>> {
            match self.frames.pop_front() {
                Some(Frame::Message(text)) => Ok(Some(text.to_string())),
                Some(Frame::KeepAlive) => Ok(None),
                Some(Frame::Drop) => Err(BridgeError::Connection("connection reset".into())),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> BridgeResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Connection = ScriptedConnection;

        async fn connect(&self) -> BridgeResult<ScriptedConnection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let session = self.sessions.lock().unwrap().pop_front().flatten();
            match session {
                Some(frames) => Ok(ScriptedConnection {
                    frames: frames.into(),
                    closes: self.closes.clone(),
                }),
                None => Err(BridgeError::Connection("connection refused".into())),
            }
        }

        fn endpoint(&self) -> &str {
            "scripted://queue"
        }
    }

    /// Records every message; fails on "boom" and panics on "panic".
    #[derive(Clone, Default)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: &str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(message.to_string());
            match message {
                "boom" => anyhow::bail!("handler exploded"),
                "panic" => panic!("handler panicked"),
                _ => Ok(()),
            }
        }
    }

    fn config(max_attempts: u32, delay: Duration) -> BridgeConfig {
        BridgeConfig::new("ws://localhost:8080/ws")
            .unwrap()
            .with_max_reconnect_attempts(max_attempts)
            .unwrap()
            .with_backoff(BackoffSchedule::fixed(delay, delay, 1.0))
            .unwrap()
    }

    #[tokio::test]
    async fn delivers_in_order_and_skips_empty_messages() {
        let connector = ScriptedConnector::new(vec![Some(vec![
            Frame::Message("a"),
            Frame::KeepAlive,
            Frame::Message(""),
            Frame::Message("  "),
            Frame::Message("b"),
            Frame::Message("c"),
            Frame::Drop,
        ])]);
        let handler = RecordingHandler::default();
        let seen = handler.seen.clone();
        let mut subscriber = Subscriber::new(connector, handler, &config(2, Duration::from_millis(1)));

        let result = subscriber.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(BridgeError::SubscriptionLost { attempts: 2 })));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "  ", "b", "c"]);
        assert_eq!(subscriber.messages_dispatched(), 4);
        assert_eq!(subscriber.stats().skipped, 2);
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);
    }

    #[tokio::test]
    async fn whitespace_only_messages_reach_the_handler() {
        let connector = ScriptedConnector::new(vec![Some(vec![
            Frame::Message(" "),
            Frame::Message("\n"),
            Frame::Drop,
        ])]);
        let handler = RecordingHandler::default();
        let seen = handler.seen.clone();
        let mut subscriber = Subscriber::new(connector, handler, &config(1, Duration::from_millis(1)));

        let result = subscriber.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(BridgeError::SubscriptionLost { attempts: 1 })));
        assert_eq!(*seen.lock().unwrap(), vec![" ", "\n"]);
        assert_eq!(subscriber.messages_dispatched(), 2);
        assert_eq!(subscriber.stats().skipped, 0);
    }

    #[tokio::test]
    async fn handler_failures_do_not_stop_the_loop() {
        let connector = ScriptedConnector::new(vec![Some(vec![
            Frame::Message("boom"),
            Frame::Message("x"),
            Frame::Message("panic"),
            Frame::Message("y"),
            Frame::Drop,
        ])]);
        let handler = RecordingHandler::default();
        let seen = handler.seen.clone();
        let mut subscriber = Subscriber::new(connector, handler, &config(1, Duration::from_millis(1)));

        let result = subscriber.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(BridgeError::SubscriptionLost { .. })));
        assert_eq!(*seen.lock().unwrap(), vec!["boom", "x", "panic", "y"]);
        assert_eq!(subscriber.stats().dispatched, 4);
        assert_eq!(subscriber.stats().handler_failures, 2);
    }

    #[tokio::test]
    async fn reconnects_after_drop_and_resets_backoff() {
        let connector = ScriptedConnector::new(vec![
            Some(vec![Frame::Message("a"), Frame::Drop]),
            None,
            Some(vec![Frame::Message("b"), Frame::Drop]),
        ]);
        let connects = connector.connects.clone();
        let closes = connector.closes.clone();
        let handler = RecordingHandler::default();
        let seen = handler.seen.clone();
        let mut subscriber = Subscriber::new(connector, handler, &config(3, Duration::from_millis(1)));

        let result = subscriber.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(BridgeError::SubscriptionLost { attempts: 3 })));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        // initial + failed + successful reconnect + three exhausted attempts
        assert_eq!(connects.load(Ordering::SeqCst), 6);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert_eq!(subscriber.stats().connections, 2);
    }

    #[tokio::test]
    async fn gives_up_when_the_server_is_never_reachable() {
        let connector = ScriptedConnector::new(vec![]);
        let connects = connector.connects.clone();
        let mut subscriber = Subscriber::new(
            connector,
            RecordingHandler::default(),
            &config(3, Duration::from_millis(1)),
        );

        let result = subscriber.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(BridgeError::SubscriptionLost { attempts: 3 })));
        assert_eq!(connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn shutdown_closes_the_connection() {
        let connector = ScriptedConnector::new(vec![Some(vec![Frame::Message("a")])]);
        let closes = connector.closes.clone();
        let (handler, mut messages) = ChannelHandler::channel(8);
        let mut subscriber = Subscriber::new(connector, handler, &config(3, Duration::from_millis(1)));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = subscriber.run(token).await;
            (subscriber, result)
        });

        assert_eq!(messages.recv().await.as_deref(), Some("a"));
        shutdown.cancel();

        let (subscriber, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!subscriber.is_connected());
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let connector = ScriptedConnector::new(vec![]);
        let mut subscriber = Subscriber::new(
            connector,
            RecordingHandler::default(),
            &config(5, Duration::from_secs(60)),
        );
        let mut state = subscriber.watch_state();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { subscriber.run(token).await });

        state
            .wait_for(|s| *s == SubscriberState::ErrorBackoff)
            .await
            .unwrap();
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn explicit_connect_reports_connection_errors() {
        let mut subscriber = Subscriber::new(
            ScriptedConnector::new(vec![None, Some(vec![])]),
            RecordingHandler::default(),
            &config(1, Duration::from_millis(1)),
        );

        assert!(matches!(
            subscriber.connect().await,
            Err(BridgeError::Connection(_))
        ));
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);

        subscriber.connect().await.unwrap();
        assert!(subscriber.is_connected());
        assert_eq!(subscriber.state(), SubscriberState::Listening);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*boxed), "non-string panic payload");
    }
}
