//! Supervising the streaming connection across failures

use std::{
    collections::{HashMap, HashSet},
    error, fmt,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use brewlink_clock::{Clock, System};
use brewlink_tokens::{
    backoff::ErrorBackoffConfig, AuthorizedCall, AuthorizedExecutor, TokenBundle, TokenError,
    TokenManager, UnauthenticatedReason,
};
use futures_util::Stream;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    lifecycle::{ConnectionState, Event, Lifecycle},
    tracked::{Tracked, TrackedSet},
    ClientMessage, SerialNumber, SerialNumberRef, ServerMessage, StateReport, StreamConnection,
    StreamConnector, StreamError, SupervisorError,
};

/// The application identifier announced when registering appliances
pub const DEFAULT_APP: &str = "sageCoffee";

/// The appliance model announced when none is given
pub const DEFAULT_MODEL: &str = "BES995";

/// How a transport confirms that an appliance was registered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegistrationMode {
    /// Registration needs no confirmation; the connection is live once every
    /// registration has been sent
    #[default]
    FireAndForget,
    /// The connection is live once a state report has arrived for every
    /// registered appliance
    ///
    /// If not every appliance reports within `timeout`, the connection is
    /// treated as lost.
    AwaitAcknowledgement {
        /// How long to wait for the reports
        timeout: Duration,
    },
}

/// Configuration for a [`ConnectionSupervisor`]
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    app: String,
    model: String,
    backoff: ErrorBackoffConfig,
    connect_timeout: Duration,
    send_timeout: Duration,
    ping_interval: Duration,
    heartbeat_timeout: Option<Duration>,
    registration: RegistrationMode,
    report_buffer: usize,
}

impl Default for SupervisorConfig {
    /// Announces the `sageCoffee` app, pings every 30 seconds, and reconnects
    /// after 1 second doubling up to 30 seconds, spread by ±50%
    fn default() -> Self {
        Self {
            app: DEFAULT_APP.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            backoff: ErrorBackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            heartbeat_timeout: None,
            registration: RegistrationMode::FireAndForget,
            report_buffer: 64,
        }
    }
}

impl SupervisorConfig {
    /// Announces `app` when registering appliances
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    /// Announces `model` for appliances subscribed without one
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets how reconnect delays grow
    pub fn with_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the deadline for establishing a connection
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the deadline for sending a single message
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets how often a ping is sent
    ///
    /// Intervals below one second are raised to one second.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval.max(Duration::from_secs(1));
        self
    }

    /// Treats a connection that has been silent for `timeout` as lost
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Sets how registrations are confirmed
    pub fn with_registration(mut self, registration: RegistrationMode) -> Self {
        self.registration = registration;
        self
    }

    /// Sets how many undelivered reports are buffered for the [`ReportStream`]
    ///
    /// Reports arriving while the buffer is full are dropped; the latest report
    /// for each appliance stays available from [`SupervisorHandle::last_report()`].
    pub fn with_report_buffer(mut self, capacity: usize) -> Self {
        self.report_buffer = capacity.max(1);
        self
    }
}

/// Keeps a streaming connection alive and registered for the tracked appliances
///
/// Before every connection attempt a valid token is obtained from the
/// [`TokenManager`]. A handshake rejecting the credentials forces one refresh
/// and one more attempt; a second rejection, or a refresh token the authority
/// no longer accepts, closes the supervisor for good.
///
/// Once connected, every tracked appliance is registered in the order it was
/// added. Appliances added later are registered individually once the
/// connection is live. Any loss of the connection leads to a reconnect after
/// a backoff delay.
pub struct ConnectionSupervisor<K, C = System> {
    connector: K,
    executor: AuthorizedExecutor<C>,
    config: SupervisorConfig,
}

impl<K, C> ConnectionSupervisor<K, C>
where
    K: StreamConnector,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a supervisor connecting through `connector` with credentials from `tokens`
    pub fn new(connector: K, tokens: TokenManager<C>, config: SupervisorConfig) -> Self {
        Self {
            connector,
            executor: AuthorizedExecutor::new(tokens),
            config,
        }
    }

    /// Starts supervising in a background task
    ///
    /// The task runs until [`SupervisorHandle::shutdown()`] is called, every
    /// handle is dropped, or the credentials become unusable.
    pub fn spawn(self) -> (SupervisorHandle, ReportStream) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            tracked: TrackedSet::default(),
            latest: Mutex::new(HashMap::new()),
            state,
            last_failure: Mutex::new(None),
            close_reason: Mutex::new(None),
            default_model: self.config.model.clone(),
        });

        let (registrations_tx, registrations_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::channel(self.config.report_buffer);
        let cancel = CancellationToken::new();

        let task = Task {
            lifecycle: Lifecycle::new(self.config.backoff.clone()),
            connector: self.connector,
            executor: self.executor,
            config: self.config,
            shared: Arc::clone(&shared),
            registrations: registrations_rx,
            reports: reports_tx,
            presented: None,
            rejected: None,
            refreshed_for_rejection: false,
        };
        tokio::spawn(task.run(cancel.clone()));

        let handle = SupervisorHandle {
            shared,
            registrations: registrations_tx,
            _guard: Arc::new(cancel.clone().drop_guard()),
            cancel,
        };

        (handle, ReportStream { rx: reports_rx })
    }
}

impl<K: fmt::Debug, C: fmt::Debug> fmt::Debug for ConnectionSupervisor<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("connector", &self.connector)
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish()
    }
}

struct Shared {
    tracked: TrackedSet,
    latest: Mutex<HashMap<SerialNumber, StateReport>>,
    state: watch::Sender<ConnectionState>,
    last_failure: Mutex<Option<Instant>>,
    close_reason: Mutex<Option<SupervisorError>>,
    default_model: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Controls a running [`ConnectionSupervisor`]
///
/// Handles are cheap to clone. Once every handle has been dropped the
/// supervisor shuts down.
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
    registrations: mpsc::UnboundedSender<SerialNumber>,
    cancel: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl SupervisorHandle {
    /// Tracks an appliance of the default model
    ///
    /// Returns `false` if the appliance was already tracked.
    pub fn subscribe(&self, serial_number: impl Into<SerialNumber>) -> bool {
        let model = self.shared.default_model.clone();
        self.subscribe_model(serial_number, model)
    }

    /// Tracks an appliance, announcing `model` when registering it
    ///
    /// The appliance is registered on the current connection once it is live,
    /// and on every connection after that. Returns `false` if the appliance
    /// was already tracked.
    pub fn subscribe_model(
        &self,
        serial_number: impl Into<SerialNumber>,
        model: impl Into<String>,
    ) -> bool {
        let serial_number = serial_number.into();
        let added = self.shared.tracked.insert(Tracked {
            serial_number: serial_number.clone(),
            model: model.into(),
        });

        if added {
            tracing::debug!(serial = %serial_number, "tracking appliance");
            let _ = self.registrations.send(serial_number);
        }

        added
    }

    /// Stops tracking an appliance
    ///
    /// The backend offers no way to unregister, so the appliance stays
    /// registered until the connection is replaced. Its reports are discarded
    /// in the meantime. Returns `false` if the appliance was not tracked.
    pub fn unsubscribe(&self, serial_number: &SerialNumberRef) -> bool {
        let removed = self.shared.tracked.remove(serial_number);
        if removed {
            tracing::debug!(serial = %serial_number, "no longer tracking appliance");
            lock(&self.shared.latest).remove(serial_number);
        }
        removed
    }

    /// The tracked appliances in the order they were added
    pub fn tracked(&self) -> Vec<SerialNumber> {
        self.shared
            .tracked
            .snapshot()
            .into_iter()
            .map(|t| t.serial_number)
            .collect()
    }

    /// Watches the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The current connection state
    pub fn current_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// The latest report received for an appliance
    pub fn last_report(&self, serial_number: &SerialNumberRef) -> Option<StateReport> {
        lock(&self.shared.latest).get(serial_number).cloned()
    }

    /// When a connection attempt last failed or a connection was last lost
    pub fn last_failure(&self) -> Option<Instant> {
        *lock(&self.shared.last_failure)
    }

    /// Why the supervisor closed, if it closed on an error
    pub fn close_reason(&self) -> Option<SupervisorError> {
        lock(&self.shared.close_reason).clone()
    }

    /// Closes the connection and stops reconnecting
    ///
    /// Waits until the supervisor has closed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut state = self.state();
        let _ = state.wait_for(|s| s.is_closed()).await;
    }
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("state", &self.current_state())
            .field("tracked", &self.tracked())
            .finish()
    }
}

/// The state reports received by a [`ConnectionSupervisor`]
///
/// Reports arrive only for tracked appliances. A message the backend sent
/// that could not be decoded is yielded as an error and the stream carries on.
/// So is a failed connection attempt that reconnecting is unlikely to fix, such
/// as an undecodable token response; the supervisor keeps retrying it with
/// backoff. If the supervisor closes because the credentials became unusable, that
/// error is yielded last. The stream ends once the supervisor has closed.
pub struct ReportStream {
    rx: mpsc::Receiver<Result<StateReport, SupervisorError>>,
}

impl Stream for ReportStream {
    type Item = Result<StateReport, SupervisorError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for ReportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportStream").finish_non_exhaustive()
    }
}

/// Establishes a connection as an [`AuthorizedCall`], so that a rejected
/// handshake is refreshed and retried exactly once
struct ConnectCall<'a, K> {
    connector: &'a K,
    timeout: Duration,
    presented: Option<TokenBundle>,
    attempts: usize,
}

#[async_trait]
impl<'a, K: StreamConnector> AuthorizedCall for ConnectCall<'a, K> {
    type Output = K::Connection;
    type Error = StreamError;

    async fn call(&mut self, bundle: &TokenBundle) -> Result<K::Connection, StreamError> {
        self.presented = Some(bundle.clone());
        self.attempts += 1;
        tokio::time::timeout(self.timeout, self.connector.connect(bundle))
            .await
            .map_err(|_| StreamError::Timeout(self.timeout))?
    }

    fn is_unauthorized(&self, result: &Result<K::Connection, StreamError>) -> bool {
        matches!(result, Err(StreamError::Unauthorized))
    }
}

enum LiveEvent {
    Received(Result<Option<ServerMessage>, StreamError>),
    Register(Option<SerialNumber>),
    Ping,
    Silent,
}

struct Task<K, C> {
    lifecycle: Lifecycle,
    connector: K,
    executor: AuthorizedExecutor<C>,
    config: SupervisorConfig,
    shared: Arc<Shared>,
    registrations: mpsc::UnboundedReceiver<SerialNumber>,
    reports: mpsc::Sender<Result<StateReport, SupervisorError>>,
    presented: Option<TokenBundle>,
    rejected: Option<TokenBundle>,
    /// The current connection presents a bundle refreshed because the
    /// backend rejected the previous one, and the backend has not answered yet
    refreshed_for_rejection: bool,
}

impl<K, C> Task<K, C>
where
    K: StreamConnector,
    C: Clock + Clone + Send + Sync + 'static,
{
    async fn run(mut self, cancel: CancellationToken) {
        self.advance(Event::Start);

        let outcome = loop {
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                connected = self.connect() => connected,
            };

            let lost = match connected {
                Ok(mut connection) => {
                    self.advance(Event::Connected);
                    let ended = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        lost = self.serve(&mut connection) => Some(lost),
                    };
                    close_quietly(&mut connection, self.config.send_timeout).await;

                    match ended {
                        Some(lost) if lost.is_terminal() => break Err(lost),
                        Some(lost) => lost,
                        None => break Ok(()),
                    }
                }
                Err(err) if err.is_terminal() => break Err(err),
                Err(err) if !err.is_transient() => {
                    tracing::error!(
                        error = (&err as &dyn error::Error),
                        "connection attempt failed, reconnecting is unlikely to help"
                    );
                    self.deliver(Err(err.clone()));
                    err
                }
                Err(err) => err,
            };

            *lock(&self.shared.last_failure) = Some(Instant::now());
            let delay = self.advance(Event::Lost).unwrap_or_default();
            tracing::warn!(
                error = (&lost as &dyn error::Error),
                attempt = self.lifecycle.attempt(),
                delay_ms = delay.as_millis() as u64,
                "stream connection lost, will reconnect"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            self.advance(Event::BackoffElapsed);
        };

        match outcome {
            Ok(()) => {
                tracing::info!("stream supervisor shut down");
                self.advance(Event::Shutdown);
            }
            Err(err) => {
                tracing::error!(
                    error = (&err as &dyn error::Error),
                    "credentials no longer accepted, closing stream"
                );
                *lock(&self.shared.close_reason) = Some(err.clone());
                let timeout = self.config.send_timeout;
                let sent = tokio::time::timeout(timeout, self.reports.send(Err(err))).await;
                if sent.is_err() {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "report stream is not keeping up, closing error not delivered"
                    );
                }
                self.advance(Event::Unauthenticated);
            }
        }
    }

    fn advance(&mut self, event: Event) -> Option<Duration> {
        match self.lifecycle.apply(event) {
            Ok(transition) => {
                tracing::debug!(state = %transition.state, "stream state changed");
                self.shared.state.send_replace(transition.state);
                transition.delay
            }
            Err(err) => {
                tracing::error!(
                    error = (&err as &dyn error::Error),
                    "ignoring impossible lifecycle event"
                );
                None
            }
        }
    }

    async fn connect(&mut self) -> Result<K::Connection, SupervisorError> {
        self.refreshed_for_rejection = false;

        if let Some(rejected) = self.rejected.take() {
            tracing::debug!("credentials rejected by the backend, forcing a token refresh");
            if let Err(err) = self.executor.tokens().force_refresh_after(&rejected).await {
                if !err.is_terminal() {
                    self.rejected = Some(rejected);
                }
                return Err(err.into());
            }
            self.refreshed_for_rejection = true;
        }

        let mut call = ConnectCall {
            connector: &self.connector,
            timeout: self.config.connect_timeout,
            presented: None,
            attempts: 0,
        };
        let connection = self.executor.execute(&mut call).await;
        self.presented = call.presented;
        self.refreshed_for_rejection |= call.attempts > 1;

        Ok(connection?)
    }

    /// Registers the tracked appliances and serves the connection until it is lost
    async fn serve(&mut self, connection: &mut K::Connection) -> SupervisorError {
        let snapshot = self.shared.tracked.snapshot();
        let mut registered = HashSet::with_capacity(snapshot.len());

        for tracked in &snapshot {
            if let Err(err) = self.register(connection, tracked).await {
                return err.into();
            }
            registered.insert(tracked.serial_number.clone());
        }

        if let RegistrationMode::AwaitAcknowledgement { timeout } = self.config.registration {
            if let Err(err) = self.await_acknowledgements(connection, &registered, timeout).await {
                return err;
            }
        }

        self.advance(Event::Registered);
        tracing::info!(appliances = registered.len(), "stream live");

        self.live(connection, registered).await
    }

    async fn register(
        &mut self,
        connection: &mut K::Connection,
        tracked: &Tracked,
    ) -> Result<(), StreamError> {
        tracing::debug!(serial = %tracked.serial_number, "registering appliance");
        let message = ClientMessage::AddAppliance {
            serial_number: tracked.serial_number.clone(),
            app: self.config.app.clone(),
            model: tracked.model.clone(),
        };
        send(connection, &message, self.config.send_timeout).await
    }

    async fn await_acknowledgements(
        &mut self,
        connection: &mut K::Connection,
        registered: &HashSet<SerialNumber>,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + timeout;
        let mut pending = registered.clone();

        while !pending.is_empty() {
            let received = tokio::time::timeout_at(deadline, connection.receive())
                .await
                .map_err(|_| StreamError::Timeout(timeout))?;

            if let Some(serial_number) = self.handle_inbound(received)? {
                pending.remove(&serial_number);
            }
        }

        Ok(())
    }

    async fn live(
        &mut self,
        connection: &mut K::Connection,
        mut registered: HashSet<SerialNumber>,
    ) -> SupervisorError {
        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let silence = self.config.heartbeat_timeout;
        let mut last_heard = Instant::now();
        let mut registrations_open = true;

        loop {
            let event = tokio::select! {
                received = connection.receive() => LiveEvent::Received(received),
                serial = self.registrations.recv(), if registrations_open => LiveEvent::Register(serial),
                _ = ping.tick() => LiveEvent::Ping,
                _ = tokio::time::sleep_until(last_heard + silence.unwrap_or_default()), if silence.is_some() => LiveEvent::Silent,
            };

            match event {
                LiveEvent::Received(received) => match self.handle_inbound(received) {
                    Ok(_) => last_heard = Instant::now(),
                    Err(err) => return err,
                },
                LiveEvent::Register(Some(serial_number)) => {
                    if registered.contains(&serial_number) {
                        continue;
                    }
                    let Some(tracked) = self.shared.tracked.get(&serial_number) else {
                        continue;
                    };
                    if let Err(err) = self.register(connection, &tracked).await {
                        return err.into();
                    }
                    registered.insert(serial_number);
                }
                LiveEvent::Register(None) => registrations_open = false,
                LiveEvent::Ping => {
                    tracing::trace!("sending ping");
                    if let Err(err) =
                        send(connection, &ClientMessage::Ping, self.config.send_timeout).await
                    {
                        return err.into();
                    }
                }
                LiveEvent::Silent => {
                    let timeout = silence.unwrap_or_default();
                    tracing::warn!(
                        silent_ms = timeout.as_millis() as u64,
                        "nothing heard from the backend, dropping connection"
                    );
                    return StreamError::Timeout(timeout).into();
                }
            }
        }
    }

    /// Handles one inbound message, returning the serial number of a delivered report
    fn handle_inbound(
        &mut self,
        received: Result<Option<ServerMessage>, StreamError>,
    ) -> Result<Option<SerialNumber>, SupervisorError> {
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => return Err(StreamError::Closed.into()),
            Err(err) if err.is_connection_lost() => return Err(err.into()),
            Err(err) => {
                tracing::warn!(
                    error = (&err as &dyn error::Error),
                    "discarding undecodable message"
                );
                self.deliver(Err(err.into()));
                return Ok(None);
            }
        };

        match message {
            ServerMessage::StateReport(report) => {
                self.refreshed_for_rejection = false;
                if !self.shared.tracked.contains(&report.serial_number) {
                    tracing::debug!(serial = %report.serial_number, "discarding report for untracked appliance");
                    return Ok(None);
                }

                tracing::trace!(serial = %report.serial_number, version = ?report.version, "state report");
                let serial_number = report.serial_number.clone();
                lock(&self.shared.latest).insert(serial_number.clone(), report.clone());
                self.deliver(Ok(report));
                Ok(Some(serial_number))
            }
            ServerMessage::Pong => {
                tracing::trace!("received pong");
                self.refreshed_for_rejection = false;
                Ok(None)
            }
            ServerMessage::Forbidden if self.refreshed_for_rejection => {
                tracing::warn!("backend refused credentials issued after a rejection");
                Err(TokenError::from(UnauthenticatedReason::RejectedAfterRefresh).into())
            }
            ServerMessage::Forbidden => {
                tracing::warn!("backend refused the connection's credentials");
                self.rejected = self.presented.take();
                Err(StreamError::Unauthorized.into())
            }
            ServerMessage::Other(value) => {
                tracing::debug!(payload = %value, "ignoring unrecognized message");
                Ok(None)
            }
        }
    }

    fn deliver(&self, item: Result<StateReport, SupervisorError>) {
        match self.reports.try_send(item) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("report stream is not keeping up, dropping report");
            }
        }
    }
}

async fn send<T: StreamConnection>(
    connection: &mut T,
    message: &ClientMessage,
    timeout: Duration,
) -> Result<(), StreamError> {
    tokio::time::timeout(timeout, connection.send(message))
        .await
        .map_err(|_| StreamError::Timeout(timeout))?
}

async fn close_quietly<T: StreamConnection>(connection: &mut T, timeout: Duration) {
    match tokio::time::timeout(timeout, connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(
            error = (&err as &dyn error::Error),
            "error closing stream connection"
        ),
        Err(_) => tracing::debug!("timed out closing stream connection"),
    }
}
