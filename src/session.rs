// Availability Session
//
// Single-task driver that wires the connection manager, codec, slot store,
// reservation coordinator and presence aggregator together. Every state
// transition happens inside `run` in response to a user command, an inbound
// frame or a timer; the UI talks to it only through `SessionHandle`.

use crate::codec::{ClaimResult, ServerMessage, UpdateCodec, UpdateEvent};
use crate::config::SyncConfig;
use crate::connection::{Channel, ConnectionManager, ConnectionState, Connector, Inbound};
use crate::error::{Result, SelectError, SyncError, TransportError};
use crate::model::{ClientId, SlotRef, SlotTime, SubscriptionKey};
use crate::presence::{PresenceAggregator, PresenceSnapshot};
use crate::protocol::ClientFrame;
use crate::reservation::{ClaimDisposition, ClaimState, ClaimUpdate, ReservationCoordinator};
use crate::store::{ApplyOutcome, SlotStateStore, SlotView};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 32;
const NOTIFICATION_BUFFER: usize = 256;

/// Connect attempt in flight, polled by the session loop
type ConnectAttempt = Pin<Box<dyn Future<Output = Result<Box<dyn Channel>, TransportError>> + Send>>;

/// Requests from the UI to the session task
#[derive(Debug)]
pub enum SessionCommand {
    Subscribe(SubscriptionKey),
    Select {
        time: SlotTime,
        reply: oneshot::Sender<Result<ClaimUpdate, SelectError>>,
    },
    Cancel,
    Finish {
        reply: oneshot::Sender<Option<SlotRef>>,
    },
    Refresh,
    Shutdown,
}

/// Everything the session tells its observers
#[derive(Debug, Clone)]
pub enum SyncNotification {
    Connection(ConnectionState),
    Slots(SlotView),
    Claim(ClaimUpdate),
    Activity(PresenceSnapshot),
    /// Every validated update, before it is applied
    Update(UpdateEvent),
}

/// Cloneable front end for one session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<SlotView>,
    state: watch::Receiver<ConnectionState>,
    claim: watch::Receiver<ClaimState>,
    notifications: broadcast::Sender<SyncNotification>,
    client_id: ClientId,
}

impl SessionHandle {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Select(SelectError::SessionClosed))
    }

    /// Watch (providerId, serviceId, date); connects on first use
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<()> {
        self.command(SessionCommand::Subscribe(key)).await
    }

    /// Start a claim on a slot of the active subscription
    pub async fn select(&self, time: SlotTime) -> Result<ClaimUpdate, SelectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Select { time, reply })
            .await
            .map_err(|_| SelectError::SessionClosed)?;
        rx.await.map_err(|_| SelectError::SessionClosed)?
    }

    pub async fn cancel(&self) -> Result<()> {
        self.command(SessionCommand::Cancel).await
    }

    /// Hand a confirmed claim over to the booking flow
    pub async fn finish(&self) -> Result<Option<SlotRef>> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Finish { reply }).await?;
        rx.await
            .map_err(|_| SyncError::Select(SelectError::SessionClosed))
    }

    /// Ask for a fresh snapshot, or reconnect from scratch when offline
    pub async fn refresh(&self) -> Result<()> {
        self.command(SessionCommand::Refresh).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command(SessionCommand::Shutdown).await
    }

    pub fn view(&self) -> SlotView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<SlotView> {
        self.view.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn claim_state(&self) -> ClaimState {
        *self.claim.borrow()
    }

    pub fn watch_claim(&self) -> watch::Receiver<ClaimState> {
        self.claim.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifications.subscribe()
    }
}

/// Session task state
pub struct AvailabilitySession {
    url: String,
    connect_timeout: Duration,
    ping_interval: Duration,
    connector: Arc<dyn Connector>,
    channel: Option<Box<dyn Channel>>,
    connecting: Option<ConnectAttempt>,
    manager: ConnectionManager,
    codec: UpdateCodec,
    store: SlotStateStore,
    coordinator: ReservationCoordinator,
    presence: PresenceAggregator,
    next_ping: Option<Instant>,
    commands: mpsc::Receiver<SessionCommand>,
    view_tx: watch::Sender<SlotView>,
    state_tx: watch::Sender<ConnectionState>,
    claim_tx: watch::Sender<ClaimState>,
    events: broadcast::Sender<SyncNotification>,
}

impl AvailabilitySession {
    pub fn new(config: &SyncConfig, connector: Arc<dyn Connector>) -> (Self, SessionHandle) {
        let client_id = config.client_id();
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view) = watch::channel(SlotView::default());
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (claim_tx, claim) = watch::channel(ClaimState::None);
        let (events, _) = broadcast::channel(NOTIFICATION_BUFFER);

        let session = Self {
            url: config.server.endpoint(),
            connect_timeout: config.server.connect_timeout(),
            ping_interval: config.heartbeat.ping_interval(),
            connector,
            channel: None,
            connecting: None,
            manager: ConnectionManager::new(
                config.reconnect.policy(),
                config.heartbeat.idle_timeout(),
            ),
            codec: UpdateCodec::new(),
            store: SlotStateStore::new(),
            coordinator: ReservationCoordinator::new(
                client_id.clone(),
                config.reservation.claim_timeout(),
            ),
            presence: PresenceAggregator::new(config.presence.activity_capacity),
            next_ping: None,
            commands,
            view_tx,
            state_tx,
            claim_tx,
            events: events.clone(),
        };
        let handle = SessionHandle {
            commands: command_tx,
            view,
            state,
            claim,
            notifications: events,
            client_id,
        };
        (session, handle)
    }

    /// Build a session and run it on the current runtime
    pub fn spawn(config: &SyncConfig, connector: Arc<dyn Connector>) -> (SessionHandle, JoinHandle<()>) {
        let (session, handle) = Self::new(config, connector);
        (handle, tokio::spawn(session.run()))
    }

    pub async fn run(mut self) {
        info!(
            client = %self.coordinator.client_id(),
            url = %self.url,
            "Availability session started"
        );

        loop {
            let retry_at = self.manager.retry_at();
            let idle_at = self.manager.idle_deadline();
            let ping_at = self.next_ping;
            let claim_at = self.coordinator.deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                inbound = recv_from(&mut self.channel) => self.handle_inbound(inbound).await,
                attempt = poll_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(attempt).await;
                }
                _ = sleep_until_opt(retry_at) => self.connect(),
                _ = sleep_until_opt(idle_at) => {
                    warn!("No traffic within the idle window; dropping channel");
                    self.drop_channel().await;
                }
                _ = sleep_until_opt(ping_at) => self.send_ping().await,
                _ = sleep_until_opt(claim_at) => self.expire_claim(),
            }
        }

        self.teardown().await;
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Subscribe(key) => self.subscribe(key).await,
            SessionCommand::Select { time, reply } => {
                let result = self.select(time).await;
                let _ = reply.send(result);
            }
            SessionCommand::Cancel => {
                if let Some(update) = self.coordinator.cancel() {
                    self.release(update.slot.clone()).await;
                    self.publish_claim(update);
                    self.publish_view();
                }
            }
            SessionCommand::Finish { reply } => {
                let finished = self.coordinator.finish();
                if let Some(slot) = &finished {
                    self.publish_claim(ClaimUpdate {
                        state: ClaimState::None,
                        slot: slot.clone(),
                        reason: None,
                    });
                    self.publish_view();
                }
                let _ = reply.send(finished);
            }
            SessionCommand::Refresh => self.refresh().await,
            SessionCommand::Shutdown => {}
        }
    }

    async fn subscribe(&mut self, key: SubscriptionKey) {
        if self.store.key() == Some(&key) {
            return;
        }
        info!(subscription = %key, "Subscribing");

        // A claim never outlives the subscription it was made under
        if let Some(update) = self.coordinator.cancel() {
            self.release(update.slot.clone()).await;
            self.publish_claim(update);
        }

        self.store.set_subscription(key.clone());
        self.presence.clear();
        self.notify(SyncNotification::Activity(self.presence.snapshot()));

        let frames = self.manager.set_subscription(key);
        for frame in frames {
            self.send(frame).await;
        }
        self.publish_state();
        self.publish_view();

        if matches!(
            self.manager.state(),
            ConnectionState::Disconnected | ConnectionState::Offline
        ) {
            self.manager.reset_attempts();
            self.connect();
        }
    }

    async fn select(&mut self, time: SlotTime) -> Result<ClaimUpdate, SelectError> {
        let view = self.store.snapshot(None);
        let update = self.coordinator.select(time, &view, Instant::now())?;

        let slot = update.slot.clone();
        self.send(ClientFrame::ClaimSlot {
            slot: slot.clone(),
            client_id: self.coordinator.client_id().clone(),
        })
        .await;
        self.send(ClientFrame::SlotSelected { slot }).await;

        self.publish_claim(update.clone());
        self.publish_view();
        Ok(update)
    }

    async fn refresh(&mut self) {
        match self.manager.state() {
            ConnectionState::Disconnected
            | ConnectionState::Offline
            | ConnectionState::Reconnecting => {
                info!("Manual refresh; reconnecting");
                self.manager.reset_attempts();
                self.connect();
            }
            ConnectionState::Connecting => {}
            ConnectionState::Connected | ConnectionState::Subscribed => {
                info!("Manual refresh; requesting snapshot");
                self.request_resync().await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Start a connect attempt; the loop picks up the result
    fn connect(&mut self) {
        if !self.manager.start_connect() {
            return;
        }
        self.publish_state();
        debug!(url = %self.url, "Connecting");

        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let limit = self.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            let attempt = tokio::time::timeout(limit, connector.connect(&url)).await;
            match attempt {
                Ok(result) => result,
                Err(_) => Err(TransportError::Connect {
                    url,
                    reason: format!("timed out after {:?}", limit),
                }),
            }
        }));
    }

    async fn on_connect_result(&mut self, attempt: Result<Box<dyn Channel>, TransportError>) {
        let now = Instant::now();
        let channel = match attempt {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                self.manager.on_connect_failed(now);
                self.publish_state();
                return;
            }
        };

        self.channel = Some(channel);
        self.next_ping = Some(now + self.ping_interval);
        let frames = self.manager.on_connected(now);
        self.publish_state();
        for frame in frames {
            self.send(frame).await;
        }

        // Claims are idempotent per client and slot, so a claim still pending
        // across the drop is repeated on the new channel
        let pending = self
            .coordinator
            .current()
            .filter(|claim| claim.state == ClaimState::Pending)
            .map(|claim| claim.slot.clone());
        if let Some(slot) = pending {
            debug!(slot = %slot, "Repeating pending claim after reconnect");
            self.send(ClientFrame::ClaimSlot {
                slot,
                client_id: self.coordinator.client_id().clone(),
            })
            .await;
        }
    }

    async fn drop_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.next_ping = None;
        self.manager.on_channel_lost(Instant::now());
        self.publish_state();
    }

    /// Send one frame; a failed send drops the channel and starts reconnecting
    async fn send(&mut self, frame: ClientFrame) -> bool {
        let Some(channel) = self.channel.as_mut() else {
            debug!(kind = frame.kind(), "No channel; frame not sent");
            return false;
        };
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, kind = frame.kind(), "Failed to encode frame");
                return false;
            }
        };
        debug!(kind = frame.kind(), "Sending frame");
        if let Err(e) = channel.send(text).await {
            warn!(error = %e, kind = frame.kind(), "Send failed; dropping channel");
            self.drop_channel().await;
            return false;
        }
        true
    }

    async fn send_ping(&mut self) {
        self.next_ping = Some(Instant::now() + self.ping_interval);
        self.send(ClientFrame::Ping {}).await;
    }

    async fn request_resync(&mut self) {
        match self.manager.resync_frame() {
            Some(frame) => {
                info!("Requesting fresh snapshot");
                self.send(frame).await;
            }
            None => debug!("No channel; snapshot will follow the next subscribe"),
        }
    }

    async fn release(&mut self, slot: SlotRef) {
        let client_id = self.coordinator.client_id().clone();
        self.send(ClientFrame::ReleaseSlot { slot, client_id }).await;
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn handle_inbound(&mut self, inbound: Result<Inbound, TransportError>) {
        let now = Instant::now();
        match inbound {
            Ok(Inbound::Text(text)) => {
                self.manager.on_inbound(now);
                let Some(message) = self.codec.accept(&text) else {
                    return;
                };
                match message {
                    ServerMessage::Update(event) => self.apply_update(event).await,
                    ServerMessage::ClaimResult(result) => self.apply_claim_result(result).await,
                    ServerMessage::Pong => {}
                }
            }
            Ok(Inbound::Ping | Inbound::Pong) => self.manager.on_inbound(now),
            Ok(Inbound::Closed) => {
                info!("Server closed the channel");
                self.drop_channel().await;
            }
            Err(e) => {
                warn!(error = %e, "Channel failed");
                self.drop_channel().await;
            }
        }
    }

    async fn apply_update(&mut self, event: UpdateEvent) {
        debug!(
            kind = event.kind_name(),
            stream = %event.stream,
            ts = event.server_timestamp,
            "Update received"
        );
        self.notify(SyncNotification::Update(event.clone()));

        let outcome = self.store.apply_event(&event);
        if outcome == ApplyOutcome::Replaced && self.manager.on_snapshot() {
            info!("Subscribed");
            self.publish_state();
        }

        let on_active_stream = matches!(
            outcome,
            ApplyOutcome::Applied | ApplyOutcome::Replaced | ApplyOutcome::Ignored
        );
        if on_active_stream && self.presence.record(&event) {
            self.notify(SyncNotification::Activity(self.presence.snapshot()));
        }

        if outcome.changed() {
            self.publish_view();
        }
        if self.store.take_resync_request() {
            self.request_resync().await;
        }
    }

    async fn apply_claim_result(&mut self, result: ClaimResult) {
        match self.coordinator.on_claim_result(&result) {
            ClaimDisposition::Updated(update) => {
                if update.state == ClaimState::Rejected {
                    let view = self.store.snapshot(None);
                    let same_stream = view
                        .key
                        .as_ref()
                        .is_some_and(|key| key.stream() == update.slot.stream());
                    if same_stream && view.is_available(update.slot.time) {
                        warn!(slot = %update.slot, "Claim rejected for a slot shown as free");
                        self.request_resync().await;
                    }
                }
                self.publish_claim(update);
                self.publish_view();
            }
            ClaimDisposition::Orphaned(slot) => self.release(slot).await,
            ClaimDisposition::Ignored => {}
        }
    }

    fn expire_claim(&mut self) {
        if let Some(update) = self.coordinator.expire_due(Instant::now()) {
            self.publish_claim(update);
            self.publish_view();
        }
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    fn notify(&self, notification: SyncNotification) {
        // No receivers is fine
        let _ = self.events.send(notification);
    }

    fn publish_state(&mut self) {
        let state = self.manager.state();
        self.store.set_connection_state(state);
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
            self.notify(SyncNotification::Connection(state));
            self.publish_view();
        }
    }

    fn publish_view(&mut self) {
        let view = self.store.snapshot(self.coordinator.locked_slot());
        self.view_tx.send_replace(view.clone());
        self.notify(SyncNotification::Slots(view));
    }

    fn publish_claim(&mut self, update: ClaimUpdate) {
        self.claim_tx.send_replace(update.state);
        self.notify(SyncNotification::Claim(update));
    }

    async fn teardown(&mut self) {
        self.connecting = None;
        if let Some(update) = self.coordinator.cancel() {
            self.release(update.slot.clone()).await;
            self.publish_claim(update);
        }
        if let Some(key) = self.manager.active().cloned() {
            self.send(ClientFrame::Unsubscribe { key }).await;
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.next_ping = None;
        self.manager.disconnect();
        self.publish_state();
        info!(
            dropped_frames = self.codec.dropped(),
            faults = self.store.fault_count(),
            "Availability session stopped"
        );
    }
}

async fn recv_from(channel: &mut Option<Box<dyn Channel>>) -> Result<Inbound, TransportError> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_connect(attempt: &mut Option<ConnectAttempt>) -> Result<Box<dyn Channel>, TransportError> {
    match attempt {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
