//! Bridge client facade
//!
//! One `BridgeClient` owns one bridge connection. Per session it runs three
//! tasks: a frame reader (stream half + authenticator), a frame writer
//! (sink half, `mc` counter, armed encryption context, heartbeat timer) and
//! a dispatcher (semantic routing + observer callbacks). A supervisor task
//! watches for session loss and drives the reconnect policy.
//!
//! Callers interact only with the facade: `init`/`cleanup`, the control
//! operations, inventory snapshots and listener registration. Listener
//! registrations live on the facade and survive reconnects; ack waiters and
//! the encryption context die with their session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::ack::{AckOutcome, AckTracker};
use crate::auth::{AuthSend, Authenticator};
use crate::config::BridgeConfig;
use crate::crypto::codec::{self, EncryptionContext};
use crate::error::{BridgeError, Result};
use crate::fanout::Listeners;
use crate::inventory::Inventory;
use crate::model::{Device, DeviceStateUpdate, Room, RoomStateUpdate, Scene};
use crate::protocol::{InboundMessage, MessageType};
use crate::router::{self, DispatchContext, MessageDispatcher};
use crate::transport::{self, OutboundFrame};

/// Typed action for `control_room`.
///
/// The wire knows two room commands; anything else the caller could express
/// would be rejected by the bridge anyway, so the type system rules it out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoomAction {
    Switch(bool),
    Dim(f64),
}

/// Undo token for a listener registration.
///
/// Dropping the handle keeps the listener alive; call [`unsubscribe`] to
/// remove it (host devices get deleted, observers must not leak).
///
/// [`unsubscribe`]: ListenerHandle::unsubscribe
pub struct ListenerHandle {
    listeners: Weak<Mutex<Listeners>>,
    token: u64,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).remove(self.token);
        }
    }
}

/// How a session ended, as reported by the frame reader.
#[derive(Debug)]
enum SessionEnd {
    /// Peer closed the socket or the transport faulted.
    Transport(String),
    /// The authenticator aborted (declined, bad key, no token).
    Auth(BridgeError),
}

/// Per-session handles owned by the facade.
struct SessionHandle {
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
    acks: Arc<AckTracker>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl SessionHandle {
    /// Tear the session down: kill all three tasks and fail every pending
    /// ack waiter. Idempotent.
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
        self.dispatcher.abort();
        self.acks.abort_all();
    }
}

// A dropped handle must never leave a socket or task behind; this also
// covers a caller cancelling `init()` mid-connect.
impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

struct ClientInner {
    config: BridgeConfig,
    inventory: Arc<Mutex<Inventory>>,
    listeners: Arc<Mutex<Listeners>>,
    connected: watch::Sender<bool>,
    session: Mutex<Option<SessionHandle>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ClientInner {
    fn store_session(&self, session: SessionHandle) {
        if let Some(old) = lock(&self.session).replace(session) {
            old.abort();
        }
    }

    fn take_session(&self) -> Option<SessionHandle> {
        lock(&self.session).take()
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Queue a tracked message and hand back its ack waiter.
    fn send_tracked(
        &self,
        message_type: MessageType,
        payload: Value,
    ) -> Result<oneshot::Receiver<AckOutcome>> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let guard = lock(&self.session);
        let session = guard.as_ref().ok_or(BridgeError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        session
            .out_tx
            .send(OutboundFrame::Message {
                message_type,
                payload,
                ack: Some(tx),
            })
            .map_err(|_| BridgeError::NotConnected)?;
        Ok(rx)
    }

    /// Queue an untracked message (fire-and-forget refreshes).
    fn send_untracked(&self, message_type: MessageType, payload: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let guard = lock(&self.session);
        let session = guard.as_ref().ok_or(BridgeError::NotConnected)?;
        session
            .out_tx
            .send(OutboundFrame::Message { message_type, payload, ack: None })
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Send with the ack/retry discipline: wait `ack_timeout` per attempt,
    /// retry on NACK, timeout or session loss, up to `max_retries` attempts
    /// in total.
    async fn send_with_retry(&self, message_type: MessageType, payload: Value) -> Result<()> {
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let waiter = self.send_tracked(message_type, payload.clone())?;
            match tokio::time::timeout(self.config.ack_timeout, waiter).await {
                Ok(Ok(AckOutcome::Ack)) => return Ok(()),
                Ok(Ok(AckOutcome::Nack(info))) => warn!(
                    ?message_type,
                    attempt,
                    info = info.as_deref().unwrap_or(""),
                    "Bridge rejected message"
                ),
                Ok(Err(_)) => warn!(?message_type, attempt, "Session ended while awaiting ack"),
                Err(_) => debug!(?message_type, attempt, "Ack timed out"),
            }
        }

        Err(BridgeError::AckTimeout { attempts })
    }
}

/// Client for one home-automation bridge.
///
/// Cheap to clone; clones share the connection and the observer registry.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                inventory: Arc::new(Mutex::new(Inventory::new())),
                listeners: Arc::new(Mutex::new(Listeners::new())),
                connected,
                session: Mutex::new(None),
                supervisor: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Establish the session: connect, authenticate, discover.
    ///
    /// Returns once the client is fully connected (authenticated and the
    /// discovery `lastItem` received). A first-connect failure propagates to
    /// the caller without scheduling a reconnect; once a session has been
    /// fully connected, later losses reconnect automatically.
    pub async fn init(&self) -> Result<()> {
        self.inner.config.validate()?;
        if self.inner.is_connected() {
            debug!("init() on an already-connected client is a no-op");
            return Ok(());
        }

        self.inner.shutdown.store(false, Ordering::SeqCst);
        let (session, end_rx) = connect_session(&self.inner).await?;
        self.inner.store_session(session);
        self.inner.connected.send_replace(true);

        let supervisor = tokio::spawn(run_supervisor(Arc::clone(&self.inner), end_rx));
        if let Some(old) = lock(&self.inner.supervisor).replace(supervisor) {
            old.abort();
        }

        info!(host = %self.inner.config.host, "Bridge connected");
        Ok(())
    }

    /// Tear everything down: reconnect timer, heartbeat, ack waiters and
    /// the socket. Subsequent operations fail with `NotConnected` until the
    /// next `init()`.
    pub async fn cleanup(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);

        if let Some(supervisor) = lock(&self.inner.supervisor).take() {
            supervisor.abort();
        }
        self.inner.connected.send_replace(false);
        if let Some(session) = self.inner.take_session() {
            session.abort();
        }

        info!("Bridge client cleaned up");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Observable connectivity; receivers see every transition.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn get_devices(&self) -> Vec<Device> {
        lock(&self.inner.inventory).devices()
    }

    pub fn get_rooms(&self) -> Vec<Room> {
        lock(&self.inner.inventory).rooms()
    }

    pub fn get_detailed_scenes(&self) -> Vec<Scene> {
        lock(&self.inner.inventory).scenes()
    }

    /// Observe state changes of one device.
    pub fn add_device_state_listener(
        &self,
        device_id: &str,
        callback: impl Fn(&DeviceStateUpdate) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let token = lock(&self.inner.listeners).add_device_listener(device_id, Arc::new(callback));
        ListenerHandle {
            listeners: Arc::downgrade(&self.inner.listeners),
            token,
        }
    }

    /// Observe state changes of one room.
    pub fn add_room_state_listener(
        &self,
        room_id: &str,
        callback: impl Fn(&RoomStateUpdate) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let token = lock(&self.inner.listeners).add_room_listener(room_id, Arc::new(callback));
        ListenerHandle {
            listeners: Arc::downgrade(&self.inner.listeners),
            token,
        }
    }

    /// Switch a device on or off.
    pub async fn switch_device(&self, device_id: &str, on: bool) -> Result<()> {
        check_entity_id(device_id, "device id")?;
        self.inner
            .send_with_retry(
                MessageType::DeviceSwitch,
                json!({"deviceId": device_id, "switch": on}),
            )
            .await
    }

    /// Set a dimmer; values clamp into the wire range `[1, 99]`.
    pub async fn set_dimmer_value(&self, device_id: &str, value: f64) -> Result<()> {
        check_entity_id(device_id, "device id")?;
        let dim = clamp_dim(value)?;
        self.inner
            .send_with_retry(
                MessageType::DeviceDim,
                json!({"deviceId": device_id, "dimmvalue": dim}),
            )
            .await
    }

    /// Switch or dim a whole room.
    pub async fn control_room(&self, room_id: &str, action: RoomAction) -> Result<()> {
        check_entity_id(room_id, "room id")?;
        match action {
            RoomAction::Switch(on) => {
                self.inner
                    .send_with_retry(
                        MessageType::RoomSwitch,
                        json!({"roomId": room_id, "switch": on}),
                    )
                    .await
            }
            RoomAction::Dim(value) => {
                let dim = clamp_dim(value)?;
                self.inner
                    .send_with_retry(
                        MessageType::RoomDim,
                        json!({"roomId": room_id, "dimmvalue": dim}),
                    )
                    .await
            }
        }
    }

    /// Activate a scene by id.
    pub async fn activate_scene(&self, scene_id: i64) -> Result<()> {
        if scene_id < 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "scene id must be non-negative, got {}",
                scene_id
            )));
        }
        self.inner
            .send_with_retry(MessageType::ActivateScene, json!({"sceneId": scene_id}))
            .await
    }

    /// Re-issue the discovery requests and a heartbeat to solicit fresh
    /// state from the bridge.
    pub fn refresh_all_device_info(&self) -> Result<()> {
        self.inner
            .send_untracked(MessageType::RequestDevices, Value::Null)?;
        self.inner
            .send_untracked(MessageType::RequestRooms, Value::Null)?;
        self.inner.send_untracked(MessageType::Heartbeat, Value::Null)
    }
}

fn check_entity_id(id: &str, what: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(BridgeError::InvalidArgument(format!("{} must not be empty", what)));
    }
    Ok(())
}

/// Clamp a dim value into the wire range. 0 means "off" on the wire and is
/// never produced by dim commands; use the switch command for that.
fn clamp_dim(value: f64) -> Result<i64> {
    if value.is_nan() {
        return Err(BridgeError::InvalidArgument("dim value must be numeric".into()));
    }
    Ok(value.clamp(1.0, 99.0).round() as i64)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Open a socket and run a session up to the fully-connected state.
async fn connect_session(
    inner: &Arc<ClientInner>,
) -> Result<(SessionHandle, oneshot::Receiver<SessionEnd>)> {
    let ws = transport::open(&inner.config).await?;
    let (sink, stream) = ws.split();

    lock(&inner.inventory).reset_discovery();

    let acks = Arc::new(AckTracker::new());
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (end_tx, mut end_rx) = oneshot::channel();

    let writer = tokio::spawn(transport::run_writer(
        sink,
        out_rx,
        Arc::clone(&acks),
        inner.config.heartbeat_interval,
    ));

    let dispatch_ctx = Arc::new(DispatchContext::new(
        Arc::clone(&inner.inventory),
        Arc::clone(&inner.listeners),
        ready_tx,
    ));
    let dispatcher = tokio::spawn(router::run_dispatcher(
        dispatch_rx,
        MessageDispatcher::new(),
        dispatch_ctx,
    ));

    let reader_task = ReaderTask {
        stream,
        out_tx: out_tx.clone(),
        dispatch_tx,
        acks: Arc::clone(&acks),
        authenticator: Authenticator::new(&inner.config.auth_key, inner.config.salt_length),
        ctx: None,
    };
    let reader = tokio::spawn(async move {
        let end = reader_task.run().await;
        let _ = end_tx.send(end);
    });

    let session = SessionHandle { out_tx, acks, reader, writer, dispatcher };

    // Block until discovery completes, the session dies, or the connect
    // window closes; only the first outcome keeps the session.
    let wait = async {
        tokio::select! {
            ready = ready_rx => match ready {
                Ok(()) => Ok(()),
                Err(_) => Err(BridgeError::TransportClosed(
                    "session ended before discovery".into(),
                )),
            },
            end = &mut end_rx => Err(session_end_error(end)),
        }
    };

    match tokio::time::timeout(inner.config.connect_timeout, wait).await {
        Ok(Ok(())) => Ok((session, end_rx)),
        Ok(Err(e)) => {
            session.abort();
            Err(e)
        }
        Err(_) => {
            session.abort();
            Err(BridgeError::ConnectTimeout(inner.config.connect_timeout))
        }
    }
}

fn session_end_error(end: std::result::Result<SessionEnd, oneshot::error::RecvError>) -> BridgeError {
    match end {
        Ok(SessionEnd::Auth(e)) => e,
        Ok(SessionEnd::Transport(reason)) => BridgeError::TransportClosed(reason),
        Err(_) => BridgeError::TransportClosed("reader task died".into()),
    }
}

/// Watches for session loss and applies the reconnect policy: one attempt
/// after a fixed delay, staying in the loop only while sessions keep
/// reaching the fully-connected state.
async fn run_supervisor(inner: Arc<ClientInner>, mut end_rx: oneshot::Receiver<SessionEnd>) {
    loop {
        let end = (&mut end_rx).await;

        inner.connected.send_replace(false);
        if let Some(session) = inner.take_session() {
            session.abort();
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match &end {
            Ok(SessionEnd::Transport(reason)) => {
                warn!(reason = %reason, delay = ?inner.config.reconnect_delay, "Session lost, scheduling reconnect")
            }
            Ok(SessionEnd::Auth(e)) => {
                warn!(error = %e, delay = ?inner.config.reconnect_delay, "Session aborted, scheduling reconnect")
            }
            Err(_) => debug!("Session task ended"),
        }

        tokio::time::sleep(inner.config.reconnect_delay).await;
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match connect_session(&inner).await {
            Ok((session, next_end_rx)) => {
                inner.store_session(session);
                inner.connected.send_replace(true);
                end_rx = next_end_rx;
                info!(host = %inner.config.host, "Bridge reconnected");
            }
            Err(e) => {
                error!(error = %e, "Reconnect failed, giving up until next init()");
                break;
            }
        }
    }
}

/// Stream half of the session socket plus the handshake driver.
struct ReaderTask {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
    dispatch_tx: mpsc::UnboundedSender<InboundMessage>,
    acks: Arc<AckTracker>,
    authenticator: Authenticator,
    ctx: Option<EncryptionContext>,
}

impl ReaderTask {
    async fn run(mut self) -> SessionEnd {
        while let Some(frame) = self.stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return SessionEnd::Transport(e.to_string()),
            };

            match frame {
                WsMessage::Text(text) => {
                    if let Err(end) = self.handle_frame(&text).await {
                        return end;
                    }
                }
                WsMessage::Close(_) => {
                    return SessionEnd::Transport("peer closed the socket".into())
                }
                // The bridge interleaves its own keep-alives; frame-level
                // pings need no action here.
                _ => {}
            }
        }
        SessionEnd::Transport("stream ended".into())
    }

    /// Hot path: decrypt once, queue the mandatory ACK, then route.
    async fn handle_frame(&mut self, raw: &str) -> std::result::Result<(), SessionEnd> {
        let text = transport::strip_terminator(raw);

        let value = match &self.ctx {
            Some(ctx) => match codec::decrypt_frame(text, ctx) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Discarding undecryptable frame: {}", e);
                    return Ok(());
                }
            },
            None => match serde_json::from_str(text) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Discarding non-JSON handshake frame: {}", e);
                    return Ok(());
                }
            },
        };

        let Some(msg) = InboundMessage::parse(value) else {
            warn!("Discarding frame without type_int");
            return Ok(());
        };

        // The mandatory ACK leaves before any semantic processing. The
        // writer confirms the flush so observer callbacks can never beat
        // the ACK onto the wire.
        if let Some(mc) = msg.mc {
            let (sent_tx, sent_rx) = oneshot::channel();
            if self
                .out_tx
                .send(OutboundFrame::Ack { ref_mc: mc, sent: Some(sent_tx) })
                .is_ok()
            {
                let _ = sent_rx.await;
            }
        }

        match msg.message_type() {
            Some(MessageType::Ack) => match msg.ref_mc {
                Some(ref_mc) => self.acks.resolve(ref_mc, AckOutcome::Ack),
                None => debug!("Ack frame without ref"),
            },
            Some(MessageType::Nack) => {
                warn!(info = msg.info.as_deref().unwrap_or(""), "Bridge NACK");
                if let Some(ref_mc) = msg.ref_mc {
                    self.acks.resolve(ref_mc, AckOutcome::Nack(msg.info.clone()));
                }
            }
            Some(t) if t.is_auth_flow() => self.drive_authenticator(&msg)?,
            _ => {
                // Semantic processing happens on the dispatcher task.
                let _ = self.dispatch_tx.send(msg);
            }
        }

        Ok(())
    }

    fn drive_authenticator(&mut self, msg: &InboundMessage) -> std::result::Result<(), SessionEnd> {
        let output = match self.authenticator.on_message(msg) {
            Ok(output) => output,
            Err(e) => {
                error!("Authentication aborted: {}", e);
                return Err(SessionEnd::Auth(e));
            }
        };

        for send in output.outbound {
            let frame = match send {
                AuthSend::Plain(message_type, payload) => {
                    OutboundFrame::Plain { message_type, payload }
                }
                AuthSend::Encrypted(message_type, payload) => {
                    OutboundFrame::Message { message_type, payload, ack: None }
                }
            };
            let _ = self.out_tx.send(frame);
        }

        if let Some(ctx) = output.arm_encryption {
            // Queued after the plaintext secret exchange; inbound frames
            // are encrypted from the next one on.
            let _ = self.out_tx.send(OutboundFrame::ArmEncryption(ctx.clone()));
            self.ctx = Some(ctx);
        }

        if output.authenticated {
            self.on_authenticated();
        }

        Ok(())
    }

    /// Entering the terminal phase triggers discovery and the heartbeat.
    fn on_authenticated(&mut self) {
        info!("Authenticated, requesting inventory");
        for message_type in [
            MessageType::RequestDevices,
            MessageType::RequestRooms,
            MessageType::Heartbeat,
        ] {
            let _ = self.out_tx.send(OutboundFrame::Message {
                message_type,
                payload: Value::Null,
                ack: None,
            });
        }
        let _ = self.out_tx.send(OutboundFrame::StartHeartbeat);
    }
}
