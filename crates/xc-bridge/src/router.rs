//! Inbound message routing
//!
//! Semantic processing of decoded frames runs on a dispatcher task, off the
//! frame reader's hot path: the reader has already queued the mandatory ACK
//! and resolved ACK/NACK waiters before a message lands here. Handlers are
//! looked up in a type-keyed registry; unknown types are logged at info
//! level as a reverse-engineering aid.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::fanout::{self, Listeners};
use crate::inventory::Inventory;
use crate::protocol::{InboundMessage, MessageType};

/// Shared state the handlers operate on.
pub struct DispatchContext {
    pub inventory: Arc<Mutex<Inventory>>,
    pub listeners: Arc<Mutex<Listeners>>,
    discovery: Mutex<Option<oneshot::Sender<()>>>,
}

impl DispatchContext {
    pub fn new(
        inventory: Arc<Mutex<Inventory>>,
        listeners: Arc<Mutex<Listeners>>,
        discovery: oneshot::Sender<()>,
    ) -> Self {
        Self {
            inventory,
            listeners,
            discovery: Mutex::new(Some(discovery)),
        }
    }

    /// Unblock the pending `init()`; the first `lastItem` wins, later
    /// discovery rounds find the slot empty.
    fn signal_discovery_complete(&self) {
        let waiter = match self.discovery.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }
    }

    fn lock_inventory(&self) -> std::sync::MutexGuard<'_, Inventory> {
        match self.inventory.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Trait for semantic message handlers.
///
/// Handlers process one message type each, never touch the socket, and
/// report failures through `Result` so the dispatcher can count and log
/// them without killing the session.
#[async_trait]
pub trait BridgeMessageHandler: Send + Sync {
    async fn handle(&self, msg: &InboundMessage, ctx: &DispatchContext) -> Result<()>;

    /// Message type this handler processes.
    fn message_type(&self) -> MessageType;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

/// Type alias for boxed handler.
pub type BoxedHandler = Arc<dyn BridgeMessageHandler>;

/// Handler registry for looking up handlers by wire type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: BoxedHandler) {
        let type_int = handler.message_type().to_int();
        debug!("Registering handler for type {}: {}", type_int, handler.name());
        self.handlers.insert(type_int, handler);
    }

    pub fn get(&self, type_int: u16) -> Option<&BoxedHandler> {
        self.handlers.get(&type_int)
    }

    pub fn has_handler(&self, type_int: u16) -> bool {
        self.handlers.contains_key(&type_int)
    }
}

/// Dispatcher statistics.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub messages_processed: u64,
    pub messages_success: u64,
    pub messages_failed: u64,
    pub messages_unhandled: u64,
}

/// Routes decoded messages to their registered handlers.
pub struct MessageDispatcher {
    registry: HandlerRegistry,
    stats: DispatcherStats,
}

impl MessageDispatcher {
    /// Dispatcher with the full bridge routing table registered.
    pub fn new() -> Self {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(HeartbeatEchoHandler));
        registry.register(Arc::new(PingHandler));
        registry.register(Arc::new(ErrorInfoHandler));
        registry.register(Arc::new(InventoryHandler { message_type: MessageType::SetAllData }));
        registry.register(Arc::new(InventoryHandler { message_type: MessageType::SetHomeData }));
        registry.register(Arc::new(StateUpdateHandler));
        registry.register(Arc::new(BridgeStateHandler));
        registry.register(Arc::new(LogHandler { message_type: MessageType::LogData }));
        registry.register(Arc::new(LogHandler { message_type: MessageType::LogEntries }));
        Self { registry, stats: DispatcherStats::default() }
    }

    /// Empty dispatcher for custom registrations.
    pub fn empty() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            stats: DispatcherStats::default(),
        }
    }

    pub fn register_handler(&mut self, handler: BoxedHandler) {
        self.registry.register(handler);
    }

    /// Dispatch one message to its handler.
    pub async fn dispatch(&mut self, msg: &InboundMessage, ctx: &DispatchContext) {
        self.stats.messages_processed += 1;

        let Some(handler) = self.registry.get(msg.type_int) else {
            self.stats.messages_unhandled += 1;
            info!("Unhandled message type: {}", msg.type_int);
            return;
        };

        match handler.handle(msg, ctx).await {
            Ok(()) => self.stats.messages_success += 1,
            Err(e) => {
                self.stats.messages_failed += 1;
                error!("Handler {} failed: {}", handler.name(), e);
            }
        }
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatcher task: processes messages strictly in arrival order, which
/// keeps per-entity callback ordering aligned with frame ordering.
pub async fn run_dispatcher(
    mut queue: mpsc::UnboundedReceiver<InboundMessage>,
    mut dispatcher: MessageDispatcher,
    ctx: Arc<DispatchContext>,
) {
    while let Some(msg) = queue.recv().await {
        dispatcher.dispatch(&msg, &ctx).await;
    }
    debug!(
        processed = dispatcher.stats().messages_processed,
        unhandled = dispatcher.stats().messages_unhandled,
        "Dispatcher task finished"
    );
}

struct HeartbeatEchoHandler;

#[async_trait]
impl BridgeMessageHandler for HeartbeatEchoHandler {
    async fn handle(&self, _msg: &InboundMessage, _ctx: &DispatchContext) -> Result<()> {
        debug!("Heartbeat echo from bridge");
        Ok(())
    }

    fn message_type(&self) -> MessageType {
        MessageType::Heartbeat
    }

    fn name(&self) -> &'static str {
        "HeartbeatEchoHandler"
    }
}

struct PingHandler;

#[async_trait]
impl BridgeMessageHandler for PingHandler {
    async fn handle(&self, _msg: &InboundMessage, _ctx: &DispatchContext) -> Result<()> {
        // The mandatory ACK already went out; nothing else to do.
        Ok(())
    }

    fn message_type(&self) -> MessageType {
        MessageType::Ping
    }

    fn name(&self) -> &'static str {
        "PingHandler"
    }
}

struct ErrorInfoHandler;

#[async_trait]
impl BridgeMessageHandler for ErrorInfoHandler {
    async fn handle(&self, msg: &InboundMessage, _ctx: &DispatchContext) -> Result<()> {
        warn!(
            "Bridge error info: {}",
            msg.info.as_deref().unwrap_or("<no info>")
        );
        Ok(())
    }

    fn message_type(&self) -> MessageType {
        MessageType::ErrorInfo
    }

    fn name(&self) -> &'static str {
        "ErrorInfoHandler"
    }
}

/// Applies `SetAllData`/`SetHomeData` discovery payloads.
struct InventoryHandler {
    message_type: MessageType,
}

#[async_trait]
impl BridgeMessageHandler for InventoryHandler {
    async fn handle(&self, msg: &InboundMessage, ctx: &DispatchContext) -> Result<()> {
        let last_item = ctx.lock_inventory().apply(&msg.payload);
        if last_item {
            ctx.signal_discovery_complete();
        }
        Ok(())
    }

    fn message_type(&self) -> MessageType {
        self.message_type
    }

    fn name(&self) -> &'static str {
        "InventoryHandler"
    }
}

/// Fans a `StateUpdate` out to the registered observers.
struct StateUpdateHandler;

#[async_trait]
impl BridgeMessageHandler for StateUpdateHandler {
    async fn handle(&self, msg: &InboundMessage, ctx: &DispatchContext) -> Result<()> {
        let items = msg
            .payload
            .get("item")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let update = fanout::coalesce_items(&items);
        fanout::dispatch(&update, &ctx.listeners);
        Ok(())
    }

    fn message_type(&self) -> MessageType {
        MessageType::StateUpdate
    }

    fn name(&self) -> &'static str {
        "StateUpdateHandler"
    }
}

struct BridgeStateHandler;

#[async_trait]
impl BridgeMessageHandler for BridgeStateHandler {
    async fn handle(&self, _msg: &InboundMessage, _ctx: &DispatchContext) -> Result<()> {
        debug!("SetBridgeState ignored");
        Ok(())
    }

    fn message_type(&self) -> MessageType {
        MessageType::SetBridgeState
    }

    fn name(&self) -> &'static str {
        "BridgeStateHandler"
    }
}

/// Logs the bridge's diagnostic feeds (LogData / LogEntries).
struct LogHandler {
    message_type: MessageType,
}

#[async_trait]
impl BridgeMessageHandler for LogHandler {
    async fn handle(&self, msg: &InboundMessage, _ctx: &DispatchContext) -> Result<()> {
        debug!(
            type_int = msg.type_int,
            bytes = msg.payload.to_string().len(),
            "Bridge log frame"
        );
        Ok(())
    }

    fn message_type(&self) -> MessageType {
        self.message_type
    }

    fn name(&self) -> &'static str {
        "LogHandler"
    }
}
