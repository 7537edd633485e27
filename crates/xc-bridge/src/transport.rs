//! WebSocket transport
//!
//! The bridge listens on plain `ws://<ip>`; frames are text. Handshake
//! frames are raw JSON, everything after the secret exchange is
//! `base64(ciphertext) ++ 0x04`. Per-message deflate is never negotiated
//! (tungstenite does not offer it, matching the bridge firmware) and
//! `TCP_NODELAY` is set before the WebSocket upgrade so acknowledgements
//! leave without Nagle delay.
//!
//! The socket is single-writer: a writer task owns the sink half, assigns
//! the session `mc` counter in queue order, registers ack waiters, arms the
//! encryption context mid-stream and drives the periodic heartbeat.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::ack::{AckOutcome, AckTracker};
use crate::config::BridgeConfig;
use crate::crypto::codec::{self, EncryptionContext, FRAME_TERMINATOR};
use crate::error::{BridgeError, Result};
use crate::protocol::{ack_envelope, envelope, MessageType};

/// Open the WebSocket to the bridge with socket tuning applied.
pub async fn open(config: &BridgeConfig) -> Result<WebSocketStream<TcpStream>> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
    tcp.set_nodelay(true)?;

    let (ws, _response) = client_async(config.ws_url(), tcp).await?;
    debug!(url = %config.ws_url(), "WebSocket established");
    Ok(ws)
}

/// Strip the trailing end-of-transmission marker from a received frame.
pub fn strip_terminator(frame: &str) -> &str {
    frame.strip_suffix(FRAME_TERMINATOR).unwrap_or(frame)
}

/// A unit of outbound work for the writer task.
pub enum OutboundFrame {
    /// Raw JSON handshake frame, sent before the channel is armed.
    Plain { message_type: MessageType, payload: Value },

    /// Regular message; encrypted with the armed context. Carries an
    /// optional waiter that the writer registers under the assigned `mc`.
    Message {
        message_type: MessageType,
        payload: Value,
        ack: Option<oneshot::Sender<AckOutcome>>,
    },

    /// Mandatory acknowledgement of an inbound `mc`; carries no `mc` of its
    /// own and is never tracked. `sent` resolves once the frame left the
    /// sink, so the reader can hold semantic processing until then.
    Ack {
        ref_mc: u64,
        sent: Option<oneshot::Sender<()>>,
    },

    /// Arm the AES context for every frame queued after this marker.
    ArmEncryption(EncryptionContext),

    /// Start the periodic heartbeat (queued on authentication).
    StartHeartbeat,
}

/// Sink half of the session socket plus everything only the writer owns.
pub struct FrameWriter {
    sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    ctx: Option<EncryptionContext>,
    acks: Arc<AckTracker>,
    mc: u64,
}

impl FrameWriter {
    pub fn new(sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>, acks: Arc<AckTracker>) -> Self {
        Self { sink, ctx: None, acks, mc: 0 }
    }

    /// Process one queued frame.
    pub async fn write(&mut self, frame: OutboundFrame) -> Result<()> {
        match frame {
            OutboundFrame::Plain { message_type, payload } => {
                let mc = self.next_mc();
                let message = envelope(message_type, Some(mc), payload);
                trace!(?message_type, mc, "Sending plaintext frame");
                self.send_text(message.to_string()).await
            }
            OutboundFrame::Message { message_type, payload, ack } => {
                let mc = self.next_mc();
                if let Some(waiter) = ack {
                    self.acks.insert(mc, waiter);
                }
                let message = envelope(message_type, Some(mc), payload);
                trace!(?message_type, mc, "Sending encrypted frame");
                match self.send_encrypted(&message).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.acks.forget(mc);
                        Err(e)
                    }
                }
            }
            OutboundFrame::Ack { ref_mc, sent } => {
                let message = ack_envelope(ref_mc);
                let result = if self.ctx.is_some() {
                    self.send_encrypted(&message).await
                } else {
                    self.send_text(message.to_string()).await
                };
                if let Some(sent) = sent {
                    let _ = sent.send(());
                }
                result
            }
            OutboundFrame::ArmEncryption(ctx) => {
                debug!("Encryption armed for outbound frames");
                self.ctx = Some(ctx);
                Ok(())
            }
            // Handled by the writer loop; reaching here is a no-op.
            OutboundFrame::StartHeartbeat => Ok(()),
        }
    }

    /// Send a periodic heartbeat; untracked, the bridge's ACK resolves no
    /// waiter.
    pub async fn send_heartbeat(&mut self) -> Result<()> {
        let mc = self.next_mc();
        let message = envelope(MessageType::Heartbeat, Some(mc), Value::Null);
        trace!(mc, "Sending heartbeat");
        self.send_encrypted(&message).await
    }

    pub async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
    }

    async fn send_encrypted(&mut self, message: &Value) -> Result<()> {
        let Some(ctx) = &self.ctx else {
            return Err(BridgeError::Transport(
                "encrypted frame queued before the context was armed".into(),
            ));
        };
        let frame = codec::encrypt_frame(message, ctx)?;
        self.send_text(frame).await
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    fn next_mc(&mut self) -> u64 {
        self.mc += 1;
        self.mc
    }
}

/// Writer task: drains the outbound queue and owns the heartbeat timer.
///
/// Exits when the queue closes or the socket faults; either way the session
/// is over and the supervisor takes it from there.
pub async fn run_writer(
    sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut queue: mpsc::UnboundedReceiver<OutboundFrame>,
    acks: Arc<AckTracker>,
    heartbeat_interval: Duration,
) {
    let mut writer = FrameWriter::new(sink, acks);
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat_armed = false;

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                None => break,
                Some(OutboundFrame::StartHeartbeat) => {
                    heartbeat_armed = true;
                    heartbeat.reset();
                }
                Some(frame) => {
                    if let Err(e) = writer.write(frame).await {
                        warn!("Outbound frame failed: {}", e);
                        break;
                    }
                }
            },
            _ = heartbeat.tick(), if heartbeat_armed => {
                if let Err(e) = writer.send_heartbeat().await {
                    warn!("Heartbeat failed: {}", e);
                    break;
                }
            }
        }
    }

    writer.close().await;
    debug!("Writer task finished");
}
