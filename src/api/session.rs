use crate::api::protocol::{payload_len, RelayFrame, ServerMessage};
use crate::api::websocket::GateAppState;
use axum::extract::ws::{Message, WebSocket};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Drives a single admitted WebSocket connection
pub struct Session {
    connection_id: String,
    identity: String,
    state: Arc<GateAppState>,
}

impl Session {
    pub fn new(connection_id: String, identity: String, state: Arc<GateAppState>) -> Self {
        Self {
            connection_id,
            identity,
            state,
        }
    }

    /// Handle WebSocket connection lifecycle.
    ///
    /// The connection's slot was reserved at admission; it is released here
    /// once the socket ends.
    pub async fn run(self, mut socket: WebSocket) {
        let limiter = &self.state.limiter;
        self.state.metrics.connection_opened();

        let mut relay_rx = self.state.relay.subscribe();

        info!(connection_id = %self.connection_id, "WebSocket connection established");

        if let Err(e) = self
            .send_control(
                &mut socket,
                ServerMessage::Welcome {
                    connection_id: self.connection_id.clone(),
                },
            )
            .await
        {
            warn!(connection_id = %self.connection_id, error = %e, "Failed to send welcome");
        }

        loop {
            tokio::select! {
                // Handle incoming client frames
                msg = socket.recv() => {
                    let Some(msg) = msg else {
                        info!(connection_id = %self.connection_id, "WebSocket stream ended");
                        break;
                    };
                    match msg {
                        Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                            if let Err(e) = self.handle_inbound(&mut socket, message).await {
                                error!(connection_id = %self.connection_id, error = %e, "Error handling client frame");
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!(connection_id = %self.connection_id, "WebSocket client disconnected");
                            break;
                        }
                        Ok(Message::Ping(data)) => {
                            if let Err(e) = socket.send(Message::Pong(data)).await {
                                error!(error = %e, "Failed to send pong");
                                break;
                            }
                        }
                        Ok(_) => {
                            // Ignore pong frames
                        }
                        Err(e) => {
                            warn!(connection_id = %self.connection_id, error = %e, "WebSocket error");
                            break;
                        }
                    }
                }

                // Forward frames accepted on other connections
                result = relay_rx.recv() => {
                    match result {
                        Ok(frame) => {
                            if frame.origin == self.connection_id {
                                continue;
                            }
                            if let Err(e) = socket.send(frame.message).await {
                                error!(connection_id = %self.connection_id, error = %e, "Failed to relay frame");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(connection_id = %self.connection_id, skipped = skipped, "WebSocket lagged, skipped frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            error!("Relay channel closed");
                            break;
                        }
                    }
                }
            }
        }

        limiter.unregister_connection(&self.identity, &self.connection_id);
        self.state.metrics.connection_closed();
        info!(connection_id = %self.connection_id, "WebSocket connection closed");
    }

    /// Admit or drop one client frame
    async fn handle_inbound(&self, socket: &mut WebSocket, message: Message) -> anyhow::Result<()> {
        let size = payload_len(&message);
        let verdict = self
            .state
            .limiter
            .check_message(&self.identity, &self.connection_id, size)
            .await;

        match verdict {
            Ok(()) => {
                self.state.metrics.record_message_relayed();
                // Err only when nothing is subscribed
                let receivers = self
                    .state
                    .relay
                    .send(RelayFrame {
                        origin: self.connection_id.clone(),
                        message,
                    })
                    .unwrap_or(0);
                debug!(connection_id = %self.connection_id, size, receivers, "Frame relayed");
            }
            Err(reason) => {
                self.state.metrics.record_message_rejected();
                self.send_control(socket, ServerMessage::Error { reason })
                    .await?;
            }
        }

        Ok(())
    }

    async fn send_control(&self, socket: &mut WebSocket, msg: ServerMessage) -> anyhow::Result<()> {
        let json = serde_json::to_string(&msg)?;
        socket.send(Message::Text(json)).await?;
        Ok(())
    }
}
