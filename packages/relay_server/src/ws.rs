//! WebSocket Port
//!
//! Bridges one socket to the relay actor. Pages and panels use the same
//! endpoint; what a port becomes is decided by the first message it sends.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use recoil_relay::{Port, ServerMessage};

use crate::actor::RelayHandle;

/// Query parameters a page attaches to its socket URL
#[derive(Debug, Default, Deserialize)]
pub struct PortParams {
    pub name: Option<String>,
    pub tab_id: Option<u32>,
}

/// Run one port until either side hangs up.
pub async fn handle_port(
    socket: WebSocket,
    relay: RelayHandle,
    params: PortParams,
    send_channel_capacity: usize,
) {
    let port_id = relay.allocate_port_id();
    info!(port = %port_id, tab_id = ?params.tab_id, "New relay port");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound queue; the relay drops messages instead of waiting when it fills
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(send_channel_capacity);

    let port = Port::new(port_id, params.name, params.tab_id, tx);
    if let Err(e) = relay.open_port(port).await {
        error!(port = %port_id, "Failed to open port: {}", e);
        return;
    }

    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let relay_input = relay.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = relay_input
                        .port_message(port_id, text.as_str().to_owned())
                        .await
                    {
                        warn!(port = %port_id, "Dropping port: {}", e);
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(port = %port_id, "WebSocket error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(port = %port_id, "Sender task ended"),
        _ = input_task => debug!(port = %port_id, "Input task ended"),
    }

    if let Err(e) = relay.close_port(port_id).await {
        warn!(port = %port_id, "Failed to close port: {}", e);
    }
    info!(port = %port_id, "Relay port closed");
}
