//! WebSocket connection handler.
//!
//! Runs the per-connection message loop: maintains heartbeats, parses inbound
//! protocol frames and hands them to the hub, and pushes hub messages back
//! out on the session. Runs until the connection is closed by either side or
//! a heartbeat timeout occurs; the resulting disconnect is the hub's sole
//! cleanup trigger.

#![allow(clippy::future_not_send)]

use std::time::Duration;

use actix_ws::Message;
use futures_util::{
    StreamExt as _,
    future::{Either, select},
};
use tokio::{
    pin,
    sync::mpsc,
    time::{Instant, interval},
};

use crate::ws::models::InboundPayload;
use crate::ws::server::RelayServerHandle;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(clippy::too_many_lines)]
pub async fn handle_ws(
    hub: RelayServerHandle,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    log::debug!("Connected");

    let mut last_heartbeat = Instant::now();
    let mut interval = interval(HEARTBEAT_INTERVAL);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let conn_id = hub.connect(conn_tx).await;

    log::debug!("Connection id: {conn_id}");

    let close_reason = loop {
        // most of the futures we process need to be stack-pinned to work with select()

        let tick = interval.tick();
        pin!(tick);

        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        let messages = select(msg_stream.next(), msg_rx);
        pin!(messages);

        match select(messages, tick).await {
            // protocol messages received from the client
            Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => match msg {
                Message::Ping(bytes) => {
                    log::trace!("Received ping");
                    last_heartbeat = Instant::now();
                    let _ = session.pong(&bytes).await;
                }

                Message::Pong(_) => {
                    last_heartbeat = Instant::now();
                }

                Message::Text(text) => {
                    last_heartbeat = Instant::now();

                    match serde_json::from_str::<InboundPayload>(text.as_ref()) {
                        Ok(payload) => hub.message(conn_id, payload),
                        Err(err) => {
                            log::warn!("Dropping malformed message from conn_id={conn_id}: {err}");
                        }
                    }
                }

                Message::Binary(_) => {
                    last_heartbeat = Instant::now();
                    log::warn!("Dropping unexpected binary message from conn_id={conn_id}");
                }

                Message::Close(reason) => break reason,

                _ => {
                    break None;
                }
            },

            // client WebSocket stream error
            Either::Left((Either::Left((Some(Err(err)), _)), _)) => {
                log::error!("WebSocket stream error: {err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((Either::Left((None, _)), _)) => {
                log::debug!("WebSocket stream ended");
                break None;
            }

            // messages the hub relayed to this connection
            Either::Left((Either::Right((Some(ws_msg), _)), _)) => {
                if let Err(err) = session.text(ws_msg).await {
                    log::error!("Failed to send text message to conn_id={conn_id}: {err:?}");
                }
            }

            // the hub dropped our message sender
            Either::Left((Either::Right((None, _)), _)) => {
                log::debug!("Hub closed the connection channel");
                break None;
            }

            // heartbeat interval tick
            Either::Right((_inst, _)) => {
                // if no heartbeat ping/pong received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!(
                        "client has not sent heartbeat in over {CLIENT_TIMEOUT:?}; disconnecting"
                    );
                    break None;
                }

                // send heartbeat ping
                let _ = session.ping(b"").await;
            }
        }
    };

    log::debug!("handle_ws: disconnecting connection");
    hub.disconnect(conn_id);

    // attempt to close connection gracefully
    log::debug!("handle_ws: closing connection");
    let _ = session.close(close_reason).await;
}
