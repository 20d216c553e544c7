//! Per-connection task: handshake, receive loop, cleanup.
//!
//! ```text
//! accept ──► token? ──no──► close 4001 "Missing token"
//!              │
//!           verify ──fail──► close 4002 "Unauthorized"
//!              │
//!           register ──► read loop: inbound frame → Dispatcher
//!              │           writer task: outbound frame / pong → socket
//!              │
//!           cleanup: deregister, leave every room
//! ```
//!
//! The writer runs as its own task so a frame whose dispatch waits on
//! storage never holds back broadcasts or pongs to the same client.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::auth::token_from_query;
use crate::protocol::{ProtocolError, ServerEvent};
use crate::registry::{ConnectionHandle, Frame};
use crate::server::{ConnectionCounters, Services};

/// Close code sent when the handshake carries no token.
pub const CLOSE_MISSING_TOKEN: u16 = 4001;
/// Close code sent when the token fails verification.
pub const CLOSE_UNAUTHORIZED: u16 = 4002;

/// How long to wait for the client to answer our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection handler errors. Only ever logged.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Drive one client connection from TCP accept to cleanup.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    services: Arc<Services>,
) -> Result<(), HandlerError> {
    let mut query: Option<String> = None;
    let mut ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        },
    )
    .await?;

    let identity = match token_from_query(query.as_deref()) {
        None => {
            log::info!("Rejected connection from {addr}: missing token");
            reject(&mut ws, &services, CLOSE_MISSING_TOKEN, "Missing token").await;
            return Ok(());
        }
        Some(token) => match services.verifier().verify(token) {
            Some(identity) => identity,
            None => {
                log::info!("Rejected connection from {addr}: invalid token");
                reject(&mut ws, &services, CLOSE_UNAUTHORIZED, "Unauthorized").await;
                return Ok(());
            }
        },
    };

    let (conn, outbound) = ConnectionHandle::new(identity);
    services.registry().add(conn.clone()).await;

    let counters = services.counters();
    ConnectionCounters::incr(&counters.total_connections);
    ConnectionCounters::incr(&counters.active_connections);
    log::info!(
        "{} ({}) connected from {addr} as {}",
        conn.identity().display_name,
        conn.user_id(),
        conn.id()
    );

    let (ws_sender, mut ws_receiver) = ws.split();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(
        ws_sender,
        outbound,
        control_rx,
        services.clone(),
        addr,
    ));
    let mut writer_done = false;
    let dispatcher = services.dispatcher();

    // Frames are dispatched one at a time, in arrival order
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        ConnectionCounters::incr(&counters.frames_received);
                        log::trace!("Frame from {}: {}", conn.id(), text.as_str());
                        dispatcher.dispatch_frame(&conn, text.as_str()).await;
                    }

                    Some(Ok(Message::Binary(_))) => {
                        ConnectionCounters::incr(&counters.frames_received);
                        let err = ProtocolError::Malformed("binary frames are not supported".into());
                        conn.send(&ServerEvent::error(err.to_string()));
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if control_tx.send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Socket no longer writable
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    // Cleanup: stop the writer, deregister, leave every room
    drop(control_tx);
    if !writer_done {
        let _ = writer.await;
    }
    services.registry().remove(conn.user_id(), conn.id()).await;
    let left = dispatcher.disconnect(&conn).await;
    counters
        .active_connections
        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    log::info!(
        "{} disconnected; left {} room(s)",
        conn.user_id(),
        left.len()
    );

    Ok(())
}

/// Drain outbound frames and control messages into the socket.
///
/// Exits when the socket fails or the read loop drops `control`. Closing
/// `outbound` on exit marks the connection closed for broadcasts.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Message>,
    services: Arc<Services>,
    addr: SocketAddr,
) {
    let counters = services.counters();
    loop {
        tokio::select! {
            // Pongs first so a broadcast burst cannot starve them
            biased;

            msg = control.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = ws_sender.send(msg).await {
                    log::warn!("Failed to answer ping from {addr}: {e}");
                    break;
                }
            }

            // Outgoing frame queued by the dispatcher or a broadcast
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_sender.send(Message::Text(Utf8Bytes::from(frame.to_string()))).await {
                    log::warn!("Failed to write to {addr}: {e}");
                    break;
                }
                ConnectionCounters::incr(&counters.frames_sent);
            }
        }
    }
    outbound.close();
}

/// Close a connection that failed the handshake.
async fn reject(
    ws: &mut WebSocketStream<TcpStream>,
    services: &Services,
    code: u16,
    reason: &'static str,
) {
    ConnectionCounters::incr(&services.counters().rejected_handshakes);
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        log::debug!("Failed to send close frame: {e}");
        return;
    }
    // Let the client acknowledge so the close code is delivered cleanly
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}
