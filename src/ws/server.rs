//! WebSocket endpoint: accept loop, handshake, and per-connection pumps.
//!
//! Each connection runs two tasks. The read pump owns the socket's read
//! half, decodes client events and dispatches them; the write pump is the
//! only consumer of the outbound queue and the only writer on the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::Client;
use super::hub::Hub;
use super::protocol::ClientEvent;

/// Time allowed for a single socket write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read deadline; missing it means the peer stopped answering pings.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence. Must stay below `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Maximum inbound frame size.
pub const MAX_MESSAGE_SIZE: usize = 8192;

pub struct SocketServer {
    listener: TcpListener,
    hub: Arc<Hub>,
    instance_id: String,
}

impl SocketServer {
    pub async fn bind(addr: &str, hub: Arc<Hub>, instance_id: String) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hub,
            instance_id,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let hub = Arc::clone(&self.hub);
                            let instance_id = self.instance_id.clone();
                            tokio::spawn(handle_socket(stream, addr, hub, instance_id));
                        }
                        Err(err) => warn!(error = %err, "accept error"),
                    }
                }
            }
        }
        info!("listener stopped");
    }
}

/// First-bytes dispatch: a plain `GET /health` is answered without a
/// WebSocket upgrade; everything else goes through the handshake, which
/// rejects paths other than `/ws`. The peek leaves the stream untouched.
async fn handle_socket(stream: TcpStream, addr: SocketAddr, hub: Arc<Hub>, instance_id: String) {
    let mut head = [0u8; 16];
    let n = match tokio::time::timeout(Duration::from_secs(5), stream.peek(&mut head)).await {
        Ok(Ok(n)) => n,
        _ => return,
    };

    if is_health_request(&head[..n]) {
        serve_health(stream, &instance_id).await;
        return;
    }
    handle_ws(stream, addr, hub).await;
}

fn is_health_request(head: &[u8]) -> bool {
    head.starts_with(b"GET /health")
}

fn health_response(instance_id: &str) -> String {
    let body = format!("OK - Instance: {instance_id}");
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

async fn serve_health(mut stream: TcpStream, instance_id: &str) {
    let mut discard = [0u8; 1024];
    let _ = stream.read(&mut discard).await;
    let _ = stream.write_all(health_response(instance_id).as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn handle_ws(stream: TcpStream, addr: SocketAddr, hub: Arc<Hub>) {
    let config = WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE));

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() != "/ws" {
                let mut not_found = ErrorResponse::new(Some("not found".to_string()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                return Err(not_found);
            }
            Ok(response)
        },
        Some(config),
    )
    .await
    {
        Ok(ws) => ws,
        Err(err) => {
            debug!(%addr, error = %err, "websocket handshake failed");
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    debug!(%addr, conn_id = %conn_id, "websocket connection established");

    let (client, queue_rx) = Client::new(conn_id.clone());
    hub.register(Arc::clone(&client));

    let (sink, source) = ws.split();
    let write_task = tokio::spawn(write_pump(sink, queue_rx, client.close_signal()));

    read_pump(source, &client, &hub).await;

    // Rooms are cleaned up before the registry entry goes away, so no room
    // is left holding a reference to a deregistered client.
    hub.room_manager().remove_client_from_all_rooms(&client);
    hub.deregister(&conn_id);
    let _ = write_task.await;
    debug!(conn_id = %conn_id, "connection torn down");
}

/// Read side: decode events and dispatch until error, close, or deadline.
async fn read_pump(
    mut source: SplitStream<WebSocketStream<TcpStream>>,
    client: &Arc<Client>,
    hub: &Arc<Hub>,
) {
    loop {
        let msg = match tokio::time::timeout(PONG_WAIT, source.next()).await {
            Err(_) => {
                debug!(conn_id = client.conn_id(), "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(conn_id = client.conn_id(), error = %err, "read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let text: &str = match &msg {
            Message::Text(text) => text.as_ref(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(conn_id = client.conn_id(), "non-utf8 binary frame skipped");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let event: ClientEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                // Connection stays open; only the frame is dropped.
                warn!(conn_id = client.conn_id(), error = %err, "skipping undecodable frame");
                continue;
            }
        };

        if let Some(user) = event.user()
            && !user.is_empty()
        {
            client.set_user_info(user.clone());
        }

        dispatch(hub, client, event).await;
    }
}

async fn dispatch(hub: &Arc<Hub>, client: &Arc<Client>, event: ClientEvent) {
    let rooms = hub.room_manager();
    match event {
        ClientEvent::Subscribe { room, options, .. } => {
            rooms.subscribe(client, &room, options.unwrap_or_default());
        }
        ClientEvent::Unsubscribe { room, .. } => rooms.unsubscribe(client, &room),
        ClientEvent::Publish { room, payload, .. } => rooms.publish(client, &room, payload).await,
        ClientEvent::Presence { room, .. } => rooms.add_presence(client, &room),
        ClientEvent::Typing { room, is_typing, .. } => rooms.typing(client, &room, is_typing),
        ClientEvent::ReadReceipt { room, message_id, .. } => {
            rooms.read_receipt(client, &room, &message_id);
        }
        ClientEvent::DirectMsg { to_user_id, payload, .. } => {
            rooms.direct_message(client, &to_user_id, payload);
        }
        ClientEvent::EditMessage {
            room,
            message_id,
            payload,
            ..
        } => rooms.edit_message(client, &room, &message_id, payload),
    }
}

/// Write side: sole consumer of the outbound queue, sole writer on the
/// socket. Queued payloads are coalesced into one newline-separated text
/// frame per wakeup. Exits on write error or observed queue close, sending
/// a close frame on the way out.
async fn write_pump(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                break;
            }
            frame = queue.recv() => {
                let Some(mut frame) = frame else {
                    let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    break;
                };
                while let Ok(next) = queue.try_recv() {
                    frame.push(b'\n');
                    frame.extend_from_slice(&next);
                }
                let Ok(text) = String::from_utf8(frame) else {
                    continue;
                };
                match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = ping.tick() => {
                match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Ping(Bytes::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_request_detection() {
        assert!(is_health_request(b"GET /health HTTP/1.1"));
        assert!(is_health_request(b"GET /health"));
        assert!(!is_health_request(b"GET /ws HTTP/1.1"));
        assert!(!is_health_request(b"POST /health HTTP/1.1"));
        assert!(!is_health_request(b""));
    }

    #[test]
    fn test_health_response_body() {
        let response = health_response("server-1");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nOK - Instance: server-1"));
        assert!(response.contains("Content-Length: 23\r\n"));
    }

    #[test]
    fn test_ping_period_below_pong_wait() {
        assert!(PING_PERIOD < PONG_WAIT);
        assert_eq!(PING_PERIOD, Duration::from_secs(54));
    }
}
