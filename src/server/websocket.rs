use crate::agent::ChatAgent;
use crate::models::websocket::{ ClientMessage, ServerMessage };

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::future::Future;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };

use tokio_tungstenite::{ accept_hdr_async_with_config, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{ Message, WebSocketConfig };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ debug, info, warn, error };
use futures::{ Sink, SinkExt, StreamExt };

type HmacSha256 = Hmac<Sha256>;

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;
const SIGNATURE_WINDOW_SECS: i64 = 300;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::MIN.saturating_add(9)));
}

pub async fn start_ws_server(
    addr: &str,
    agent: Arc<ChatAgent>,
    api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("WS server listening on: {}", addr);
    if api_key.as_deref().map_or(true, str::is_empty) {
        warn!("No server API key configured; connections are not authenticated");
    }

    loop {
        let (stream, peer) = accept_with_retry(|| listener.accept()).await;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let agent_clone = Arc::clone(&agent);
        let required_api_key = api_key.clone();

        tokio::spawn(async move {
            if let Err(e) = process_connection(peer, stream, agent_clone, required_api_key).await {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

/// Retries until a connection is accepted. Accept errors such as EMFILE or
/// ECONNABORTED only affect the pending connection, never the listener.
async fn accept_with_retry<F, Fut, T>(mut accept: F) -> T
    where F: FnMut() -> Fut, Fut: Future<Output = std::io::Result<T>>
{
    loop {
        match accept().await {
            Ok(accepted) => {
                return accepted;
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Checks the `ts`/`sig` pair: `sig` must be the hex HMAC-SHA256 of `ts`
/// under the shared secret, and `ts` must be within the allowed window of `now`.
pub fn verify_signature(
    secret: &str,
    params: &HashMap<String, String>,
    now: i64
) -> Result<(), &'static str> {
    let ts = params
        .get("ts")
        .or_else(|| params.get("X-Api-Ts"))
        .map(|s| s.as_str());
    let sig = params
        .get("sig")
        .or_else(|| params.get("X-Api-Sign"))
        .map(|s| s.as_str());

    let (ts, sig) = match (ts, sig) {
        (Some(ts), Some(sig)) => (ts, sig),
        _ => {
            return Err("missing ts/sig");
        }
    };

    let ts_i: i64 = ts.parse().map_err(|_| "invalid timestamp")?;
    if (now - ts_i).abs() > SIGNATURE_WINDOW_SECS {
        return Err("timestamp out of range");
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "invalid secret")?;
    mac.update(ts.as_bytes());
    let provided = hex::decode(sig).map_err(|_| "bad signature")?;
    mac.verify_slice(&provided).map_err(|_| "bad signature")
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

pub async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    agent: Arc<ChatAgent>,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(response);
            }
        };

        let qs = req.uri().query().unwrap_or("");
        let params: HashMap<String, String> = form_urlencoded
            ::parse(qs.as_bytes())
            .into_owned()
            .collect();

        match verify_signature(secret, &params, Utc::now().timestamp()) {
            Ok(()) => Ok(response),
            Err(reason) => {
                warn!("Rejected connection from {}: {}", peer, reason);
                Err(unauthorized(reason))
            }
        }
    };

    // Oversized frames are refused while reading, before they are buffered.
    let config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };

    match accept_hdr_async_with_config(stream, auth_callback, Some(config)).await {
        Ok(ws) => {
            handle_connection(peer, ws, agent).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

async fn send_message<S>(tx: &mut S, msg: &ServerMessage) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: Sink<Message> + Unpin, S::Error: Error + Send + Sync + 'static
{
    let json = serde_json::to_string(msg)?;
    tx.send(Message::Text(json)).await?;
    Ok(())
}

/// Serves one chat session. The connection owns its conversation, so
/// sessions never share state beyond the agent itself.
pub async fn handle_connection<S>(peer: SocketAddr, websocket: WebSocketStream<S>, agent: Arc<ChatAgent>)
    where S: AsyncRead + AsyncWrite + Unpin
{
    let (mut tx, mut rx) = websocket.split();
    let mut conversation = agent.new_conversation();
    info!("Assigned conversation ID {} to {}", conversation.id(), peer);

    let greeting = ServerMessage::History {
        conversation_id: conversation.id().to_string(),
        messages: conversation.messages().to_vec(),
    };
    if let Err(e) = send_message(&mut tx, &greeting).await {
        error!("Failed to send greeting to {}: {}", peer, e);
        return;
    }

    while let Some(msg) = rx.next().await {
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                match e {
                    tokio_tungstenite::tungstenite::Error::Capacity(ref reason) => {
                        warn!("Message from {} exceeds size limit ({}): {}", peer, MAX_MESSAGE_SIZE, reason);
                        let error_msg = ServerMessage::Error {
                            message: "Message too large".to_string(),
                        };
                        if send_message(&mut tx, &error_msg).await.is_err() {
                            error!("Failed to send size limit error to {}", peer);
                        }
                    }
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::History) =>
                        ServerMessage::History {
                            conversation_id: conversation.id().to_string(),
                            messages: conversation.messages().to_vec(),
                        },
                    Ok(ClientMessage::Chat { content }) => {
                        if content.trim().is_empty() {
                            debug!("Ignoring empty chat message from {}", peer);
                            continue;
                        }
                        if let Err(e) = send_message(&mut tx, &ServerMessage::Processing).await {
                            error!("Error sending processing status to {}: {}", peer, e);
                            break;
                        }
                        match agent.process_message(&mut conversation, &content).await {
                            Ok(Some(response)) =>
                                ServerMessage::Response {
                                    content: response,
                                    timestamp: Utc::now().timestamp(),
                                },
                            Ok(None) => {
                                continue;
                            }
                            Err(e) => {
                                error!("Agent error for {}: {}", peer, e);
                                ServerMessage::Error {
                                    message: format!("Model call failed: {}", e),
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to parse message from {}: {}", peer, e);
                        ServerMessage::Error {
                            message: format!("Failed to parse message: {}", e),
                        }
                    }
                };

                if let Err(e) = send_message(&mut tx, &reply).await {
                    error!("Error sending reply to {}: {}", peer, e);
                    break;
                }
            }
            Message::Close(_) => {
                info!("Received close frame from {}", peer);
                break;
            }
            Message::Ping(ping_data) => {
                if tx.send(Message::Pong(ping_data)).await.is_err() {
                    error!("Failed to send pong to {}", peer);
                    break;
                }
            }
            Message::Pong(_) | Message::Frame(_) => {}
            Message::Binary(_) => {
                warn!("Ignoring binary message from {}", peer);
            }
        }
    }
    info!(
        "WebSocket connection closed for {} (Conv ID: {}, {} messages)",
        peer,
        conversation.id(),
        conversation.len()
    );
}
