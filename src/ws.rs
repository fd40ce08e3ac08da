//! # WebSocket Transport
//!
//! Dials the broker's authenticated WebSocket endpoint and moves session
//! messages over it as JSON text frames. In production the bearer token
//! travels as the `JWT_TOKEN` cookie on the upgrade request; in dev mode
//! (`KOMOCLI_DEV` set) it is appended as an `authorization` query
//! parameter instead, since local broker builds read it from there.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::error::SessionError;
use crate::protocol::SessionMessage;

/// Production broker endpoint; `KOMOCLI_WS_URL` overrides it.
pub const DEFAULT_WS_URL: &str = "wss://app.komodor.com";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// Opens a WebSocket to the broker endpoint for the given agent.
///
/// Honours the cancellation token while the handshake is in flight. A
/// rejected upgrade surfaces the server HTTP status in the error.
pub async fn dial(
    base_url: &str,
    agent_id: &str,
    token: &str,
    cancel: &CancellationToken,
) -> Result<WsStream, SessionError> {
    let dev_mode = !std::env::var("KOMOCLI_DEV").unwrap_or_default().is_empty();
    let request = build_request(base_url, agent_id, token, dev_mode)?;
    info!("Connecting to WS backend at {}", request.uri());

    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = connect_async(request) => match result {
            Ok((stream, _response)) => {
                debug!("WebSocket connected");
                Ok(stream)
            }
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status();
                error!("handshake failed with status {}", status);
                Err(SessionError::Connect {
                    status: Some(status.as_u16()),
                    message: format!("handshake failed with status {status}"),
                })
            }
            Err(e) => Err(SessionError::Connect {
                status: None,
                message: e.to_string(),
            }),
        },
    }
}

fn build_request(
    base_url: &str,
    agent_id: &str,
    token: &str,
    dev_mode: bool,
) -> Result<Request, SessionError> {
    let endpoint = format!("{}/ws/client/{}", base_url.trim_end_matches('/'), agent_id);
    let mut url = Url::parse(&endpoint).map_err(|e| SessionError::Connect {
        status: None,
        message: format!("invalid broker url {endpoint:?}: {e}"),
    })?;

    if dev_mode {
        url.query_pairs_mut().append_pair("authorization", token);
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| SessionError::Connect {
            status: None,
            message: format!("failed to build upgrade request: {e}"),
        })?;

    if !dev_mode {
        let cookie = format!("JWT_TOKEN={token}")
            .parse()
            .map_err(|e| SessionError::Connect {
                status: None,
                message: format!("token is not a valid cookie value: {e}"),
            })?;
        request.headers_mut().insert(COOKIE, cookie);
    }

    Ok(request)
}

/// Serializes a session message and sends it as one text frame.
pub async fn send_frame(sink: &mut WsSink, msg: &SessionMessage) -> Result<(), SessionError> {
    let text = msg.encode()?;
    debug!("Sending msg over WS: {}", text);
    sink.send(Message::Text(text.into()))
        .await
        .map_err(SessionError::from)
}

/// Reads the next text frame. Returns `None` on a clean close; non-text
/// frames (pings, pongs, binary) are skipped.
pub async fn read_frame(stream: &mut WsSource) -> Result<Option<Utf8Bytes>, SessionError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => {
                debug!("Read msg over WS: {}", text);
                return Ok(Some(text));
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_auth_uses_the_jwt_cookie() {
        let request = build_request("wss://app.komodor.com", "agent-1", "tok-123", false).unwrap();
        assert_eq!(request.uri().path(), "/ws/client/agent-1");
        assert_eq!(request.uri().query(), None);
        assert_eq!(
            request.headers().get(COOKIE).unwrap(),
            "JWT_TOKEN=tok-123"
        );
    }

    #[test]
    fn dev_auth_uses_the_query_parameter() {
        let request = build_request("ws://localhost:7070/", "agent-1", "tok-123", true).unwrap();
        assert_eq!(request.uri().path(), "/ws/client/agent-1");
        assert_eq!(request.uri().query(), Some("authorization=tok-123"));
        assert!(request.headers().get(COOKIE).is_none());
    }

    #[test]
    fn rejects_unparseable_base_urls() {
        assert!(build_request("not a url", "agent-1", "tok", false).is_err());
    }
}
