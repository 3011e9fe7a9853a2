//! WebSocket transports: tungstenite dial on the client, axum upgrade on
//! the server. One binary WebSocket message carries one packet; text frames
//! are a protocol violation answered with close code 1007.

use crate::channel::{close_code_error, close_codes, Channel};
use crate::error::{ErrorCode, SftpError, SftpResult};
use crate::protocol::SUBPROTOCOL;
use crate::server::{serve_channel, SessionConfig};
use async_trait::async_trait;
use axum::extract::ws::{self, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

/// Client dial configuration.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    fn basic_auth(&self) -> Option<String> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_deref().unwrap_or("");
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, pass));
        Some(format!("Basic {}", token))
    }
}

/// Dial a server. On HTTP 401 the dial is retried once with Basic
/// credentials; a 401 with no credentials available surfaces X_NOAUTH with
/// the server's `sftp-authenticate-info` header attached.
pub async fn connect(options: &ConnectOptions) -> SftpResult<Box<dyn Channel>> {
    match dial(options, false).await {
        Ok(channel) => Ok(channel),
        Err(DialError::AuthRequired(info)) => {
            if options.basic_auth().is_some() {
                match dial(options, true).await {
                    Ok(channel) => Ok(channel),
                    Err(DialError::AuthRequired(_)) => Err(no_auth_error(info)),
                    Err(DialError::Failed(err)) => Err(err),
                }
            } else {
                Err(no_auth_error(info))
            }
        }
        Err(DialError::Failed(err)) => Err(err),
    }
}

enum DialError {
    /// Server answered 401; carries the `sftp-authenticate-info` header.
    AuthRequired(Option<String>),
    Failed(SftpError),
}

fn no_auth_error(info: Option<String>) -> SftpError {
    let mut err = SftpError::new(ErrorCode::NoAuth, "authentication required");
    if let Some(info) = info {
        err.path = Some(info);
    }
    err
}

async fn dial(options: &ConnectOptions, with_auth: bool) -> Result<Box<dyn Channel>, DialError> {
    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| DialError::Failed(SftpError::new(ErrorCode::Failure, e.to_string())))?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    if with_auth {
        if let Some(auth) = options.basic_auth() {
            let value = HeaderValue::from_str(&auth).map_err(|_| {
                DialError::Failed(SftpError::new(ErrorCode::Failure, "invalid credentials"))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
    }

    match connect_async(request).await {
        Ok((stream, _response)) => {
            info!(target: "wsftp::transport", url = %options.url, "connected");
            Ok(Box::new(WsChannel::new(stream)))
        }
        Err(WsError::Http(response)) if response.status() == 401 => {
            let info = response
                .headers()
                .get("sftp-authenticate-info")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Err(DialError::AuthRequired(info))
        }
        Err(WsError::Io(err)) => Err(DialError::Failed(SftpError::new(
            ErrorCode::ConnRefused,
            err.to_string(),
        ))),
        Err(err) => Err(DialError::Failed(SftpError::new(
            ErrorCode::Failure,
            err.to_string(),
        ))),
    }
}

/// Client-side channel over a tungstenite stream.
pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WsChannel {
    pub fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, frame: Vec<u8>) -> SftpResult<()> {
        if self.closed {
            return Ok(());
        }
        self.stream
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| SftpError::new(ErrorCode::ConnAborted, e.to_string()))
    }

    async fn recv(&mut self) -> Option<SftpResult<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Some(Ok(data.to_vec())),
                Some(Ok(Message::Text(_))) => {
                    // Non-binary payloads close the channel.
                    self.close(close_codes::BAD_DATA, "binary frames only").await;
                    return Some(Err(SftpError::new(
                        ErrorCode::BadMessage,
                        "text frame on binary channel",
                    )));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (close_codes::NORMAL, String::new()),
                    };
                    return close_code_error(code, &reason, true).map(Err);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    return Some(Err(SftpError::new(ErrorCode::ConnAborted, err.to_string())))
                }
                None => return close_code_error(close_codes::ABNORMAL, "", true).map(Err),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.stream.send(Message::Close(Some(frame))).await;
    }
}

/// Server-side channel over an axum-upgraded socket.
pub struct ServerWsChannel {
    socket: ws::WebSocket,
    closed: bool,
}

impl ServerWsChannel {
    pub fn new(socket: ws::WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

#[async_trait]
impl Channel for ServerWsChannel {
    async fn send(&mut self, frame: Vec<u8>) -> SftpResult<()> {
        if self.closed {
            return Ok(());
        }
        self.socket
            .send(ws::Message::Binary(frame.into()))
            .await
            .map_err(|e| SftpError::new(ErrorCode::ConnAborted, e.to_string()))
    }

    async fn recv(&mut self) -> Option<SftpResult<Vec<u8>>> {
        loop {
            match self.socket.recv().await {
                Some(Ok(ws::Message::Binary(data))) => return Some(Ok(data.to_vec())),
                Some(Ok(ws::Message::Text(_))) => {
                    self.close(close_codes::BAD_DATA, "binary frames only").await;
                    return Some(Err(SftpError::new(
                        ErrorCode::BadMessage,
                        "text frame on binary channel",
                    )));
                }
                Some(Ok(ws::Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (frame.code, frame.reason.to_string()),
                        None => (close_codes::NORMAL, String::new()),
                    };
                    return close_code_error(code, &reason, true).map(Err);
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    return Some(Err(SftpError::new(ErrorCode::ConnAborted, err.to_string())))
                }
                None => return close_code_error(close_codes::ABNORMAL, "", true).map(Err),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = ws::CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.socket.send(ws::Message::Close(Some(frame))).await;
    }
}

/// Listen for WebSocket sessions; each accepted socket becomes one server
/// session over the configured virtual root.
pub async fn serve(addr: SocketAddr, config: SessionConfig) -> anyhow::Result<()> {
    let state = Arc::new(config);
    let app = Router::new()
        .route("/", any(upgrade_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "wsftp::transport", %addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn upgrade_handler(
    State(config): State<Arc<SessionConfig>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| {
        let config = (*config).clone();
        async move {
            info!(target: "wsftp::transport", "session accepted");
            serve_channel(Box::new(ServerWsChannel::new(socket)), config).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header() {
        let mut options = ConnectOptions::new("ws://localhost:4002/");
        assert!(options.basic_auth().is_none());
        options.username = Some("user".into());
        options.password = Some("pass".into());
        assert_eq!(
            options.basic_auth().unwrap(),
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode("user:pass")
            )
        );
    }

    #[test]
    fn missing_auth_error_carries_info() {
        let err = no_auth_error(Some("realm hint".into()));
        assert_eq!(err.code, ErrorCode::NoAuth);
        assert_eq!(err.path.as_deref(), Some("realm hint"));
    }

    #[tokio::test]
    async fn ws_end_to_end_session() {
        use crate::fs::FileOps;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"over websocket").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = SessionConfig {
            virtual_root: dir.path().to_path_buf(),
            read_only: false,
            hide_uid_gid: false,
        };
        let state = Arc::new(config);
        let app = Router::new()
            .route("/", any(upgrade_handler))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let options = ConnectOptions::new(format!("ws://{}/", addr));
        let channel = connect(&options).await.unwrap();
        let client = crate::client::SftpClient::bind(channel).await.unwrap();
        assert!(client.features().posix_rename);

        let attrs = client.lstat("/hello.txt").await.unwrap();
        assert_eq!(attrs.size, Some(14));
        let h = client
            .open("/hello.txt", crate::protocol::attrs::open_flags::READ, &Default::default())
            .await
            .unwrap();
        assert_eq!(client.read(h, 5, 9).await.unwrap(), b"websocket");
        client.close(h).await.unwrap();
        client.end();
    }
}
