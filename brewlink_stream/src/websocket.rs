//! A stream transport over the appliance proxy's websocket

use std::fmt;

use async_trait::async_trait;
use brewlink_tokens::TokenBundle;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::ORIGIN, HeaderName, HeaderValue, StatusCode},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::{ClientMessage, ServerMessage, StreamConnection, StreamConnector, StreamError};

/// The appliance proxy endpoint
pub const DEFAULT_URL: &str = "wss://iot-api-ws.breville.com/applianceProxy";

/// The origin presented to the appliance proxy
pub const DEFAULT_ORIGIN: &str = "https://iot-api-ws.breville.com";

const SF_ID_TOKEN: HeaderName = HeaderName::from_static("sf-id-token");

/// Connects to the appliance proxy, presenting the ID token in the `sf-id-token` header
#[derive(Clone)]
pub struct WebSocketConnector {
    url: String,
    origin: HeaderValue,
}

impl WebSocketConnector {
    /// Connects to the production appliance proxy
    pub fn new() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            origin: HeaderValue::from_static(DEFAULT_ORIGIN),
        }
    }

    /// Connects to `url` instead
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Presents `origin` instead
    pub fn with_origin(mut self, origin: HeaderValue) -> Self {
        self.origin = origin;
        self
    }

    /// The endpoint connected to
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.url)
            .field("origin", &self.origin)
            .finish()
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    type Connection = WebSocketConnection;

    #[tracing::instrument(skip_all, fields(url = %self.url))]
    async fn connect(&self, bundle: &TokenBundle) -> Result<Self::Connection, StreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(StreamError::transport)?;

        let mut token =
            HeaderValue::from_str(bundle.id_token().as_str()).map_err(StreamError::transport)?;
        token.set_sensitive(true);

        let headers = request.headers_mut();
        headers.insert(SF_ID_TOKEN, token);
        headers.insert(ORIGIN, self.origin.clone());

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => {
                tracing::info!("websocket connected");
                Ok(WebSocketConnection { stream })
            }
            Err(tungstenite::Error::Http(response))
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                tracing::warn!(status = %response.status(), "websocket handshake refused credentials");
                Err(StreamError::Unauthorized)
            }
            Err(err) => Err(StreamError::transport(err)),
        }
    }
}

/// A connection to the appliance proxy
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection").finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamConnection for WebSocketConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), StreamError> {
        let payload = message.to_json()?;
        self.stream
            .send(Message::Text(payload.into()))
            .await
            .map_err(from_ws_error)
    }

    async fn receive(&mut self) -> Result<Option<ServerMessage>, StreamError> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(from_ws_error(err)),
            };

            match message {
                Message::Text(text) => return ServerMessage::from_json(&text).map(Some),
                Message::Binary(data) => {
                    let text = std::str::from_utf8(&data)
                        .map_err(|err| StreamError::Protocol(err.to_string()))?;
                    return ServerMessage::from_json(text).map(Some);
                }
                Message::Close(frame) => {
                    tracing::info!(?frame, "websocket closed by the backend");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::AlreadyClosed | tungstenite::Error::ConnectionClosed) => {
                Ok(())
            }
            Err(err) => Err(StreamError::transport(err)),
        }
    }
}

fn from_ws_error(err: tungstenite::Error) -> StreamError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            StreamError::Closed
        }
        err => StreamError::transport(err),
    }
}
