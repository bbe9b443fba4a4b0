//! WebSocket transport

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

use super::transport::{Connection, Frame, Transport};
use crate::error::ConnectionError;

/// [`Transport`] over tokio-tungstenite. Heartbeats are WebSocket pings.
#[derive(Debug, Default, Clone)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

fn connect_error(url: &str, reason: impl ToString) -> ConnectionError {
    ConnectionError::Connect {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| connect_error(url, e))?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| connect_error(url, e))?;
            let value = HeaderValue::from_str(value).map_err(|e| connect_error(url, e))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| connect_error(url, e))?;
        info!(url, "Connected to signaling channel");
        Ok(Box::new(WsConnection { stream }))
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let result = match frame {
            Frame::Message(bytes) => match String::from_utf8(bytes) {
                Ok(text) => self.stream.send(Message::Text(text)).await,
                Err(e) => self.stream.send(Message::Binary(e.into_bytes())).await,
            },
            Frame::Heartbeat => self.stream.send(Message::Ping(Vec::new())).await,
            Frame::Close => self.stream.close(None).await,
        };
        result.map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn next(&mut self) -> Option<Result<Frame, ConnectionError>> {
        loop {
            let msg = self.stream.next().await?;
            let frame = match msg {
                Ok(Message::Text(text)) => Frame::Message(text.into_bytes()),
                Ok(Message::Binary(bytes)) => Frame::Message(bytes),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Frame::Heartbeat,
                Ok(Message::Close(_)) => Frame::Close,
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(ConnectionError::Transport(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }
}
