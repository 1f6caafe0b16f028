//! WebSocket transport over tokio-tungstenite.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use convo_core::errors::TransportError;
use convo_core::frames::ABNORMAL_CLOSURE;

use crate::transport::{Connector, Handshake, Transport, TransportEvent};

/// Close code reported when the peer sent a close frame without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn Transport>, TransportError> {
        let endpoint = handshake.endpoint()?;
        let request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        let (stream, response) =
            match tokio::time::timeout(handshake.timeout, connect_async(request)).await {
                Err(_) => return Err(TransportError::Timeout(handshake.timeout)),
                Ok(Err(e)) => return Err(map_handshake_error(e)),
                Ok(Ok(pair)) => pair,
            };
        debug!(
            host = endpoint.host_str().unwrap_or_default(),
            status = response.status().as_u16(),
            "websocket handshake complete"
        );

        let mut transport = WebSocketTransport { stream };
        if let Some(frame) = handshake.auth_frame() {
            let text = frame
                .to_json()
                .map_err(|e| TransportError::Io(e.to_string()))?;
            transport.send_text(text).await?;
        }
        Ok(Box::new(transport))
    }
}

fn map_handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => TransportError::HandshakeRejected {
            status: response.status().as_u16(),
        },
        tungstenite::Error::HttpFormat(e) => TransportError::MalformedHandshake(e.to_string()),
        tungstenite::Error::Protocol(e) => TransportError::MalformedHandshake(e.to_string()),
        tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        other => TransportError::ConnectFailed(other.to_string()),
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return TransportEvent::Text(text.as_str().to_owned())
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    return TransportEvent::Closed { code, reason };
                }
                // Binary frames are not part of the protocol; ping/pong is
                // answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    return TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".into(),
                    }
                }
                Some(Err(e)) => return TransportEvent::Failed(TransportError::Io(e.to_string())),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!(error = %e, "websocket close did not complete cleanly");
        }
    }
}
