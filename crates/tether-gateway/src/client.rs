//! Gateway client
//!
//! Thin frame-level client over `tokio-tungstenite`, used by the end-to-end
//! suite and by tooling that plays the part of a node or a front-end.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::frame::{Frame, FrameType};
use crate::{GatewayError, Result};

type Stream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Client for connecting to a Tether gateway
pub struct GatewayClient {
    url: String,
}

impl GatewayClient {
    /// `url` is the full WebSocket endpoint, e.g. `ws://127.0.0.1:18789/ws`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Client for `/ws` at `addr`, identifying as `principal`
    pub fn for_addr(addr: std::net::SocketAddr, principal: Option<&str>) -> Self {
        match principal {
            Some(p) => Self::new(format!("ws://{}/ws?principal={}", addr, p)),
            None => Self::new(format!("ws://{}/ws", addr)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the gateway
    pub async fn connect(&self) -> Result<GatewayConnection> {
        let (ws, _) = tokio_tungstenite::connect_async(&self.url).await?;
        tracing::debug!("Connected to {}", self.url);
        Ok(GatewayConnection { ws })
    }
}

/// An open connection speaking frames
pub struct GatewayConnection {
    ws: Stream,
}

impl GatewayConnection {
    /// Send a frame
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.ws.send(WsMessage::Text(frame.to_text()?)).await?;
        Ok(())
    }

    /// Send raw text, bypassing frame encoding
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws.send(WsMessage::Text(text.to_string())).await?;
        Ok(())
    }

    /// Receive the next frame. `None` once the gateway closed the connection.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                WsMessage::Text(text) => return Frame::parse(&text).map(Some),
                WsMessage::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Receive frames until one of `frame_type` arrives, skipping others
    pub async fn expect(&mut self, frame_type: FrameType, within: Duration) -> Result<Frame> {
        let wait = async {
            loop {
                match self.recv_frame().await? {
                    Some(frame) if frame.frame_type == frame_type => return Ok::<Frame, GatewayError>(frame),
                    Some(other) => tracing::debug!("Skipping {} while waiting for {}", other.frame_type, frame_type),
                    None => return Err(GatewayError::WebSocket("connection closed".to_string())),
                }
            }
        };
        tokio::time::timeout(within, wait)
            .await
            .map_err(|_| GatewayError::Internal(format!("no {} within {:?}", frame_type, within)))?
    }

    /// Close the connection
    pub async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
