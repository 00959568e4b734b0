//! WebSocket transport (RFC 6455) via tokio-tungstenite.
//!
//! The subprotocol name is `etp`; the encoding is signaled by the
//! `etp-encoding` handshake header. Binary frames carry Avro-binary, text
//! frames carry the JSON framing. Pings are answered by the protocol
//! machine and never surface to the session.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use crate::codec::{MessageEncoding, ENCODING_HEADER};
use crate::error::Result;

use super::{HandshakeHeaders, TransportSink, TransportStream, WireFrame};

/// WebSocket subprotocol name.
pub const SUBPROTOCOL: &str = "etp";

/// Write half of a WebSocket transport.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Read half of a WebSocket transport.
pub struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Connect to a store as a customer.
///
/// Requests the `etp` subprotocol and stamps the encoding header so the
/// store latches the same codec this session will use.
pub async fn connect(
    url: &str,
    encoding: MessageEncoding,
) -> Result<(
    WsSink<MaybeTlsStream<TcpStream>>,
    WsStream<MaybeTlsStream<TcpStream>>,
)> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    request.headers_mut().insert(
        ENCODING_HEADER,
        HeaderValue::from_static(encoding.header_value()),
    );

    let (stream, _response) = connect_async(request).await?;
    tracing::info!(url = %url, encoding = encoding.header_value(), "connected WebSocket");

    let (sink, stream) = stream.split();
    Ok((WsSink { inner: sink }, WsStream { inner: stream }))
}

/// Accept an inbound customer connection on an already-accepted TCP stream.
///
/// Returns the captured upgrade headers so the session can latch the
/// encoding the customer asked for.
pub async fn accept<S>(stream: S) -> Result<(WsSink<S>, WsStream<S>, HandshakeHeaders)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut captured = HandshakeHeaders::new();
    let ws = accept_hdr_async(stream, |request: &UpgradeRequest, mut response: UpgradeResponse| {
        for (name, value) in request.headers() {
            if let Ok(value) = value.to_str() {
                captured.insert(name.as_str(), value);
            }
        }
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        Ok(response)
    })
    .await?;
    tracing::info!("accepted WebSocket connection");

    let (sink, stream) = ws.split();
    Ok((WsSink { inner: sink }, WsStream { inner: stream }, captured))
}

#[async_trait]
impl<S> TransportSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let message = match frame {
            WireFrame::Binary(bytes) => Message::Binary(bytes),
            WireFrame::Text(text) => Message::Text(text),
        };
        self.inner.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // A close race with the peer is not an error.
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<S> TransportStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<WireFrame>> {
        loop {
            let message = match self.inner.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(e.into()),
            };
            match message {
                Message::Binary(bytes) => return Ok(Some(WireFrame::Binary(bytes))),
                Message::Text(text) => return Ok(Some(WireFrame::Text(text))),
                // Pong is queued by the protocol machine; both control
                // frames are invisible to the session.
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => continue,
            }
        }
    }
}
