//! Socket-level plumbing for the realtime connection.
//!
//! A [`Transport`] owns exactly one WebSocket and knows how to open it, write
//! text frames, and surface inbound frames and failures. No retries, no
//! parsing, no protocol knowledge.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::Result;
use crate::protocol::error::ProtocolError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single inbound occurrence on the socket.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportEvent {
    /// A text frame arrived
    Message(String),
    /// The socket failed
    Error(tokio_tungstenite::tungstenite::Error),
    /// The peer closed the connection
    Closed,
}

/// A dumb pipe over one WebSocket connection.
pub struct Transport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl Transport {
    /// Open a socket to the given endpoint.
    pub async fn open(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(ProtocolError::Connection)?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Write one text frame.
    pub async fn send(&mut self, text: String) -> Result<()> {
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(ProtocolError::Connection)?;
        Ok(())
    }

    /// Wait for the next inbound event.
    ///
    /// Close and error are always surfaced, never swallowed. Binary frames and
    /// control-level ping/pong are ignored; the protocol heartbeat is
    /// message-level.
    pub async fn next(&mut self) -> TransportEvent {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(text.to_string());
                }
                Some(Ok(Message::Close(_))) | None => return TransportEvent::Closed,
                Some(Ok(_)) => {
                    // Ignore binary frames and transport-level ping/pong.
                }
                Some(Err(e)) => return TransportEvent::Error(e),
            }
        }
    }

    /// Close the socket. Errors are ignored; the peer may already be gone.
    pub async fn close(&mut self) {
        let _closed = self.write.send(Message::Close(None)).await;
    }
}
