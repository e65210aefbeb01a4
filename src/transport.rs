//! Streaming transport to the speech-recognition service
//!
//! One duplex WebSocket connection per session. The wire contract is
//! deliberately thin:
//!
//! - outbound binary frame = one encoded block's raw PCM16 little-endian
//!   bytes, no header, call order preserved as wire order
//! - outbound text frame `"end"` = end-of-utterance marker, once per recording
//! - inbound text frame = transcript candidate, forwarded verbatim
//!
//! [`FrameSink`] is the seam the consumer loop writes to; tests substitute a
//! recording sink, production uses [`RecognizerLink`].

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::pcm::pcm_to_le_bytes;

/// Text frame that marks the end of an utterance.
pub const END_OF_UTTERANCE: &str = "end";

/// Timeout for the initial WebSocket handshake.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound transcript frames, delivered in receive order.
pub type TranscriptReceiver = mpsc::Receiver<String>;

/// Errors raised by the streaming transport.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send a frame
    SendFailed(String),
    /// Malformed URL or handshake problem
    ProtocolError(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to recognizer: {}", e)
            }
            TransportError::Disconnected(e) => write!(f, "Recognizer disconnected: {}", e),
            TransportError::SendFailed(e) => write!(f, "Failed to send frame: {}", e),
            TransportError::ProtocolError(e) => write!(f, "WebSocket protocol error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// Ordered frame output of the pipeline. Implementations must preserve call
/// order as wire order and must not merge or split blocks.
#[async_trait]
pub trait FrameSink: Send {
    /// Transmit one encoded block as an opaque binary frame.
    async fn send_block(&mut self, pcm: &[i16]) -> Result<(), TransportError>;

    /// Transmit the end-of-utterance marker. Called at most once per
    /// recording, strictly after the last block of that recording.
    async fn send_end(&mut self) -> Result<(), TransportError>;
}

/// Live WebSocket connection to the recognizer.
///
/// The write half stays with the link (and moves through the consumer loop
/// during a recording); a spawned reader task owns the read half and forwards
/// inbound transcript frames to a channel until the connection closes.
pub struct RecognizerLink {
    write: futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    transcript_rx: Option<TranscriptReceiver>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl RecognizerLink {
    /// Connect to the recognizer. Single attempt with a timeout: reconnect and
    /// backoff policy belong to the caller, not this layer.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        log::info!("Connecting to recognizer at {}...", url);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, false, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("Recognizer connected");

        let (write, mut read) = ws_stream.split();

        let (transcript_tx, transcript_rx) = mpsc::channel(32);

        let reader_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if transcript_tx.send(text).await.is_err() {
                            log::debug!("Transcript channel closed");
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        log::info!("Recognizer closed the connection");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Recognizer socket error: {}", e);
                        break;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            log::debug!("Reader task exiting");
        });

        Ok(Self {
            write,
            transcript_rx: Some(transcript_rx),
            reader_task,
        })
    }

    /// Take ownership of the inbound transcript receiver so transcripts can be
    /// consumed concurrently while the link streams audio.
    ///
    /// Returns `None` if already taken.
    pub fn take_transcripts(&mut self) -> Option<TranscriptReceiver> {
        self.transcript_rx.take()
    }

    /// Gracefully close the connection and stop the reader task.
    pub async fn close(mut self) {
        log::info!("Disconnecting from recognizer...");
        self.reader_task.abort();
        if let Err(e) = self.write.close().await {
            log::warn!("Error closing WebSocket: {}", e);
        }
    }
}

impl Drop for RecognizerLink {
    fn drop(&mut self) {
        // Ensure the reader task dies if the link is dropped without close().
        self.reader_task.abort();
    }
}

#[async_trait]
impl FrameSink for RecognizerLink {
    async fn send_block(&mut self, pcm: &[i16]) -> Result<(), TransportError> {
        self.write
            .send(Message::Binary(pcm_to_le_bytes(pcm)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_end(&mut self) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(END_OF_UTTERANCE.to_string()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
