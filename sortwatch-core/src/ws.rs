//! WebSocket implementation of the session capability.
//!
//! Speaks a small JSON protocol to a machine telemetry agent: one
//! `{"subscribe": [tags...]}` request, then a stream of
//! `{"tag": ..., "value": ..., "timestamp": ...}` updates.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{CoreError, Result};
use crate::session::{Connector, Session, UPDATE_CHANNEL_CAPACITY};
use crate::types::{MachineConfig, TagUpdate};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsRead = futures_util::stream::SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Session = WsSession;

    fn connect(
        &self,
        config: &MachineConfig,
    ) -> impl std::future::Future<Output = Result<WsSession>> + Send {
        let url = session_url(config);
        async move {
            let url = url?;
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|e| CoreError::Connection(e.to_string()))?;
            let (sink, read) = ws.split();
            Ok(WsSession {
                sink,
                read: Some(read),
                reader: None,
            })
        }
    }
}

/// Endpoint plus optional auth token as a query parameter.
fn session_url(config: &MachineConfig) -> Result<Url> {
    let mut url =
        Url::parse(&config.endpoint).map_err(|e| CoreError::Connection(e.to_string()))?;
    if let Some(token) = &config.token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

pub struct WsSession {
    sink: WsSink,
    read: Option<WsRead>,
    reader: Option<JoinHandle<()>>,
}

#[derive(serde::Serialize)]
struct SubscribeRequest<'a> {
    subscribe: &'a [String],
}

impl Session for WsSession {
    fn subscribe(
        &mut self,
        tags: &[String],
    ) -> impl std::future::Future<Output = Result<mpsc::Receiver<TagUpdate>>> + Send {
        let request = serde_json::to_string(&SubscribeRequest { subscribe: tags })
            .map_err(|e| CoreError::Connection(e.to_string()));
        async move {
            let request = request?;
            self.sink
                .send(Message::Text(request))
                .await
                .map_err(|e| CoreError::Connection(e.to_string()))?;

            let read = self
                .read
                .take()
                .ok_or_else(|| CoreError::Connection("session already subscribed".into()))?;
            let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
            self.reader = Some(tokio::spawn(pump_updates(read, tx)));
            Ok(rx)
        }
    }

    fn close(self) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let mut sink = self.sink;
            // Best effort close frame; the peer may already be gone.
            let _ = sink.send(Message::Close(None)).await;
            if let Some(reader) = self.reader {
                reader.abort();
            }
        }
    }
}

/// Forward incoming frames as updates until the transport dies. Dropping
/// the sender is what tells the supervisor the session is gone.
async fn pump_updates(mut read: WsRead, tx: mpsc::Sender<TagUpdate>) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<TagUpdate>(&text) {
                Ok(update) => {
                    if tx.send(update).await.is_err() {
                        return; // supervisor hung up
                    }
                }
                Err(e) => {
                    // Malformed frames are logged and skipped, never fatal.
                    debug!(error = %e, "skipping malformed update frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "websocket read failed");
                break;
            }
        }
    }
}
