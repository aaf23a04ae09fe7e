use crate::channel::ChannelError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

/// An open transport as seen by the channel: text frames out, text frames in.
/// The inbound side ends when the transport closes.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// The far end of a [`Connection`] created by [`Connection::channel`].
pub struct Peer {
    pub sent: mpsc::UnboundedReceiver<String>,
    pub deliver: mpsc::UnboundedSender<String>,
}

impl Connection {
    pub fn channel() -> (Connection, Peer) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (deliver, inbound) = mpsc::unbounded_channel();
        (Connection { outbound, inbound }, Peer { sent, deliver })
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Connection, ChannelError>;
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, ChannelError> {
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (connection, peer) = Connection::channel();
        tokio::spawn(pump(stream, peer));
        Ok(connection)
    }
}

async fn pump<S>(stream: tokio_tungstenite::WebSocketStream<S>, peer: Peer)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let Peer { mut sent, deliver } = peer;
    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if deliver.send(text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if deliver.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!(event = "ws_binary_not_utf8"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "ws_close_received", frame = ?frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "ws_read_error", error = %err);
                        break;
                    }
                    None => break,
                }
            }
            outgoing = sent.recv() => {
                match outgoing {
                    Some(text) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!(event = "ws_write_error", error = %err);
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}
