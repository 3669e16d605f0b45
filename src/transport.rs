use std::{future::Future, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    consts::LOG_PAYLOAD_PREVIEW_CHARS,
    core::truncate_message,
    error::{LiveError, Result},
};

/// Text-frame pipe to the server. Readiness drops to `false` once the
/// underlying socket is gone, whether or not anyone observed a close.
#[derive(Debug)]
pub struct FrameLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    ready: watch::Receiver<bool>,
}

impl FrameLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        ready: watch::Receiver<bool>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            ready,
        }
    }

    pub fn sender(&self) -> LinkSender {
        LinkSender {
            outbound: self.outbound.clone(),
            ready: self.ready.clone(),
        }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    pub fn into_parts(self) -> (LinkSender, mpsc::UnboundedReceiver<String>) {
        (
            LinkSender {
                outbound: self.outbound,
                ready: self.ready,
            },
            self.inbound,
        )
    }
}

#[derive(Debug, Clone)]
pub struct LinkSender {
    outbound: mpsc::UnboundedSender<String>,
    ready: watch::Receiver<bool>,
}

impl LinkSender {
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() && !self.outbound.is_closed()
    }
}

pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str) -> impl Future<Output = Result<FrameLink>> + Send;
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<FrameLink> {
        let request = url
            .into_client_request()
            .map_err(|error| LiveError::Transport(format!("failed to build websocket request: {error}")))?;
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| LiveError::Timeout(self.connect_timeout))?
            .map_err(|error| LiveError::Transport(format!("stream connection failed: {error}")))?;
        tracing::debug!(url, "websocket connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(true);
        tokio::spawn(pump_socket(ws_stream, outbound_rx, inbound_tx, ready_tx));
        Ok(FrameLink::new(outbound_tx, inbound_rx, ready_rx))
    }
}

async fn pump_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
    ready: watch::Sender<bool>,
) {
    let (mut sink, mut stream) = ws_stream.split();
    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(error) = sink.send(Message::Text(text.into())).await {
                        tracing::warn!(%error, "websocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text.as_str().to_owned()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(body) => {
                        if inbound.send(body).is_err() {
                            break;
                        }
                    }
                    Err(error) => tracing::warn!(%error, "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(error) = sink.send(Message::Pong(payload)).await {
                        tracing::warn!(%error, "failed to send pong");
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(
                        reason = %frame
                            .map(|f| truncate_message(f.reason.as_str(), LOG_PAYLOAD_PREVIEW_CHARS))
                            .unwrap_or_default(),
                        "websocket closed by server"
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::warn!(%error, "websocket read error");
                    break;
                }
                None => break,
            },
        }
    }
    let _ = ready.send(false);
}
