use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::channel::{Channel, ChannelTable};
use super::{Transport, TransportConfig, TransportError, TransportEvent};
use crate::protocol::{decode_envelope, encode_envelope, Envelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 16;

/// WebSocket implementation of the shared transport. One socket per process;
/// every document channel is multiplexed through it as bincode envelopes.
pub struct WebSocketTransport {
    channels: Arc<ChannelTable>,
    events: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Dial the collaboration server and start the I/O task. The initial
    /// dial fails fast; later drops are redialed with capped backoff without
    /// surfacing an error to the layers above.
    pub async fn connect(config: TransportConfig) -> Result<Arc<Self>, TransportError> {
        let (stream, _) = connect_async(&config.url)
            .await
            .map_err(|err| TransportError::Connect {
                url: config.url.clone(),
                message: err.to_string(),
            })?;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Envelope>();
        let channels = Arc::new(ChannelTable::new(tx_out));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));

        let io_task = tokio::spawn(run_io(
            stream,
            rx_out,
            Arc::clone(&channels),
            events.clone(),
            Arc::clone(&connected),
            config,
        ));

        Ok(Arc::new(Self {
            channels,
            events,
            connected,
            io_task: Mutex::new(Some(io_task)),
        }))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn channel(&self, name: &str) -> Channel {
        self.channels.channel(name)
    }

    fn release_channel(&self, name: &str) {
        self.channels.release(name);
    }

    fn channel_names(&self) -> Vec<String> {
        self.channels.names()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let task = self.io_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.lock().take() {
            task.abort();
        }
    }
}

async fn run_io(
    initial: WsStream,
    mut rx_out: mpsc::UnboundedReceiver<Envelope>,
    channels: Arc<ChannelTable>,
    events: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    config: TransportConfig,
) {
    let mut stream = Some(initial);
    loop {
        let ws = match stream.take() {
            Some(ws) => ws,
            None => {
                let ws = redial(&config).await;
                connected.store(true, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Reconnected);
                ws
            }
        };

        let exit = pump(ws, &mut rx_out, &channels).await;
        connected.store(false, Ordering::SeqCst);
        let _ = events.send(TransportEvent::Disconnected);

        match exit {
            PumpExit::LocalClose => break,
            PumpExit::RemoteClose => {
                debug!(target = "transport.ws", url = %config.url, "socket dropped, redialing");
            }
        }
    }
}

async fn redial(config: &TransportConfig) -> WsStream {
    let mut delay = config.reconnect_initial;
    loop {
        tokio::time::sleep(delay).await;
        match connect_async(&config.url).await {
            Ok((ws, _)) => return ws,
            Err(err) => {
                debug!(
                    target = "transport.ws",
                    url = %config.url,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "redial failed"
                );
                delay = (delay * 2).min(config.reconnect_max);
            }
        }
    }
}

enum PumpExit {
    /// Every outbound sender is gone; the transport was shut down locally.
    LocalClose,
    /// The socket closed underneath us.
    RemoteClose,
}

async fn pump(
    ws: WsStream,
    rx_out: &mut mpsc::UnboundedReceiver<Envelope>,
    channels: &ChannelTable,
) -> PumpExit {
    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            outbound = rx_out.recv() => match outbound {
                Some(envelope) => match encode_envelope(&envelope) {
                    Ok(bytes) => {
                        if sink.send(Message::Binary(bytes)).await.is_err() {
                            return PumpExit::RemoteClose;
                        }
                    }
                    Err(err) => {
                        warn!(target = "transport.ws", error = %err, "dropping unencodable envelope");
                    }
                },
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpExit::LocalClose;
                }
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Binary(bytes))) => route_bytes(channels, &bytes),
                Some(Ok(Message::Text(text))) => route_bytes(channels, text.as_bytes()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return PumpExit::RemoteClose,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn route_bytes(channels: &ChannelTable, bytes: &[u8]) {
    match decode_envelope(bytes) {
        Ok(envelope) => channels.route(envelope),
        Err(err) => {
            warn!(target = "transport.ws", error = %err, "dropping undecodable frame");
        }
    }
}
