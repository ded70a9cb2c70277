//! WebSocket transport.
//!
//! parity-ws drives each connection from its own event loop thread and hands
//! us callbacks; this module bridges those callbacks into the blocking
//! [`Transport`] contract with a per connection channel.  One WAMP message
//! maps to exactly one WebSocket message: text frames for the JSON codec,
//! binary frames otherwise.  Liveness piggybacks on WebSocket ping/pong.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rand::{thread_rng, Rng};
use url::Url;
use ws::{
    CloseCode, Error as WSError, ErrorKind as WSErrorKind, Frame, Handler, Handshake,
    Message as WSMessage, OpCode, Request, Response, Result as WSResult, Sender,
};

use crate::serializer::SerializerType;
use crate::transport::Transport;
use crate::{Error, ErrorKind, WampResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    connected: AtomicBool,
    pending_pings: Mutex<HashMap<Vec<u8>, mpsc::Sender<()>>>,
}

impl Shared {
    fn new() -> Arc<Shared> {
        Arc::new(Shared {
            connected: AtomicBool::new(true),
            pending_pings: Mutex::new(HashMap::new()),
        })
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.pending_pings.lock().unwrap().clear();
        }
    }
}

/// WebSocket transport, usable from either end of the connection.
pub struct WebSocketTransport {
    // The ws sender is internally thread safe; the lock makes that a type
    // level guarantee for the Transport contract.
    sender: Mutex<Sender>,
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    shared: Arc<Shared>,
    is_binary: bool,
}

impl WebSocketTransport {
    fn new(
        sender: Sender,
        incoming: mpsc::Receiver<Vec<u8>>,
        shared: Arc<Shared>,
        serializer: SerializerType,
    ) -> WebSocketTransport {
        WebSocketTransport {
            sender: Mutex::new(sender),
            incoming: Mutex::new(incoming),
            shared,
            is_binary: serializer.is_binary(),
        }
    }

    /// Connects to a WebSocket endpoint and negotiates one of the offered
    /// serializers via the subprotocol list.
    pub fn connect(
        url: &Url,
        serializers: &[SerializerType],
    ) -> WampResult<(WebSocketTransport, SerializerType)> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let url_string = url.to_string();
        let offered: Vec<SerializerType> = serializers.to_vec();

        thread::spawn(move || {
            trace!("Beginning websocket connection to {}", url_string);
            let thread_ready = ready_tx.clone();
            let connect_result = ws::connect(url_string, move |out| ClientHandler {
                out,
                offered: offered.clone(),
                ready: Some(ready_tx.clone()),
                bridge: None,
                shared: Shared::new(),
            })
            .map_err(|e| Error::new(ErrorKind::WSError(e)));
            if let Err(e) = connect_result {
                let _ = thread_ready.send(Err(e));
            }
        });

        match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::Timeout)),
        }
    }

    /// Starts a WebSocket listener; accepted and subprotocol negotiated
    /// connections are delivered on the returned channel.
    pub fn listen(
        addr: &str,
        supported: &[SerializerType],
    ) -> (
        thread::JoinHandle<()>,
        mpsc::Receiver<(WebSocketTransport, SerializerType)>,
    ) {
        let (accept_tx, accept_rx) = mpsc::channel();
        let addr = addr.to_string();
        let supported: Vec<SerializerType> = supported.to_vec();
        let handle = thread::spawn(move || {
            let result = ws::listen(&addr[..], |out| ServerHandler {
                out,
                supported: supported.clone(),
                accept: accept_tx.clone(),
                serializer: None,
                bridge: None,
                shared: Shared::new(),
            });
            if let Err(e) = result {
                warn!("WebSocket listener on {} failed: {}", addr, e);
            }
        });
        (handle, accept_rx)
    }
}

impl Transport for WebSocketTransport {
    fn read(&self) -> WampResult<Vec<u8>> {
        match self.incoming.lock().unwrap().recv() {
            Ok(payload) => Ok(payload),
            Err(_) => {
                self.shared.mark_disconnected();
                Err(Error::new(ErrorKind::ConnectionLost))
            }
        }
    }

    fn write(&self, data: &[u8]) -> WampResult<()> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::ConnectionLost));
        }
        let message = if self.is_binary {
            WSMessage::Binary(data.to_vec())
        } else {
            match std::str::from_utf8(data) {
                Ok(text) => WSMessage::Text(text.to_string()),
                Err(_) => {
                    return Err(Error::new(ErrorKind::ProtocolViolation(
                        "json frames must be valid utf-8".to_string(),
                    )))
                }
            }
        };
        self.sender.lock().unwrap().send(message).map_err(|e| {
            debug!("WebSocket write failed: {}", e);
            self.shared.mark_disconnected();
            Error::new(ErrorKind::ConnectionLost)
        })
    }

    fn close(&self) {
        self.shared.mark_disconnected();
        let _ = self.sender.lock().unwrap().close(CloseCode::Normal);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn ping(&self, timeout: Duration) -> WampResult<f64> {
        let payload: Vec<u8> = {
            let mut rng = thread_rng();
            (0..8).map(|_| rng.gen()).collect()
        };
        let (sender, receiver) = mpsc::channel();
        self.shared
            .pending_pings
            .lock()
            .unwrap()
            .insert(payload.clone(), sender);

        let started = Instant::now();
        if let Err(e) = self.sender.lock().unwrap().ping(payload.clone()) {
            debug!("WebSocket ping failed: {}", e);
            self.shared.pending_pings.lock().unwrap().remove(&payload);
            self.shared.mark_disconnected();
            return Err(Error::new(ErrorKind::ConnectionLost));
        }

        match receiver.recv_timeout(timeout) {
            Ok(()) => Ok(started.elapsed().as_secs_f64() * 1000.0),
            Err(_) => {
                self.shared.pending_pings.lock().unwrap().remove(&payload);
                if self.is_connected() {
                    Err(Error::new(ErrorKind::Timeout))
                } else {
                    Err(Error::new(ErrorKind::ConnectionLost))
                }
            }
        }
    }
}

/// Forwards message payloads into the transport's incoming queue and
/// resolves ping waiters; shared between the client and server handlers.
fn bridge_message(bridge: &Option<mpsc::Sender<Vec<u8>>>, msg: WSMessage) {
    let payload = match msg {
        WSMessage::Text(text) => text.into_bytes(),
        WSMessage::Binary(data) => data,
    };
    if let Some(tx) = bridge {
        if tx.send(payload).is_err() {
            trace!("Transport reader is gone; dropping websocket payload");
        }
    }
}

fn bridge_frame(shared: &Arc<Shared>, frame: &Frame) {
    if frame.opcode() == OpCode::Pong {
        match shared
            .pending_pings
            .lock()
            .unwrap()
            .remove(&frame.payload().to_vec())
        {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => trace!("Unsolicited websocket pong"),
        }
    }
}

struct ClientHandler {
    out: Sender,
    offered: Vec<SerializerType>,
    ready: Option<mpsc::Sender<WampResult<(WebSocketTransport, SerializerType)>>>,
    bridge: Option<mpsc::Sender<Vec<u8>>>,
    shared: Arc<Shared>,
}

impl Handler for ClientHandler {
    fn build_request(&mut self, url: &Url) -> WSResult<Request> {
        trace!("Building websocket upgrade request");
        let mut request = Request::from_url(url)?;
        for serializer in &self.offered {
            request.add_protocol(serializer.to_str());
        }
        Ok(request)
    }

    fn on_open(&mut self, handshake: Handshake) -> WSResult<()> {
        let serializer = match handshake.response.protocol()? {
            Some(protocol) => match SerializerType::from_subprotocol(protocol) {
                Some(serializer) => serializer,
                None => {
                    return Err(WSError::new(
                        WSErrorKind::Protocol,
                        format!("Router picked unknown subprotocol {}", protocol),
                    ))
                }
            },
            None => {
                warn!("Router did not specify a subprotocol. Defaulting to wamp.2.json");
                SerializerType::Json
            }
        };

        let (bridge_tx, bridge_rx) = mpsc::channel();
        self.bridge = Some(bridge_tx);
        let transport = WebSocketTransport::new(
            self.out.clone(),
            bridge_rx,
            Arc::clone(&self.shared),
            serializer,
        );
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok((transport, serializer)));
        }
        Ok(())
    }

    fn on_message(&mut self, msg: WSMessage) -> WSResult<()> {
        bridge_message(&self.bridge, msg);
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> WSResult<Option<Frame>> {
        bridge_frame(&self.shared, &frame);
        Ok(Some(frame))
    }

    fn on_close(&mut self, _code: CloseCode, _reason: &str) {
        debug!("WebSocket connection closed");
        self.shared.mark_disconnected();
        self.bridge.take();
    }

    fn on_error(&mut self, err: WSError) {
        debug!("WebSocket connection errored: {}", err);
        self.shared.mark_disconnected();
        self.bridge.take();
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(Error::new(ErrorKind::WSError(err))));
        }
    }
}

struct ServerHandler {
    out: Sender,
    supported: Vec<SerializerType>,
    accept: mpsc::Sender<(WebSocketTransport, SerializerType)>,
    serializer: Option<SerializerType>,
    bridge: Option<mpsc::Sender<Vec<u8>>>,
    shared: Arc<Shared>,
}

impl Handler for ServerHandler {
    fn on_request(&mut self, request: &Request) -> WSResult<Response> {
        let mut response = Response::from_request(request)?;
        for protocol in request.protocols()? {
            if let Some(serializer) = SerializerType::from_subprotocol(protocol) {
                if self.supported.contains(&serializer) {
                    response.set_protocol(protocol);
                    self.serializer = Some(serializer);
                    return Ok(response);
                }
            }
        }
        Err(WSError::new(
            WSErrorKind::Protocol,
            "No supported wamp subprotocol was offered",
        ))
    }

    fn on_open(&mut self, _handshake: Handshake) -> WSResult<()> {
        let serializer = self.serializer.unwrap_or(SerializerType::Json);
        let (bridge_tx, bridge_rx) = mpsc::channel();
        self.bridge = Some(bridge_tx);
        let transport = WebSocketTransport::new(
            self.out.clone(),
            bridge_rx,
            Arc::clone(&self.shared),
            serializer,
        );
        if self.accept.send((transport, serializer)).is_err() {
            return Err(WSError::new(
                WSErrorKind::Internal,
                "Acceptor is no longer running",
            ));
        }
        Ok(())
    }

    fn on_message(&mut self, msg: WSMessage) -> WSResult<()> {
        bridge_message(&self.bridge, msg);
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> WSResult<Option<Frame>> {
        bridge_frame(&self.shared, &frame);
        Ok(Some(frame))
    }

    fn on_close(&mut self, _code: CloseCode, _reason: &str) {
        self.shared.mark_disconnected();
        self.bridge.take();
    }

    fn on_error(&mut self, err: WSError) {
        debug!("WebSocket connection errored: {}", err);
        self.shared.mark_disconnected();
        self.bridge.take();
    }
}
