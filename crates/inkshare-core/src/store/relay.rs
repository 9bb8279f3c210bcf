//! Realtime store backed by the relay server.
//!
//! A background thread owns the WebSocket; store calls talk to it over
//! channels. Values read or written are cached per path. A `get` registers
//! a reply slot and returns a future that the socket thread completes when
//! the server answers, the connection drops, or [`REQUEST_TIMEOUT`] passes.

use super::{BoxFuture, ChannelSubscription, KeyValueStore, StoreError, StoreEvent, StoreResult, Subscription};
use crate::protocol::{CANVAS_PATH, ClientMessage, ServerMessage};
use crate::snapshot::CANVAS_KEY;
use std::collections::HashMap;
use std::future::Future;
use std::net::TcpStream;
use std::pin::Pin;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tungstenite::{Message, WebSocket};
use url::Url;
use uuid::Uuid;

/// How long `get` waits for the server.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket read timeout once connected, so commands and deadlines are serviced promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Relay path for a store key. The canvas key lives under the `canvas` path.
pub fn path_for_key(key: &str) -> String {
    if key == CANVAS_KEY {
        CANVAS_PATH.to_string()
    } else {
        key.to_string()
    }
}

/// Commands sent to the WebSocket thread.
enum RelayCommand {
    Send(String),
    Close,
}

struct Watcher {
    path: String,
    key: String,
    tx: Sender<StoreEvent>,
}

#[derive(Default)]
struct SlotState {
    result: Option<StoreResult<Option<String>>>,
    completed: bool,
    waker: Option<Waker>,
}

/// Where the socket thread leaves the answer to one `get`.
struct ReplySlot {
    deadline: Instant,
    state: Mutex<SlotState>,
}

impl ReplySlot {
    fn new(deadline: Instant) -> Arc<Self> {
        Arc::new(Self {
            deadline,
            state: Mutex::new(SlotState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the result and wake the waiting task. Only the first call counts.
    fn complete(&self, result: StoreResult<Option<String>>) {
        let waker = {
            let mut state = self.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Resolves once the slot is completed.
struct PendingGet {
    slot: Arc<ReplySlot>,
}

impl Future for PendingGet {
    type Output = StoreResult<Option<String>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.lock();
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        if state.completed {
            return Poll::Ready(Err(StoreError::Other("Reply already taken".to_string())));
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[derive(Default)]
struct PendingGets {
    /// Set once the socket thread has stopped; no new slots are accepted.
    closed: bool,
    slots: HashMap<String, Vec<Arc<ReplySlot>>>,
}

struct RelayShared {
    state: Mutex<ConnectionState>,
    cache: Mutex<HashMap<String, Option<String>>>,
    pending: Mutex<PendingGets>,
    watchers: Mutex<Vec<Watcher>>,
}

impl RelayShared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, PendingGets> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a reply slot for `path`, failing when the connection is gone.
    fn register(&self, path: &str, deadline: Instant) -> StoreResult<Arc<ReplySlot>> {
        let mut pending = self.pending();
        if pending.closed {
            return Err(StoreError::Connection("Relay connection closed".to_string()));
        }
        let slot = ReplySlot::new(deadline);
        pending
            .slots
            .entry(path.to_string())
            .or_default()
            .push(slot.clone());
        Ok(slot)
    }

    fn handle(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Value { path, value } => {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(path.clone(), value.clone());
                let waiters = self.pending().slots.remove(&path).unwrap_or_default();
                for slot in waiters {
                    slot.complete(Ok(value.clone()));
                }
            }
            ServerMessage::Changed { path, value, from } => {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(path.clone(), value.clone());
                let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
                watchers.retain(|w| {
                    if w.path != path {
                        return true;
                    }
                    w.tx
                        .send(StoreEvent {
                            key: w.key.clone(),
                            value: value.clone(),
                            origin: from.clone(),
                        })
                        .is_ok()
                });
            }
            ServerMessage::Error { message } => {
                log::warn!("Relay server error: {}", message);
            }
        }
    }

    /// Fail every `get` whose deadline has passed.
    fn expire_pending(&self, now: Instant) {
        let mut expired = Vec::new();
        {
            let mut pending = self.pending();
            pending.slots.retain(|path, slots| {
                slots.retain(|slot| {
                    if slot.deadline <= now {
                        expired.push((path.clone(), slot.clone()));
                        false
                    } else {
                        true
                    }
                });
                !slots.is_empty()
            });
        }
        for (path, slot) in expired {
            log::warn!("Relay get for {} timed out", path);
            slot.complete(Err(StoreError::Connection(format!(
                "Timed out waiting for {}",
                path
            ))));
        }
    }

    /// Fail every outstanding `get` and refuse new ones.
    fn abandon_pending(&self) {
        let slots = {
            let mut pending = self.pending();
            pending.closed = true;
            std::mem::take(&mut pending.slots)
        };
        for slot in slots.into_values().flatten() {
            slot.complete(Err(StoreError::Connection(
                "Relay connection closed".to_string(),
            )));
        }
    }
}

/// Store client for the realtime relay server.
pub struct RelayStore {
    origin: String,
    timeout: Duration,
    cmd_tx: Sender<RelayCommand>,
    shared: Arc<RelayShared>,
    _thread: Option<JoinHandle<()>>,
}

impl RelayStore {
    /// Connect to a relay server at a `ws://` URL.
    pub fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_timeout(url, REQUEST_TIMEOUT)
    }

    /// Connect with a custom timeout for the handshake and for each `get`.
    pub fn connect_with_timeout(url: &str, timeout: Duration) -> StoreResult<Self> {
        // Validate URL
        let parsed_url =
            Url::parse(url).map_err(|e| StoreError::Connection(format!("Invalid URL: {}", e)))?;
        if parsed_url.scheme() != "ws" {
            return Err(StoreError::Connection(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed_url.scheme()
            )));
        }

        let shared = Arc::new(RelayShared {
            state: Mutex::new(ConnectionState::Connecting),
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingGets::default()),
            watchers: Mutex::new(Vec::new()),
        });
        let (cmd_tx, cmd_rx) = channel::<RelayCommand>();

        let thread_shared = shared.clone();
        let handle = thread::spawn(move || run_socket(&parsed_url, timeout, cmd_rx, &thread_shared));

        Ok(Self {
            origin: Uuid::new_v4().to_string(),
            timeout,
            cmd_tx,
            shared,
            _thread: Some(handle),
        })
    }

    /// Get current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Last value seen for a key without contacting the server.
    pub fn cached(&self, key: &str) -> Option<String> {
        self.shared
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path_for_key(key))
            .cloned()
            .flatten()
    }

    fn send(&self, msg: &ClientMessage) -> StoreResult<()> {
        let json =
            serde_json::to_string(msg).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.cmd_tx
            .send(RelayCommand::Send(json))
            .map_err(|_| StoreError::Connection("Relay connection closed".to_string()))
    }

    fn ensure_usable(&self) -> StoreResult<()> {
        match self.state() {
            ConnectionState::Error | ConnectionState::Disconnected => Err(StoreError::Connection(
                "Not connected to relay server".to_string(),
            )),
            ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
        }
    }
}

impl KeyValueStore for RelayStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StoreResult<Option<String>>> {
        let path = path_for_key(key);
        Box::pin(async move {
            self.ensure_usable()?;
            let slot = self.shared.register(&path, Instant::now() + self.timeout)?;
            self.send(&ClientMessage::Get { path })?;
            PendingGet { slot }.await
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, StoreResult<()>> {
        let path = path_for_key(key);
        let value = value.to_string();
        Box::pin(async move {
            self.ensure_usable()?;
            self.send(&ClientMessage::Set {
                path: path.clone(),
                value: value.clone(),
            })?;
            self.shared
                .cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path, Some(value));
            Ok(())
        })
    }

    fn subscribe(&self, key: &str) -> StoreResult<Box<dyn Subscription>> {
        let path = path_for_key(key);
        let (tx, rx) = channel();
        self.shared
            .watchers
            .lock()
            .map_err(|e| StoreError::Other(format!("Lock error: {}", e)))?
            .push(Watcher {
                path: path.clone(),
                key: key.to_string(),
                tx,
            });
        self.send(&ClientMessage::Subscribe { path })?;
        Ok(Box::new(ChannelSubscription::new(rx)))
    }

    fn origin(&self) -> &str {
        &self.origin
    }
}

impl Drop for RelayStore {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(RelayCommand::Close);
    }
}

/// Open the TCP connection and run the WebSocket handshake, both bounded by `timeout`.
fn open_socket(url: &Url, timeout: Duration) -> Result<WebSocket<TcpStream>, String> {
    let addrs = url
        .socket_addrs(|| Some(80))
        .map_err(|e| format!("Failed to resolve {}: {}", url, e))?;

    let mut last_error = format!("No address for {}", url);
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(e) => last_error = format!("Failed to connect to {}: {}", addr, e),
        }
    }
    let stream = stream.ok_or(last_error)?;

    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| format!("Failed to configure socket: {}", e))?;

    let (mut socket, response) =
        tungstenite::client(url.as_str(), stream).map_err(|e| format!("Handshake failed: {}", e))?;
    log::info!("Relay connected, status: {}", response.status());

    socket
        .get_mut()
        .set_read_timeout(Some(POLL_INTERVAL))
        .map_err(|e| format!("Failed to configure socket: {}", e))?;
    Ok(socket)
}

fn run_socket(url: &Url, timeout: Duration, cmd_rx: Receiver<RelayCommand>, shared: &RelayShared) {
    log::info!("Relay thread: connecting to {}", url);

    let mut socket = match open_socket(url, timeout) {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("Relay connection failed: {}", e);
            shared.set_state(ConnectionState::Error);
            shared.abandon_pending();
            return;
        }
    };
    shared.set_state(ConnectionState::Connected);

    loop {
        loop {
            match cmd_rx.try_recv() {
                Ok(RelayCommand::Send(msg)) => {
                    log::debug!("Relay sending: {}", &msg[..msg.len().min(100)]);
                    if let Err(e) = socket.send(Message::Text(msg)) {
                        log::error!("Relay send error: {}", e);
                        shared.set_state(ConnectionState::Error);
                        shared.abandon_pending();
                        return;
                    }
                }
                Ok(RelayCommand::Close) | Err(TryRecvError::Disconnected) => {
                    log::info!("Relay close requested");
                    let _ = socket.close(None);
                    shared.set_state(ConnectionState::Disconnected);
                    shared.abandon_pending();
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(txt)) => match serde_json::from_str::<ServerMessage>(&txt) {
                Ok(msg) => shared.handle(msg),
                Err(e) => log::warn!("Failed to parse relay message: {}", e),
            },
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                log::info!("Relay received close frame");
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::error!("Relay read error: {}", e);
                break;
            }
        }

        shared.expire_pending(Instant::now());
    }

    log::info!("Relay thread exiting");
    shared.set_state(ConnectionState::Disconnected);
    shared.abandon_pending();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::block_on;
    use std::net::TcpListener;

    #[test]
    fn test_path_for_key() {
        assert_eq!(path_for_key(CANVAS_KEY), "canvas");
        assert_eq!(path_for_key("users/ada"), "users/ada");
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        assert!(matches!(
            RelayStore::connect("http://localhost:3030/ws"),
            Err(StoreError::Connection(_))
        ));
        assert!(RelayStore::connect("wss://localhost:3030/ws").is_err());
        assert!(RelayStore::connect("not a url").is_err());
    }

    #[test]
    fn test_unreachable_server_fails_get() {
        // Grab a free port, then close it so the connection is refused.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let store = RelayStore::connect_with_timeout(
            &format!("ws://127.0.0.1:{}/ws", port),
            Duration::from_millis(500),
        )
        .unwrap();

        let result = block_on(store.get(CANVAS_KEY));
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[test]
    fn test_get_is_pending_during_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accept the connection but never answer the upgrade request.
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let store = RelayStore::connect_with_timeout(
            &format!("ws://127.0.0.1:{}/ws", port),
            Duration::from_millis(200),
        )
        .unwrap();

        let mut get = store.get(CANVAS_KEY);
        let mut cx = Context::from_waker(Waker::noop());
        assert!(get.as_mut().poll(&mut cx).is_pending());

        // The handshake times out and the pending get fails with it.
        assert!(matches!(block_on(get), Err(StoreError::Connection(_))));
        assert_eq!(store.state(), ConnectionState::Error);
        server.join().unwrap();
    }

    #[test]
    fn test_get_times_out_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // Complete the handshake, then ignore every request.
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            while let Ok(msg) = ws.read() {
                if msg.is_close() {
                    break;
                }
            }
        });

        let store = RelayStore::connect_with_timeout(
            &format!("ws://127.0.0.1:{}/ws", port),
            Duration::from_millis(300),
        )
        .unwrap();

        let started = Instant::now();
        let result = block_on(store.get(CANVAS_KEY));
        assert!(matches!(result, Err(StoreError::Connection(ref m)) if m.contains("Timed out")));
        assert!(started.elapsed() >= Duration::from_millis(300));
        // The connection itself is still up.
        assert!(store.is_connected());

        drop(store);
        server.join().unwrap();
    }

    #[test]
    fn test_get_and_subscribe_against_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            let mut replies = 0;
            while replies < 2 {
                let Ok(Message::Text(txt)) = ws.read() else { break };
                let reply = match serde_json::from_str::<ClientMessage>(&txt).unwrap() {
                    ClientMessage::Get { path } => ServerMessage::Value {
                        path,
                        value: Some("stored".to_string()),
                    },
                    ClientMessage::Subscribe { path } => ServerMessage::Changed {
                        path,
                        value: Some("remote".to_string()),
                        from: "peer-2".to_string(),
                    },
                    ClientMessage::Set { .. } => continue,
                };
                ws.send(Message::Text(serde_json::to_string(&reply).unwrap())).unwrap();
                replies += 1;
            }
        });

        let store = RelayStore::connect(&format!("ws://127.0.0.1:{}/ws", port)).unwrap();
        assert_eq!(
            block_on(store.get(CANVAS_KEY)).unwrap().as_deref(),
            Some("stored")
        );

        let mut sub = store.subscribe(CANVAS_KEY).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.is_empty() && Instant::now() < deadline {
            events = sub.poll_events();
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, CANVAS_KEY);
        assert_eq!(events[0].value.as_deref(), Some("remote"));
        assert_eq!(events[0].origin, "peer-2");
        assert_eq!(store.cached(CANVAS_KEY).as_deref(), Some("remote"));

        server.join().unwrap();
    }
}
