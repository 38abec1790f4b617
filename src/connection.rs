//! # Connection State Machine
//!
//! A [`Connection`] is either a listener (owns a bound port, spawns one
//! peer connection per accept) or a peer (owns a connected port, exchanges
//! frames). Both start suspended: no frame is read and no peer is accepted
//! until [`Connection::resume`].
//!
//! ## Queues and sources
//!
//! Each connection serializes its work on dedicated contexts:
//!
//! * the **send queue** — a task draining send jobs in submission order;
//!   encoding and the socket write happen there, so frames hit the wire in
//!   the order they were submitted;
//! * the **receive source** — a task reading one frame at a time, gated by
//!   the connection lifecycle (suspended / active / cancelled); for a
//!   listener the same role is played by the acceptor task;
//! * the **target queue** — a caller-supplied [`SerialQueue`] (or the
//!   process default) where every event handler and reply handler runs,
//!   unless a reply specified its own queue.
//!
//! ## Correlation
//!
//! Every frame carries a 64-bit id. `send_message` honors an id pinned in
//! the outgoing dictionary under [`defaults::SEQUENCE_NUMBER_KEY`], then an
//! id remembered from the wire (which is how replies built with
//! [`Object::dictionary_create_reply`] route back to their request), and
//! otherwise mints one from the connection's counter. Reply-expecting sends
//! always mint. An incoming frame first resolves a matching pending call;
//! failing that it is delivered to the event handler.
//!
//! ## Teardown
//!
//! When the peer closes, or on [`Connection::cancel`], exactly once: every
//! pending call resolves with a `CONNECTION_INVALID` error value, the event
//! handler sees one `Event::Error`, the connection unlinks from its
//! parent's peer list, and the port is shut down. No pending-call handler
//! is ever left un-invoked. Sends on a cancelled connection fail
//! synchronously with [`IpcError::Cancelled`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::codec;
use crate::defaults;
use crate::error::{ErrorCode, IpcError};
use crate::object::{Kind, Object};
use crate::queue::SerialQueue;
use crate::transport::{Endpoint, ListenPort, Port, Transport, TransportFactory};

/// What a connection hands to its event handler, on the target queue.
#[derive(Debug)]
pub enum Event {
    /// A listener accepted a new peer.
    Connection(Connection),
    /// An unsolicited message arrived.
    Message(Object),
    /// The connection failed; the payload has kind [`Kind::Error`].
    Error(Object),
}

type EventHandler = Arc<dyn Fn(Event) + Send + Sync + 'static>;
type ReplyHandler = Box<dyn FnOnce(Object) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Suspended,
    Active,
    Cancelled,
}

struct PendingCall {
    id: u64,
    handler: ReplyHandler,
    queue: SerialQueue,
}

enum SendJob {
    Frame { message: Object, id: u64 },
    Barrier { job: Box<dyn FnOnce() + Send + 'static>, done: oneshot::Sender<()> },
}

struct Shared {
    listener: bool,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    port: Mutex<Option<Arc<Port>>>,
    listen_port: Mutex<Option<Arc<ListenPort>>>,
    parent: Mutex<Weak<Shared>>,
    handler: Mutex<Option<EventHandler>>,
    target_queue: Mutex<SerialQueue>,
    send_tx: mpsc::UnboundedSender<SendJob>,
    state_tx: watch::Sender<Lifecycle>,
    started: AtomicBool,
    torn_down: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<Vec<PendingCall>>,
    peers: Mutex<Vec<Connection>>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// A bidirectional message channel to one peer, or a listener producing
/// such channels. Cheap to clone; all clones are the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    fn new(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        listener: bool,
        target_queue: Option<SerialQueue>,
    ) -> Connection {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(Lifecycle::Suspended);

        let shared = Arc::new(Shared {
            listener,
            endpoint,
            transport,
            port: Mutex::new(None),
            listen_port: Mutex::new(None),
            parent: Mutex::new(Weak::new()),
            handler: Mutex::new(None),
            target_queue: Mutex::new(target_queue.unwrap_or_else(SerialQueue::default_queue)),
            send_tx,
            state_tx,
            started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            context: Mutex::new(None),
        });

        tokio::spawn(run_send_queue(Arc::downgrade(&shared), send_rx));
        Connection { shared }
    }

    /// Bind `endpoint` and produce a listener connection. The transport is
    /// chosen from the endpoint kind.
    pub async fn listener(
        endpoint: Endpoint,
        target_queue: Option<SerialQueue>,
    ) -> Result<Connection, IpcError> {
        let transport = TransportFactory::for_endpoint(&endpoint);
        Connection::listener_with_transport(transport, endpoint, target_queue).await
    }

    /// Bind `endpoint` on an explicitly supplied transport.
    pub async fn listener_with_transport(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        target_queue: Option<SerialQueue>,
    ) -> Result<Connection, IpcError> {
        let conn = Connection::new(transport.clone(), endpoint.clone(), true, target_queue);
        let listen_port = transport.listen(&endpoint).await?;
        debug!(endpoint = %listen_port.endpoint(), transport = transport.name(), "listener created");
        *conn.shared.listen_port.lock() = Some(Arc::new(listen_port));
        Ok(conn)
    }

    /// Connect to a listening `endpoint` and produce a client connection.
    pub async fn client(
        endpoint: Endpoint,
        target_queue: Option<SerialQueue>,
    ) -> Result<Connection, IpcError> {
        let transport = TransportFactory::for_endpoint(&endpoint);
        Connection::client_with_transport(transport, endpoint, target_queue).await
    }

    /// Connect to `endpoint` on an explicitly supplied transport.
    pub async fn client_with_transport(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        target_queue: Option<SerialQueue>,
    ) -> Result<Connection, IpcError> {
        let conn = Connection::new(transport.clone(), endpoint.clone(), false, target_queue);
        let port = transport.lookup(&endpoint).await?;
        debug!(endpoint = %endpoint, transport = transport.name(), "client connected");
        *conn.shared.port.lock() = Some(Arc::new(port));
        Ok(conn)
    }

    pub fn is_listener(&self) -> bool {
        self.shared.listener
    }

    /// The endpoint this connection is bound or connected to. For a
    /// listener this reports the concrete bound endpoint (useful with TCP
    /// port 0).
    pub fn local_endpoint(&self) -> Endpoint {
        if let Some(listen_port) = self.shared.listen_port.lock().as_ref() {
            return listen_port.endpoint().clone();
        }
        self.shared.endpoint.clone()
    }

    /// Install the event handler. It runs on the target queue for new
    /// peers (listener), unsolicited messages, and connection errors.
    pub fn set_event_handler(&self, handler: impl Fn(Event) + Send + Sync + 'static) {
        *self.shared.handler.lock() = Some(Arc::new(handler));
    }

    pub fn set_target_queue(&self, queue: SerialQueue) {
        *self.shared.target_queue.lock() = queue;
    }

    pub fn set_context(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.shared.context.lock() = Some(context);
    }

    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.context.lock().clone()
    }

    /// Bind the readiness source and start delivering. The first resume
    /// spawns the acceptor (listener) or reader (client) task; peers
    /// accepted by a listener come up already active, and resuming them
    /// again is a no-op. Resuming a cancelled connection is refused.
    pub fn resume(&self) {
        let shared = &self.shared;
        let current = *shared.state_tx.borrow();
        match current {
            Lifecycle::Cancelled => {
                warn!("resume on a cancelled connection ignored");
                return;
            }
            Lifecycle::Active => {
                debug!("resume on an active connection ignored");
                return;
            }
            Lifecycle::Suspended => {}
        }

        shared.state_tx.send_replace(Lifecycle::Active);
        if !shared.started.swap(true, Ordering::SeqCst) {
            if shared.listener {
                tokio::spawn(run_server_source(shared.clone()));
            } else if shared.parent.lock().upgrade().is_none() {
                tokio::spawn(run_recv_source(shared.clone()));
            }
        }
    }

    /// Stop delivering frames (or accepting peers). Takes effect at the
    /// next frame boundary; already-queued handler dispatches still run.
    pub fn suspend(&self) {
        self.shared.state_tx.send_if_modified(|state| {
            if *state == Lifecycle::Active {
                *state = Lifecycle::Suspended;
                true
            } else {
                false
            }
        });
    }

    /// Tear the connection down. Asynchronous: pending calls and the event
    /// handler observe `CONNECTION_INVALID` shortly after. Subsequent
    /// sends fail with [`IpcError::Cancelled`].
    pub fn cancel(&self) {
        let previous = self.shared.state_tx.send_replace(Lifecycle::Cancelled);
        if previous == Lifecycle::Cancelled {
            return;
        }
        debug!(endpoint = %self.shared.endpoint, "connection cancelled");

        if !self.shared.started.load(Ordering::SeqCst) {
            if self.shared.listener {
                *self.shared.listen_port.lock() = None;
            } else {
                // No source task exists yet to observe the cancel; run the
                // teardown from here.
                let shared = self.shared.clone();
                tokio::spawn(async move { teardown(shared).await });
            }
        }
    }

    /// Send `message` (a dictionary) without expecting a reply.
    ///
    /// The message is retained and handed to the send queue; encoding and
    /// the socket write happen there, preserving submission order. A
    /// failure on that path surfaces as a `CONNECTION_INVALID` error value
    /// on the handler path.
    pub fn send_message(&self, message: &Object) -> Result<(), IpcError> {
        self.ensure_sendable(message)?;

        let mut id = message.dictionary_get_uint64(defaults::SEQUENCE_NUMBER_KEY);
        if id == 0 {
            id = message.dictionary_get_uint64(defaults::LEGACY_SEQUENCE_NUMBER_KEY);
        }
        if id == 0 {
            id = message.wire_id();
        }
        if id == 0 {
            id = self.shared.mint_id();
        }
        self.enqueue_frame(message.clone(), id)
    }

    /// Send `message` and register `handler` for the reply.
    ///
    /// The handler is invoked exactly once — with the reply dictionary, or
    /// with a `CONNECTION_INVALID` error value if the send fails or the
    /// connection dies first. It runs on `reply_queue` when given, else on
    /// the target queue.
    pub fn send_message_with_reply(
        &self,
        message: &Object,
        reply_queue: Option<&SerialQueue>,
        handler: impl FnOnce(Object) + Send + 'static,
    ) -> Result<(), IpcError> {
        self.ensure_sendable(message)?;

        let id = self.shared.mint_id();
        let queue = reply_queue
            .cloned()
            .unwrap_or_else(|| self.shared.target_queue.lock().clone());
        self.shared.pending.lock().push(PendingCall {
            id,
            handler: Box::new(handler),
            queue,
        });

        // Teardown may have drained the pending list between the state
        // check and the push; resolve the straggler ourselves.
        if self.shared.torn_down.load(Ordering::SeqCst) {
            self.shared.resolve_pending_with_error(id);
            return Ok(());
        }

        self.enqueue_frame(message.clone(), id)
    }

    /// Send `message` and block the calling thread until the reply (or the
    /// connection-invalid error value) arrives.
    ///
    /// Must not be called from an async context; use
    /// [`Connection::send_message_with_reply_async`] there.
    pub fn send_message_with_reply_sync(&self, message: &Object) -> Result<Object, IpcError> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.send_message_with_reply(message, None, move |reply| {
            let _ = tx.send(reply);
        })?;
        rx.recv().map_err(|_| IpcError::Cancelled)
    }

    /// Async variant of [`Connection::send_message_with_reply_sync`].
    pub async fn send_message_with_reply_async(
        &self,
        message: &Object,
    ) -> Result<Object, IpcError> {
        let (tx, rx) = oneshot::channel();
        self.send_message_with_reply(message, None, move |reply| {
            let _ = tx.send(reply);
        })?;
        rx.await.map_err(|_| IpcError::Cancelled)
    }

    /// Run `barrier` on the send queue after every previously enqueued
    /// send has drained, blocking the calling thread until it ran.
    ///
    /// Must not be called from an async context.
    pub fn send_barrier(&self, barrier: impl FnOnce() + Send + 'static) {
        let (done_tx, done_rx) = oneshot::channel();
        let job = SendJob::Barrier {
            job: Box::new(barrier),
            done: done_tx,
        };
        if self.shared.send_tx.send(job).is_ok() {
            let _ = done_rx.blocking_recv();
        }
    }

    fn ensure_sendable(&self, message: &Object) -> Result<(), IpcError> {
        if message.kind() != Kind::Dictionary {
            return Err(IpcError::NotADictionary);
        }
        if *self.shared.state_tx.borrow() == Lifecycle::Cancelled {
            return Err(IpcError::Cancelled);
        }
        Ok(())
    }

    fn enqueue_frame(&self, message: Object, id: u64) -> Result<(), IpcError> {
        self.shared
            .send_tx
            .send(SendJob::Frame { message, id })
            .map_err(|_| IpcError::Cancelled)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.endpoint)
            .field("listener", &self.shared.listener)
            .finish()
    }
}

impl Shared {
    fn mint_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route `result` by correlation id: a matching pending call wins,
    /// otherwise the event handler sees it.
    fn dispatch_callback(&self, result: Object, id: u64) {
        let call = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|call| call.id == id)
                .map(|index| pending.remove(index))
        };

        if let Some(call) = call {
            let handler = call.handler;
            call.queue.dispatch_async(move || handler(result));
            return;
        }
        self.dispatch_event(result);
    }

    fn dispatch_event(&self, result: Object) {
        let Some(handler) = self.handler.lock().clone() else {
            debug!("no event handler installed; dropping delivery");
            return;
        };
        let queue = self.target_queue.lock().clone();
        let event = if result.kind() == Kind::Error {
            Event::Error(result)
        } else {
            Event::Message(result)
        };
        queue.dispatch_async(move || handler(event));
    }

    fn resolve_pending_with_error(&self, id: u64) {
        let call = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|call| call.id == id)
                .map(|index| pending.remove(index))
        };
        if let Some(call) = call {
            let err = Object::error(ErrorCode::ConnectionInvalid);
            let handler = call.handler;
            call.queue.dispatch_async(move || handler(err));
        }
    }

    fn fail_send(&self, id: u64) {
        let err = Object::error(ErrorCode::ConnectionInvalid);
        self.dispatch_callback(err, id);
    }

    /// Accept-path peer construction: the peer inherits the listener's
    /// target queue, comes up active, and its reader task starts at once.
    fn accept_peer(self: &Arc<Shared>, port: Port) {
        let peer = Connection::new(
            self.transport.clone(),
            self.endpoint.clone(),
            false,
            Some(self.target_queue.lock().clone()),
        );
        *peer.shared.port.lock() = Some(Arc::new(port));
        *peer.shared.parent.lock() = Arc::downgrade(self);
        peer.shared.started.store(true, Ordering::SeqCst);
        peer.shared.state_tx.send_replace(Lifecycle::Active);

        self.peers.lock().push(peer.clone());
        tokio::spawn(run_recv_source(peer.shared.clone()));

        let Some(handler) = self.handler.lock().clone() else {
            warn!("listener has no event handler; accepted peer is adrift");
            return;
        };
        let queue = self.target_queue.lock().clone();
        queue.dispatch_async(move || handler(Event::Connection(peer)));
    }
}

async fn run_send_queue(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<SendJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            SendJob::Frame { message, id } => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                process_send(&shared, message, id).await;
            }
            SendJob::Barrier { job, done } => {
                job();
                let _ = done.send(());
            }
        }
    }
}

async fn process_send(shared: &Arc<Shared>, message: Object, id: u64) {
    let frame = match codec::encode_frame(&message, id) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(id, error = %e, "encode failed");
            shared.fail_send(id);
            return;
        }
    };

    let port = shared.port.lock().clone();
    let Some(port) = port else {
        debug!(id, "send on a connection with no bound port");
        shared.fail_send(id);
        return;
    };

    if let Err(e) = port.send_frame(&frame).await {
        debug!(id, error = %e, "transport send failed");
        shared.fail_send(id);
    }
}

/// Resolves when the lifecycle reaches `Cancelled` (or the connection is
/// gone entirely).
async fn wait_cancelled(mut state_rx: watch::Receiver<Lifecycle>) {
    loop {
        let current = *state_rx.borrow_and_update();
        if current == Lifecycle::Cancelled {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// The client source: reads frames and routes them until the peer closes
/// or the connection is cancelled, then runs the teardown.
async fn run_recv_source(shared: Arc<Shared>) {
    let mut state_rx = shared.state_tx.subscribe();
    let port = shared.port.lock().clone();
    let Some(port) = port else {
        teardown(shared).await;
        return;
    };

    'source: loop {
        // Suspension gate: only read while active.
        loop {
            let current = *state_rx.borrow_and_update();
            match current {
                Lifecycle::Active => break,
                Lifecycle::Cancelled => break 'source,
                Lifecycle::Suspended => {
                    if state_rx.changed().await.is_err() {
                        break 'source;
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = wait_cancelled(state_rx.clone()) => break 'source,
            received = port.recv_frame() => match received {
                Ok(Some((header, payload))) => match codec::decode_payload(&payload) {
                    Ok(message) => {
                        message.set_wire_id(header.id);
                        shared.dispatch_callback(message, header.id);
                    }
                    Err(e) => debug!(id = header.id, error = %e, "dropping undecodable frame"),
                },
                Ok(None) => {
                    debug!("peer closed the connection");
                    break 'source;
                }
                Err(e) => {
                    debug!(error = %e, "receive failed");
                    break 'source;
                }
            },
        }
    }

    shared.state_tx.send_replace(Lifecycle::Cancelled);
    teardown(shared).await;
}

/// The server source: accepts peers until the listener is cancelled.
async fn run_server_source(shared: Arc<Shared>) {
    let mut state_rx = shared.state_tx.subscribe();
    let listen_port = shared.listen_port.lock().clone();
    let Some(listen_port) = listen_port else {
        error!("listener resumed without a bound port");
        return;
    };

    'source: loop {
        loop {
            let current = *state_rx.borrow_and_update();
            match current {
                Lifecycle::Active => break,
                Lifecycle::Cancelled => break 'source,
                Lifecycle::Suspended => {
                    if state_rx.changed().await.is_err() {
                        break 'source;
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = wait_cancelled(state_rx.clone()) => break 'source,
            accepted = listen_port.accept() => match accepted {
                Ok(port) => shared.accept_peer(port),
                // Accept failures are transient (fd pressure, aborted
                // handshake); keep the listener alive.
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }

    shared.state_tx.send_replace(Lifecycle::Cancelled);
    *shared.listen_port.lock() = None;
    debug!(endpoint = %shared.endpoint, "listener shut down");
}

/// One-shot teardown: resolve pending calls, signal the handler, unlink
/// from the parent, release the port.
async fn teardown(shared: Arc<Shared>) {
    if shared.torn_down.swap(true, Ordering::SeqCst) {
        return;
    }
    shared.state_tx.send_replace(Lifecycle::Cancelled);

    let port = shared.port.lock().clone();
    if let Some(port) = port {
        port.shutdown().await;
    }

    let calls: Vec<PendingCall> = std::mem::take(&mut *shared.pending.lock());
    for call in calls {
        let err = Object::error(ErrorCode::ConnectionInvalid);
        let handler = call.handler;
        call.queue.dispatch_async(move || handler(err));
    }

    let parent = shared.parent.lock().upgrade();
    let queue = match &parent {
        Some(parent) => parent.target_queue.lock().clone(),
        None => shared.target_queue.lock().clone(),
    };
    if let Some(handler) = shared.handler.lock().clone() {
        let err = Object::error(ErrorCode::ConnectionInvalid);
        queue.dispatch_async(move || handler(Event::Error(err)));
    }

    if let Some(parent) = parent {
        parent
            .peers
            .lock()
            .retain(|peer| !Arc::ptr_eq(&peer.shared, &shared));
    }

    *shared.port.lock() = None;
    debug!(endpoint = %shared.endpoint, "connection torn down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_dictionary_messages_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = Endpoint::unix(dir.path().join("reject.sock"));

        let _listener = Connection::listener(endpoint.clone(), None)
            .await
            .expect("listener");
        let client = Connection::client(endpoint, None).await.expect("client");

        let err = client
            .send_message(&Object::string("not a dictionary"))
            .expect_err("non-dictionary send");
        assert!(matches!(err, IpcError::NotADictionary));
    }

    #[tokio::test]
    async fn sends_after_cancel_fail_synchronously() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = Endpoint::unix(dir.path().join("cancelled.sock"));

        let _listener = Connection::listener(endpoint.clone(), None)
            .await
            .expect("listener");
        let client = Connection::client(endpoint, None).await.expect("client");

        client.cancel();
        let message = Object::dictionary();
        message.dictionary_set_uint64("n", 1);
        let err = client.send_message(&message).expect_err("send after cancel");
        assert!(matches!(err, IpcError::Cancelled));
    }

    #[tokio::test]
    async fn minted_ids_start_at_one_and_increase() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = Endpoint::unix(dir.path().join("ids.sock"));

        let _listener = Connection::listener(endpoint.clone(), None)
            .await
            .expect("listener");
        let client = Connection::client(endpoint, None).await.expect("client");

        assert_eq!(client.shared.mint_id(), 1);
        assert_eq!(client.shared.mint_id(), 2);
        assert_eq!(client.shared.mint_id(), 3);
    }
}
