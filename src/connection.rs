//! Connection: one protocol engine over one duplex stream.
//!
//! A [`Connection`] owns exactly one reader task and one writer task for its
//! stream, assigns outgoing message numbers, tracks pending responses, and
//! routes finished incoming requests through its [`Dispatcher`] (falling
//! back to the default receive handler).
//!
//! The stream itself is an external collaborator: anything implementing
//! `AsyncRead + AsyncWrite` will do: a TCP socket, a TLS session, a Unix
//! socket, or an in-memory duplex pipe in tests. Establishing it, including
//! any TLS negotiation, is the caller's concern.
//!
//! # Example
//!
//! ```ignore
//! use framewire::{Connection, Request, Response};
//! use framewire::dispatcher::Outcome;
//!
//! let conn = Connection::builder()
//!     .default_handler(|request, ctx| async move {
//!         ctx.respond(Response::with_body(request.body().to_vec())).await?;
//!         Ok(Outcome::Responded)
//!     })
//!     .open(stream);
//!
//! let mut request = Request::with_body(b"hello".to_vec());
//! request.set_profile("echo");
//! let handle = conn.send(request).await?.expect("reply expected");
//! let response = handle.response().await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::AbortHandle;

use crate::dispatcher::{into_handler, Dispatcher, Handler, HandlerResult};
use crate::error::{FramewireError, Result};
use crate::message::{IncomingRequest, IncomingResponse, ReplyContext, Request, ResponseHandle};
use crate::properties::Properties;
use crate::protocol::{FrameKind, DEFAULT_MAX_FRAME_PAYLOAD};
use crate::reader::{reader_loop, PendingResponse};
use crate::writer::{spawn_writer_task, OutgoingMessage, WriterConfig, WriterHandle};

/// Default maximum concurrent request handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default cap on concurrently-assembling incoming messages.
pub const DEFAULT_MAX_INFLIGHT_INCOMING: usize = 1024;

/// Default cap on a decompressed message body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, stream not yet attached.
    Idle,
    /// Reader and writer are running; sends are accepted.
    Open,
    /// Close requested; outstanding work is being aborted.
    Closing,
    /// Terminal. All pending responses have been resolved.
    Closed,
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum payload bytes per frame.
    pub max_frame_payload: usize,
    /// Maximum encoded property block size (must fit the first frame).
    pub max_properties_size: usize,
    /// Maximum decompressed body size.
    pub max_message_size: usize,
    /// Urgent-lane turns per normal-lane turn in the writer.
    pub urgent_weight: u32,
    /// Writer enqueue channel capacity.
    pub channel_capacity: usize,
    /// Maximum concurrently running request handlers.
    pub max_concurrent_handlers: usize,
    /// Maximum concurrently-assembling incoming messages before new
    /// multi-frame requests are shed with a busy error.
    pub max_inflight_incoming: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            max_properties_size: DEFAULT_MAX_FRAME_PAYLOAD,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            urgent_weight: crate::writer::DEFAULT_URGENT_WEIGHT,
            channel_capacity: crate::writer::DEFAULT_CHANNEL_CAPACITY,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            max_inflight_incoming: DEFAULT_MAX_INFLIGHT_INCOMING,
        }
    }
}

type OpenedListener = Arc<dyn Fn() + Send + Sync>;
type ClosedListener = Arc<dyn Fn() + Send + Sync>;
type FailedListener = Arc<dyn Fn(&FramewireError) + Send + Sync>;
type RequestListener = Arc<dyn Fn(&IncomingRequest) + Send + Sync>;
type ResponseListener = Arc<dyn Fn(&IncomingResponse) + Send + Sync>;
type PropertiesListener = Arc<dyn Fn(u32, &Properties) + Send + Sync>;

/// Typed listener sets, one per connection event. Listeners are invoked
/// synchronously from the owning task.
#[derive(Default)]
pub(crate) struct Listeners {
    opened: Mutex<Vec<OpenedListener>>,
    closed: Mutex<Vec<ClosedListener>>,
    failed: Mutex<Vec<FailedListener>>,
    request_received: Mutex<Vec<RequestListener>>,
    response_received: Mutex<Vec<ResponseListener>>,
    properties_available: Mutex<Vec<PropertiesListener>>,
}

impl Listeners {
    pub(crate) fn notify_opened(&self) {
        for listener in self.snapshot(&self.opened) {
            listener();
        }
    }

    pub(crate) fn notify_closed(&self) {
        for listener in self.snapshot(&self.closed) {
            listener();
        }
    }

    pub(crate) fn notify_failed(&self, error: &FramewireError) {
        for listener in self.snapshot(&self.failed) {
            listener(error);
        }
    }

    pub(crate) fn notify_request_received(&self, request: &IncomingRequest) {
        for listener in self.snapshot(&self.request_received) {
            listener(request);
        }
    }

    pub(crate) fn notify_response_received(&self, response: &IncomingResponse) {
        for listener in self.snapshot(&self.response_received) {
            listener(response);
        }
    }

    pub(crate) fn notify_properties_available(&self, number: u32, properties: &Properties) {
        for listener in self.snapshot(&self.properties_available) {
            listener(number, properties);
        }
    }

    fn snapshot<T: Clone>(&self, list: &Mutex<Vec<T>>) -> Vec<T> {
        list.lock().unwrap().clone()
    }
}

/// State shared between the connection handle and its reader/writer tasks.
pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) next_number: AtomicU32,
    pub(crate) pending: Mutex<HashMap<u32, PendingResponse>>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) default_handler: RwLock<Option<Handler>>,
    pub(crate) listeners: Listeners,
    pub(crate) handler_semaphore: Arc<Semaphore>,
    abort_handles: Mutex<Vec<AbortHandle>>,
    closed_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Shared {
    fn new(
        config: ConnectionConfig,
        dispatcher: Arc<Dispatcher>,
        default_handler: Option<Handler>,
        listeners: Listeners,
        closed_tx: oneshot::Sender<()>,
    ) -> Self {
        let handler_semaphore = Arc::new(Semaphore::new(config.max_concurrent_handlers));
        Self {
            config,
            state: Mutex::new(ConnectionState::Idle),
            next_number: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            dispatcher,
            default_handler: RwLock::new(default_handler),
            listeners,
            handler_semaphore,
            abort_handles: Mutex::new(Vec::new()),
            closed_tx: Mutex::new(Some(closed_tx)),
        }
    }

    /// Transition to `Closed` exactly once: abort the reader/writer tasks,
    /// resolve every pending response with `Disconnected`, and notify
    /// listeners. Idempotent.
    pub(crate) fn finish_close(shared: &Arc<Shared>, error: Option<FramewireError>) {
        {
            let mut state = shared.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        for handle in shared.abort_handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        if let Some(error) = &error {
            shared.listeners.notify_failed(error);
        }

        let drained: Vec<PendingResponse> = {
            let mut pending = shared.pending.lock().unwrap();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                count = drained.len(),
                "resolving pending responses as disconnected"
            );
        }
        for entry in drained {
            entry.fail_disconnected();
        }

        shared.listeners.notify_closed();

        if let Some(tx) = shared.closed_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// Builder for configuring and opening a [`Connection`].
///
/// Use the fluent API to set limits, register listeners and handlers, then
/// call [`ConnectionBuilder::open`] with the established stream.
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    dispatcher: Option<Arc<Dispatcher>>,
    default_handler: Option<Handler>,
    listeners: Listeners,
}

impl ConnectionBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            dispatcher: None,
            default_handler: None,
            listeners: Listeners::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum payload bytes per frame.
    pub fn max_frame_payload(mut self, bytes: usize) -> Self {
        self.config.max_frame_payload = bytes.min(u16::MAX as usize);
        self
    }

    /// Set the maximum encoded property block size.
    pub fn max_properties_size(mut self, bytes: usize) -> Self {
        self.config.max_properties_size = bytes.min(u16::MAX as usize);
        self
    }

    /// Set the maximum decompressed body size.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// Set the urgent-lane weight (urgent turns per normal turn).
    pub fn urgent_weight(mut self, weight: u32) -> Self {
        self.config.urgent_weight = weight;
        self
    }

    /// Set the maximum concurrently running request handlers.
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the cap on concurrently-assembling incoming messages.
    pub fn max_inflight_incoming(mut self, limit: usize) -> Self {
        self.config.max_inflight_incoming = limit;
        self
    }

    /// Use an existing dispatcher (e.g. one chained to a shared parent).
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the default receive handler, invoked for requests no dispatcher
    /// rule matches. If it neither responds nor defers, an implicit empty
    /// success response is sent when it returns.
    pub fn default_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(IncomingRequest, ReplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.default_handler = Some(into_handler(handler));
        self
    }

    /// Register a listener for the opened event.
    pub fn on_opened(self, listener: impl Fn() + Send + Sync + 'static) -> Self {
        self.listeners.opened.lock().unwrap().push(Arc::new(listener));
        self
    }

    /// Register a listener for the closed event.
    pub fn on_closed(self, listener: impl Fn() + Send + Sync + 'static) -> Self {
        self.listeners.closed.lock().unwrap().push(Arc::new(listener));
        self
    }

    /// Register a listener for connection failure.
    pub fn on_failed(
        self,
        listener: impl Fn(&FramewireError) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.failed.lock().unwrap().push(Arc::new(listener));
        self
    }

    /// Register a listener invoked for every completed incoming request,
    /// before dispatch.
    pub fn on_request_received(
        self,
        listener: impl Fn(&IncomingRequest) + Send + Sync + 'static,
    ) -> Self {
        self.listeners
            .request_received
            .lock()
            .unwrap()
            .push(Arc::new(listener));
        self
    }

    /// Register a listener invoked for every completed incoming response.
    pub fn on_response_received(
        self,
        listener: impl Fn(&IncomingResponse) + Send + Sync + 'static,
    ) -> Self {
        self.listeners
            .response_received
            .lock()
            .unwrap()
            .push(Arc::new(listener));
        self
    }

    /// Register a listener invoked as soon as an incoming request's
    /// properties have arrived, before its body completes.
    pub fn on_properties_available(
        self,
        listener: impl Fn(u32, &Properties) + Send + Sync + 'static,
    ) -> Self {
        self.listeners
            .properties_available
            .lock()
            .unwrap()
            .push(Arc::new(listener));
        self
    }

    /// Attach the established stream and start the reader and writer tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn open<S>(self, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(Dispatcher::new()));
        let (closed_tx, closed_rx) = oneshot::channel();
        let shared = Arc::new(Shared::new(
            self.config.clone(),
            dispatcher,
            self.default_handler,
            self.listeners,
            closed_tx,
        ));

        let writer_config = WriterConfig {
            max_frame_payload: self.config.max_frame_payload,
            urgent_weight: self.config.urgent_weight,
            channel_capacity: self.config.channel_capacity,
        };
        let (writer, writer_task) = spawn_writer_task(write_half, writer_config);

        *shared.state.lock().unwrap() = ConnectionState::Open;
        shared.listeners.notify_opened();

        let reader_task = {
            let shared = shared.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                match reader_loop(read_half, shared.clone(), writer).await {
                    Ok(()) => {
                        tracing::debug!("stream closed by peer");
                        Shared::finish_close(&shared, None);
                    }
                    Err(e) => {
                        tracing::error!("read loop failed: {}", e);
                        Shared::finish_close(&shared, Some(e));
                    }
                }
            })
        };

        {
            let mut handles = shared.abort_handles.lock().unwrap();
            handles.push(reader_task.abort_handle());
            handles.push(writer_task.abort_handle());
        }

        Connection {
            shared,
            writer,
            closed_rx,
        }
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection to a peer speaking this protocol over one duplex stream.
pub struct Connection {
    shared: Arc<Shared>,
    writer: WriterHandle,
    closed_rx: oneshot::Receiver<()>,
}

impl Connection {
    /// Create a connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Open a connection over `stream` with default configuration.
    pub fn open<S>(stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        ConnectionBuilder::new().open(stream)
    }

    /// The connection's current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// The connection's dispatcher, for registering or removing rules.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    /// Replace the default receive handler.
    pub fn set_default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(IncomingRequest, ReplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        *self.shared.default_handler.write().unwrap() = Some(into_handler(handler));
    }

    /// Number of sent requests still waiting for a response.
    pub fn pending_responses(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Send a request.
    ///
    /// Assigns the next sequence number, registers a pending-response entry
    /// (unless the request is noReply) and enqueues the message onto the
    /// writer. Never blocks beyond enqueueing; the returned
    /// [`ResponseHandle`] completes asynchronously. Returns `None` for
    /// noReply requests, which have no response slot at all.
    pub async fn send(&self, request: Request) -> Result<Option<ResponseHandle>> {
        if self.state() != ConnectionState::Open {
            return Err(FramewireError::NotOpen);
        }

        let number = self.shared.next_number.fetch_add(1, Ordering::Relaxed);
        let msg = OutgoingMessage::encode(
            number,
            FrameKind::Msg,
            &request.properties,
            request.body,
            request.compressed,
            request.urgent,
            request.no_reply,
            self.shared.config.max_frame_payload,
            self.shared.config.max_properties_size,
        )?;

        let handle = if request.no_reply {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.shared
                .pending
                .lock()
                .unwrap()
                .insert(number, PendingResponse::new(tx));
            Some(ResponseHandle::new(number, rx))
        };

        if let Err(e) = self.writer.enqueue(msg).await {
            self.shared.pending.lock().unwrap().remove(&number);
            return Err(e);
        }

        tracing::debug!(number, urgent = request.urgent, "request enqueued");
        Ok(handle)
    }

    /// Close the connection.
    ///
    /// Aborts the reader and writer, cancels all outstanding sends, and
    /// resolves every pending response with
    /// [`FramewireError::Disconnected`]. Idempotent; no response can arrive
    /// afterwards.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                ConnectionState::Closed => return,
                _ => *state = ConnectionState::Closing,
            }
        }
        Shared::finish_close(&self.shared, None);
    }

    /// Wait until the connection reaches `Closed`, whether by peer EOF,
    /// stream failure, or an explicit [`Connection::close`].
    pub async fn wait_for_close(self) {
        let _ = self.closed_rx.await;
    }
}
