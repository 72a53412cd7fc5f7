//! Tunnel engine
//!
//! Owns every outbound stream of one session and runs the session's only
//! control loop:
//!
//! ```text
//! loop {
//!     exchange with session store   (inbound in, outbound out, heartbeat)
//!     stop if not running
//!     apply inbound messages        (connect / sync)
//!     bounded wait on all sockets   (connect completion, readability)
//!     turn socket events into outbound messages
//! }
//! ```

use super::{ReadOutcome, StreamState, TunnelError, TunnelStream};
use crate::config::TunnelConfig;
use crate::protocol::{Message, StreamId, CONNECTED, FAILURE_CODE, READ_CHUNK_SIZE};
use crate::session::{Generation, SessionId, SessionStore};
use crate::transport::Resolver;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Engine timing and sizing
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes taken from a socket per read
    pub read_chunk_size: usize,
    /// Upper bound on one multiplex wait
    pub poll_interval: Duration,
    /// Sleep when there are no streams at all
    pub idle_backoff: Duration,
    /// Upper bound on delivering one inbound sync payload
    pub write_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: READ_CHUNK_SIZE,
            poll_interval: Duration::from_secs(1),
            idle_backoff: Duration::from_secs(1),
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&TunnelConfig> for EngineConfig {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            read_chunk_size: config.read_chunk_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }
}

/// Sockets reported by one multiplex wait
#[derive(Default)]
struct Readiness {
    /// Pending streams whose connect finished, with the outcome
    connected: Vec<(StreamId, io::Result<()>)>,
    /// Open streams with something to read
    readable: Vec<(StreamId, io::Result<()>)>,
}

impl Readiness {
    fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.readable.is_empty()
    }
}

/// Socket multiplexer for one session
pub struct TunnelEngine {
    session: SessionId,
    /// Incarnation of the session this engine was started for
    generation: Generation,
    store: Arc<dyn SessionStore>,
    resolver: Arc<dyn Resolver>,
    config: EngineConfig,
    /// Connected streams, watched for readability
    open: HashMap<StreamId, TunnelStream>,
    /// Streams with a connect in flight, watched for completion
    pending: HashMap<StreamId, TunnelStream>,
    /// Last value of the session's running flag
    running: bool,
    /// Inbound messages not yet applied
    incoming: Vec<Message>,
    /// Messages produced since the last exchange
    outgoing: Vec<Message>,
}

impl TunnelEngine {
    /// Create an engine bound to generation `generation` of `session` in
    /// `store`
    pub fn new(
        session: SessionId,
        generation: Generation,
        store: Arc<dyn SessionStore>,
        resolver: Arc<dyn Resolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            session,
            generation,
            store,
            resolver,
            config,
            open: HashMap::new(),
            pending: HashMap::new(),
            running: true,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// Run until the session is stopped or destroyed
    pub async fn run(mut self) {
        info!(session = %self.session, "Tunnel engine started");

        let mut iterations: u64 = 0;
        while self.exchange().await {
            iterations += 1;
            self.digest_incoming().await;
            self.multiplex().await;
        }

        self.shutdown();
        info!(session = %self.session, iterations, "Tunnel engine stopped");
    }

    /// Swap queues with the session under its lock. Returns whether the
    /// loop should continue.
    async fn exchange(&mut self) -> bool {
        let Some(mut txn) = self.store.load_and_lock(&self.session).await else {
            debug!(session = %self.session, "Session gone, engine exiting");
            self.running = false;
            return false;
        };
        if txn.generation() != self.generation {
            debug!(session = %self.session, "Session replaced, engine exiting");
            self.running = false;
            return false;
        }

        let exchange = txn.exchange(std::mem::take(&mut self.outgoing));
        txn.commit().await;

        self.incoming.extend(exchange.incoming);
        self.running = exchange.running;
        self.running
    }

    /// Queue inbound messages for the next [`TunnelEngine::digest_incoming`]
    pub fn push_incoming(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.incoming.extend(messages);
    }

    /// Take messages produced since the last call
    pub fn take_outgoing(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outgoing)
    }

    /// Whether the last exchange saw the session running
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Get number of connected streams
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Get number of streams still connecting
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// State of stream `id`, if the engine still tracks it
    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.pending
            .get(&id)
            .or_else(|| self.open.get(&id))
            .map(TunnelStream::state)
    }

    /// Apply every queued inbound message in arrival order, then clear the queue
    pub async fn digest_incoming(&mut self) {
        for message in std::mem::take(&mut self.incoming) {
            match message {
                Message::Connect { id, addr, port } => self.open_stream(id, &addr, port).await,
                Message::Sync { id, data } => self.deliver(id, data).await,
                Message::Status { id, value } => {
                    trace!(id, value, "Ignoring inbound status");
                }
                Message::Stop => {
                    trace!("Ignoring inbound stop message");
                }
            }
        }
    }

    /// Resolve and start connecting stream `id`
    async fn open_stream(&mut self, id: StreamId, addr: &str, port: u16) {
        if let Some(state) = self.stream_state(id) {
            debug!(id, "Connect reuses a live stream id, closing the old stream");
            self.discard(id);
            // A failed stream already had its status reported
            if state != StreamState::Closed {
                self.report(id, FAILURE_CODE);
            }
        }

        let target = match self.resolver.resolve(addr, port).await {
            Ok(target) => target,
            Err(e) => {
                debug!(id, addr, "Resolution failed: {}", e);
                self.report(id, FAILURE_CODE);
                return;
            }
        };

        let stream = TunnelStream::create(id, &target).and_then(|mut stream| {
            stream.begin_connect(target)?;
            Ok(stream)
        });

        match stream {
            Ok(stream) => {
                trace!(id, %target, "Connecting");
                self.pending.insert(id, stream);
            }
            Err(e) => {
                debug!(id, %target, "Connect could not be issued: {}", e);
                self.report(id, FAILURE_CODE);
            }
        }
    }

    /// Write an inbound payload to stream `id`.
    ///
    /// A failed write is reported at once but the stream stays in the open
    /// table until the next multiplex pass discards it.
    async fn deliver(&mut self, id: StreamId, data: Bytes) {
        let Some(stream) = self.open.get_mut(&id) else {
            trace!(id, "Dropping data for unknown stream");
            return;
        };
        if stream.state() == StreamState::Closed {
            trace!(id, "Dropping data for failed stream");
            return;
        }

        let result = match tokio::time::timeout(self.config.write_timeout, stream.send(&data)).await
        {
            Ok(result) => result,
            Err(_) => Err(TunnelError::WriteTimeout(id)),
        };

        if let Err(e) = result {
            debug!(id, "Write failed: {}", e);
            stream.mark_failed();
            self.report(id, FAILURE_CODE);
        }
    }

    /// One round of socket multiplexing
    pub async fn multiplex(&mut self) {
        self.discard_failed();

        if self.open.is_empty() && self.pending.is_empty() {
            tokio::time::sleep(self.config.idle_backoff).await;
            return;
        }

        let ready = match tokio::time::timeout(self.config.poll_interval, self.wait_ready()).await {
            Ok(ready) => ready,
            Err(_) => return,
        };

        for (id, result) in ready.connected {
            self.finish_connect(id, result);
        }
        for (id, result) in ready.readable {
            self.read_stream(id, result);
        }
    }

    /// Wait for any pending connect to finish or any open stream to become
    /// readable
    async fn wait_ready(&mut self) -> Readiness {
        let pending = &mut self.pending;
        let open = &mut self.open;

        poll_fn(|cx| {
            let mut ready = Readiness::default();
            for (id, stream) in pending.iter_mut() {
                if let Poll::Ready(result) = stream.poll_connect(cx) {
                    ready.connected.push((*id, result));
                }
            }
            for (id, stream) in open.iter_mut() {
                if let Poll::Ready(result) = stream.poll_read_ready(cx) {
                    ready.readable.push((*id, result));
                }
            }

            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        })
        .await
    }

    /// Report a finished connect and move the stream out of the pending table
    fn finish_connect(&mut self, id: StreamId, result: io::Result<()>) {
        let Some(mut stream) = self.pending.remove(&id) else {
            return;
        };

        match result {
            Ok(()) => {
                debug!(id, "Connected");
                self.report(id, CONNECTED);
                self.open.insert(id, stream);
            }
            Err(e) => {
                debug!(id, "Connect failed: {}", e);
                let code = e.raw_os_error().filter(|code| *code != 0);
                self.report(id, code.unwrap_or(FAILURE_CODE));
                stream.close();
            }
        }
    }

    /// Read one chunk from a readable stream
    fn read_stream(&mut self, id: StreamId, readiness: io::Result<()>) {
        let Some(stream) = self.open.get_mut(&id) else {
            return;
        };

        let outcome = readiness
            .map_err(TunnelError::from)
            .and_then(|()| stream.read(self.config.read_chunk_size));

        match outcome {
            Ok(ReadOutcome::Data(data)) => {
                trace!(id, len = data.len(), "Read");
                self.outgoing.push(Message::sync(id, data));
            }
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Eof) => {
                debug!(id, "Peer closed");
                self.discard(id);
                self.report(id, FAILURE_CODE);
            }
            Err(e) => {
                debug!(id, "Read failed: {}", e);
                self.discard(id);
                self.report(id, FAILURE_CODE);
            }
        }
    }

    /// Drop streams whose failure was already reported
    fn discard_failed(&mut self) {
        let failed: Vec<StreamId> = self
            .open
            .iter()
            .filter(|(_, stream)| stream.state() == StreamState::Closed)
            .map(|(id, _)| *id)
            .collect();

        for id in failed {
            trace!(id, "Discarding failed stream");
            self.discard(id);
        }
    }

    /// Close stream `id` and forget it
    fn discard(&mut self, id: StreamId) {
        if let Some(mut stream) = self.open.remove(&id).or_else(|| self.pending.remove(&id)) {
            stream.close();
        }
    }

    fn report(&mut self, id: StreamId, value: i32) {
        self.outgoing.push(Message::status(id, value));
    }

    /// Close every stream
    fn shutdown(&mut self) {
        for (_, mut stream) in self.open.drain().chain(self.pending.drain()) {
            stream.close();
        }
    }
}
