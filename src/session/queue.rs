//! Per-session sequencing state

use crate::protocol::{Message, ProtocolError, Reply, REORDER_WINDOW};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{trace, warn};

/// Everything the engine takes out of the session in one exchange
#[derive(Debug, Default)]
pub struct Exchange {
    /// Inbound messages admitted since the previous exchange, in order
    pub incoming: Vec<Message>,
    /// Value of the shared running flag
    pub running: bool,
}

/// Persisted state of one tunnel session
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Cleared by a stop request; the engine exits when it observes false
    running: bool,
    /// Next expected inbound batch sequence number
    in_seq: u64,
    /// Sequence number of the next sync response
    out_seq: u64,
    /// Batches that arrived ahead of `in_seq`
    reassembly: BTreeMap<u64, Vec<Message>>,
    /// Admitted messages not yet picked up by the engine
    inbound: VecDeque<Message>,
    /// Engine output not yet fetched by the client
    outbound: VecDeque<Message>,
    /// Engine loop iteration counter
    control: u64,
    /// Sequence numbers accepted, counted from `in_seq`
    reorder_window: u64,
}

impl SessionState {
    /// Fresh session with the engine marked running
    pub fn new() -> Self {
        Self::with_reorder_window(REORDER_WINDOW)
    }

    /// Fresh session accepting batches up to `window - 1` ahead of the next
    /// expected one
    pub fn with_reorder_window(window: u64) -> Self {
        Self {
            running: true,
            in_seq: 0,
            out_seq: 0,
            reassembly: BTreeMap::new(),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            control: 0,
            reorder_window: window.max(1),
        }
    }

    /// Admit inbound batch `seq`.
    ///
    /// The batch is appended when it is the next one expected, followed by
    /// any buffered batches that have become contiguous. A batch from the
    /// future is buffered if it falls inside the reorder window. A batch
    /// from the past or beyond the window is rejected without touching any
    /// state.
    pub fn admit(&mut self, seq: u64, batch: Vec<Message>) -> Result<(), ProtocolError> {
        if seq < self.in_seq {
            warn!(seq, expected = self.in_seq, "Rejecting stale batch");
            return Err(ProtocolError::StaleSequence {
                got: seq,
                expected: self.in_seq,
            });
        }

        let limit = self.in_seq.saturating_add(self.reorder_window);
        if seq >= limit {
            warn!(seq, limit, "Rejecting batch beyond reorder window");
            return Err(ProtocolError::TooFarAhead { got: seq, limit });
        }

        if seq > self.in_seq {
            trace!(seq, expected = self.in_seq, "Buffering out-of-order batch");
            self.reassembly.insert(seq, batch);
            return Ok(());
        }

        self.inbound.extend(batch);
        self.in_seq += 1;

        while let Some(buffered) = self.reassembly.remove(&self.in_seq) {
            trace!(seq = self.in_seq, "Admitting buffered batch");
            self.inbound.extend(buffered);
            self.in_seq += 1;
        }

        Ok(())
    }

    /// Remove up to `page_size` messages from the front of the outbound queue
    /// and tag them with the current outbound sequence number.
    pub fn next_page(&mut self, page_size: usize) -> Reply {
        let take = page_size.min(self.outbound.len());
        let msgs: Vec<Message> = self.outbound.drain(..take).collect();
        let seq = self.out_seq;
        self.out_seq += 1;
        Reply::Sync { seq, msgs }
    }

    /// One client sync: admit the batch, then page the outbound queue.
    ///
    /// A stale batch yields an error and leaves the session untouched,
    /// including the outbound queue and `out_seq`.
    pub fn sync(
        &mut self,
        seq: u64,
        batch: Vec<Message>,
        page_size: usize,
    ) -> Result<Reply, ProtocolError> {
        self.admit(seq, batch)?;
        Ok(self.next_page(page_size))
    }

    /// The engine side of the exchange: hand over admitted inbound messages,
    /// publish the engine's pending output and bump the heartbeat counter.
    pub fn exchange(&mut self, outgoing: Vec<Message>) -> Exchange {
        self.outbound.extend(outgoing);
        self.control += 1;
        Exchange {
            incoming: self.inbound.drain(..).collect(),
            running: self.running,
        }
    }

    /// Request engine shutdown
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn in_seq(&self) -> u64 {
        self.in_seq
    }

    pub fn out_seq(&self) -> u64 {
        self.out_seq
    }

    pub fn control(&self) -> u64 {
        self.control
    }

    /// Admitted messages waiting for the engine
    pub fn inbound(&self) -> impl Iterator<Item = &Message> {
        self.inbound.iter()
    }

    /// Number of messages waiting for the client
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Sequence numbers currently held for reassembly
    pub fn buffered(&self) -> Vec<u64> {
        self.reassembly.keys().copied().collect()
    }

    /// Diagnostic view of the session
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            running: self.running,
            in_seq: self.in_seq,
            out_seq: self.out_seq,
            control: self.control,
            inbound: self.inbound.len(),
            outbound: self.outbound.len(),
            buffered: self.buffered(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable summary returned by the diagnostics route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub running: bool,
    pub in_seq: u64,
    pub out_seq: u64,
    pub control: u64,
    pub inbound: usize,
    pub outbound: usize,
    pub buffered: Vec<u64>,
}
