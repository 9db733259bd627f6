//! Queue pairs and their worker threads
//!
//! A queue pair couples one TX ring and one RX ring that share an interrupt
//! vector. In threaded mode each pair has a dedicated worker consuming a
//! bounded event channel; interrupts and submitters only post events.

use crate::error::{EngineError, ResetReason, Result};
use crate::packet::NetStack;
use crate::rx::RxRing;
use crate::tx::TxRing;
use crate::watchdog::ResetRequest;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// TX and RX ring of one queue pair
#[derive(Debug)]
pub struct QueuePair {
    id: u16,
    cpu: usize,
    vector: u16,
    tx: TxRing,
    rx: RxRing,
}

/// Work done by one [`QueuePair::poll`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// TX completions reclaimed
    pub tx_completed: usize,
    /// RX packets handed to the stack
    pub rx_delivered: usize,
    /// RX packets dropped
    pub rx_dropped: usize,
    /// RX budget exhausted; poll again
    pub reschedule: bool,
    /// Fault that needs an adapter reset
    pub reset: Option<ResetReason>,
}

impl QueuePair {
    /// Combine two rings with the same queue id
    pub fn new(tx: TxRing, rx: RxRing, cpu: usize, vector: u16) -> Self {
        debug_assert_eq!(tx.qid(), rx.qid());
        Self {
            id: tx.qid(),
            cpu,
            vector,
            tx,
            rx,
        }
    }

    /// Queue pair id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// CPU affinity hint
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Interrupt vector
    pub fn vector(&self) -> u16 {
        self.vector
    }

    /// Transmit ring
    pub fn tx(&self) -> &TxRing {
        &self.tx
    }

    /// Receive ring
    pub fn rx(&self) -> &RxRing {
        &self.rx
    }

    /// Reconcile TX completions, then receive up to the RX budget
    pub fn poll(&self, stack: &dyn NetStack) -> PollOutcome {
        let tx_completed = self.tx.clean();
        let rx = self.rx.clean(stack);
        PollOutcome {
            tx_completed,
            rx_delivered: rx.delivered,
            rx_dropped: rx.dropped,
            reschedule: rx.reschedule,
            reset: rx.reset,
        }
    }
}

/// Event delivered to a queue worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// The pair's interrupt vector fired
    Interrupt,
    /// Packets were queued while another thread was draining
    Enqueue,
    /// Exit the worker loop
    Stop,
}

/// Dedicated thread serving one queue pair
pub struct QueueWorker {
    id: u16,
    events: Sender<QueueEvent>,
    handle: Option<JoinHandle<()>>,
}

impl QueueWorker {
    /// Start the `mqnic-q{id}` thread
    pub fn spawn(
        pair: Arc<QueuePair>,
        stack: Arc<dyn NetStack>,
        resets: Arc<ResetRequest>,
        depth: usize,
    ) -> Result<Self> {
        let id = pair.id();
        let (events, rx) = crossbeam_channel::bounded(depth.max(1));
        let requeue = events.clone();

        let handle = thread::Builder::new()
            .name(format!("mqnic-q{id}"))
            .spawn(move || worker_loop(&pair, &*stack, &resets, &rx, &requeue))
            .map_err(EngineError::Io)?;

        Ok(Self {
            id,
            events,
            handle: Some(handle),
        })
    }

    /// Queue pair id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Post an event without blocking
    ///
    /// A full channel already holds a pending wakeup, so the event is
    /// coalesced. Returns `false` if the worker has exited.
    pub fn notify(&self, event: QueueEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.events.send(QueueEvent::Stop).is_err() {
            tracing::debug!("Queue {} worker already gone", self.id);
        }
        if handle.join().is_err() {
            tracing::error!("Queue {} worker panicked", self.id);
        }
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("id", &self.id)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn worker_loop(
    pair: &QueuePair,
    stack: &dyn NetStack,
    resets: &ResetRequest,
    events: &Receiver<QueueEvent>,
    requeue: &Sender<QueueEvent>,
) {
    tracing::debug!("Queue {} worker started (cpu hint {})", pair.id(), pair.cpu());

    while let Ok(event) = events.recv() {
        match event {
            QueueEvent::Stop => break,
            QueueEvent::Enqueue => {
                pair.tx().drain();
            }
            QueueEvent::Interrupt => {
                let outcome = pair.poll(stack);
                tracing::trace!("Queue {} poll: {:?}", pair.id(), outcome);
                if let Some(reason) = outcome.reset {
                    resets.request(reason);
                } else if outcome.reschedule {
                    let _ = requeue.try_send(QueueEvent::Interrupt);
                }
            }
        }
    }

    tracing::debug!("Queue {} worker stopped", pair.id());
}
