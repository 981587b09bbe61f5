//! Buffered, ordered, deduplicated event delivery.
//!
//! The [`EventBus`] sits between the connection task and application
//! listeners. While not ready it buffers envelopes; once ready it flushes
//! them in sequence order and then delivers live traffic directly. An
//! envelope whose sequence number was already delivered on its stream is
//! dropped, which makes redelivery after a reconnect harmless.

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::emitter::{Emitter, EventSink, Listener, ListenerId};
use crate::models::{Envelope, OverflowPolicy};

/// Stream key used for envelopes without a `stream` field.
pub const DEFAULT_STREAM: &str = "default";

/// What [`EventBus::receive`] did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    Delivered,
    Buffered,
    /// Sequence number at or below the last delivered one for its stream.
    Duplicate,
    /// The queue was full under [`OverflowPolicy::Resynchronize`]; the queue
    /// and this envelope were discarded.
    Overflow,
}

#[derive(Debug)]
struct BusState {
    ready: bool,
    flushing: bool,
    last_delivered: HashMap<String, u64>,
    pending: VecDeque<Envelope>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl BusState {
    /// Record `envelope` as delivered. Returns `false` for duplicates.
    fn accept(&mut self, envelope: &Envelope) -> bool {
        let Some(seq) = envelope.sequence_number else {
            return true;
        };
        let stream = stream_key(envelope);
        match self.last_delivered.get(stream) {
            Some(&last) if seq <= last => false,
            _ => {
                self.last_delivered.insert(stream.to_string(), seq);
                true
            },
        }
    }
}

fn stream_key(envelope: &Envelope) -> &str {
    envelope.stream.as_deref().unwrap_or(DEFAULT_STREAM)
}

/// Buffered event bus. Listeners subscribe by event name:
///
/// - `event` for every delivered envelope
/// - `event:<namespace>`, e.g. `event:conversation`
/// - `event:<eventType>`, e.g. `event:conversation.activity`
pub struct EventBus {
    state: Mutex<BusState>,
    emitter: Arc<Emitter<Envelope>>,
    delivery: ReentrantMutex<()>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventBus")
            .field("ready", &state.ready)
            .field("pending", &state.pending.len())
            .field("streams", &state.last_delivered.len())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(BusState {
                ready: false,
                flushing: false,
                last_delivered: HashMap::new(),
                pending: VecDeque::new(),
                capacity: capacity.max(1),
                policy,
            }),
            emitter: Arc::new(Emitter::new()),
            delivery: ReentrantMutex::new(()),
        }
    }

    /// The bus as a generic [`EventSink`], e.g. for
    /// [`transfer_events`](crate::emitter::transfer_events).
    pub fn sink(&self) -> Arc<dyn EventSink<Envelope>> {
        self.emitter.clone()
    }

    pub fn on(&self, name: &str, listener: Listener<Envelope>) -> ListenerId {
        self.emitter.on(name, listener)
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.emitter.off(name, id)
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Last delivered sequence number for `stream`.
    pub fn last_delivered(&self, stream: &str) -> Option<u64> {
        self.state.lock().last_delivered.get(stream).copied()
    }

    /// Intake for every inbound application envelope.
    pub fn receive(&self, envelope: Envelope) -> Intake {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();

        if !state.ready || state.flushing {
            if state.pending.len() >= state.capacity {
                match state.policy {
                    OverflowPolicy::DropOldest => {
                        state.pending.pop_front();
                        log::warn!(
                            "[mercury] event buffer full ({}); dropped oldest envelope",
                            state.capacity
                        );
                    },
                    OverflowPolicy::Resynchronize => {
                        state.pending.clear();
                        log::warn!(
                            "[mercury] event buffer full ({}); resynchronization required",
                            state.capacity
                        );
                        return Intake::Overflow;
                    },
                }
            }
            state.pending.push_back(envelope);
            return Intake::Buffered;
        }

        if !state.accept(&envelope) {
            log::debug!(
                "[mercury] dropping duplicate sequence {:?} on '{}'",
                envelope.sequence_number,
                stream_key(&envelope)
            );
            return Intake::Duplicate;
        }
        drop(state);
        self.deliver(envelope);
        Intake::Delivered
    }

    /// `true` flushes buffered envelopes in sequence order and switches to
    /// live delivery; `false` resumes buffering.
    pub fn set_ready(&self, ready: bool) {
        let _delivery = self.delivery.lock();
        {
            let mut state = self.state.lock();
            state.ready = ready;
            if !ready || state.flushing {
                return;
            }
            state.flushing = true;
        }
        self.flush();
        self.state.lock().flushing = false;
    }

    /// Forget delivery history and drop anything buffered.
    pub fn reset(&self) {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();
        state.pending.clear();
        state.last_delivered.clear();
    }

    fn flush(&self) {
        loop {
            let batch: Vec<Envelope> = {
                let mut state = self.state.lock();
                if !state.ready || state.pending.is_empty() {
                    return;
                }
                let mut batch: Vec<Envelope> = state.pending.drain(..).collect();
                // Stable: unsequenced envelopes keep arrival order after the
                // sequenced ones.
                batch.sort_by_key(|e| (e.sequence_number.is_none(), e.sequence_number));
                batch
            };
            log::debug!("[mercury] flushing {} buffered envelopes", batch.len());

            let mut remaining = batch.into_iter();
            while let Some(envelope) = remaining.next() {
                let mut state = self.state.lock();
                if !state.ready {
                    for rest in std::iter::once(envelope).chain(remaining).rev() {
                        state.pending.push_front(rest);
                    }
                    return;
                }
                let fresh = state.accept(&envelope);
                drop(state);
                if fresh {
                    self.deliver(envelope);
                }
            }
        }
    }

    fn deliver(&self, mut envelope: Envelope) {
        envelope.apply_header_overrides();
        self.emitter.emit("event", &envelope);

        let Some(event_type) = envelope.event_type().map(str::to_string) else {
            return;
        };
        match event_type.split_once('.') {
            Some((namespace, _)) => {
                self.emitter.emit(&format!("event:{}", namespace), &envelope);
                self.emitter.emit(&format!("event:{}", event_type), &envelope);
            },
            None => self.emitter.emit(&format!("event:{}", event_type), &envelope),
        }
    }
}
