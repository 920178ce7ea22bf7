//! Serialized access to the transport's write half.
//!
//! Only one caller holds the write slot at a time. Others queue FIFO and are
//! dispatched as the slot is released, so payloads never interleave on the
//! wire. A query keeps its slot until its response arrives, which is what
//! makes request/response matching without request IDs sound.

use crate::error::{Error, Result};
use log::{trace, warn};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Boxed write half of a transport.
pub type Sink = Box<dyn Write + Send>;

/// A queued write waiting for the slot.
pub struct WriteRequest {
    payload: Vec<u8>,
    completion: mpsc::Sender<io::Result<()>>,
}

#[derive(Default)]
struct SlotState {
    busy: bool,
    queue: VecDeque<WriteRequest>,
}

struct Shared {
    sink: Mutex<Sink>,
    state: Mutex<SlotState>,
}

/// FIFO write serializer.
#[derive(Clone)]
pub struct WriteSerializer {
    shared: Arc<Shared>,
}

impl WriteSerializer {
    /// Wrap a write half.
    pub fn new(sink: Sink) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink: Mutex::new(sink),
                state: Mutex::new(SlotState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `payload` once the slot is free, returning the held slot.
    ///
    /// Blocks while another caller holds the slot.
    pub fn send(&self, payload: Vec<u8>) -> Result<WriteSlot> {
        let mut state = self.state();
        if !state.busy {
            state.busy = true;
            drop(state);

            let slot = self.slot();
            // An error drops the slot, which releases it.
            slot.write(&payload)?;
            return Ok(slot);
        }

        let (tx, rx) = mpsc::channel();
        state.queue.push_back(WriteRequest {
            payload,
            completion: tx,
        });
        trace!("Write queued behind {} request(s)", state.queue.len() - 1);
        drop(state);

        match rx.recv() {
            Ok(Ok(())) => Ok(self.slot()),
            Ok(Err(e)) => {
                // The slot was handed over together with the failure.
                drop(self.slot());
                Err(e.into())
            },
            Err(_) => Err(Error::StreamClosed),
        }
    }

    /// Take the slot without writing anything yet.
    pub fn acquire(&self) -> Result<WriteSlot> {
        self.send(Vec::new())
    }

    /// Number of callers waiting for the slot.
    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether some caller holds the slot.
    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    fn slot(&self) -> WriteSlot {
        WriteSlot {
            serializer: self.clone(),
            released: false,
        }
    }

    fn dispatch(&self, payload: &[u8]) -> io::Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        trace!("TX {} bytes: {:02X?}", payload.len(), payload);
        let mut sink = self
            .shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sink.write_all(payload)?;
        sink.flush()
    }

    /// Pass the slot to the next queued request, or mark the wire idle.
    fn release(&self) {
        loop {
            let request = {
                let mut state = self.state();
                match state.queue.pop_front() {
                    Some(request) => request,
                    None => {
                        state.busy = false;
                        return;
                    },
                }
            };

            let result = self.dispatch(&request.payload);
            if request.completion.send(result).is_ok() {
                return;
            }
            warn!("Queued writer went away, passing the slot on");
        }
    }
}

/// Exclusive right to write to the transport.
///
/// Released explicitly with [`WriteSlot::release`] or when dropped.
pub struct WriteSlot {
    serializer: WriteSerializer,
    released: bool,
}

impl WriteSlot {
    /// Write another payload while holding the slot.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        self.serializer.dispatch(payload)?;
        Ok(())
    }

    /// Give up the slot.
    pub fn release(mut self) {
        self.released = true;
        self.serializer.release();
    }
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        if !self.released {
            self.serializer.release();
        }
    }
}
