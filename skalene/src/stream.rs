//! Inbound stream demultiplexing.
//!
//! One transport byte stream is split into three sub-streams:
//!
//! ```text
//! [transport] --chunks--> raw ------------------------> [bootloader responses]
//!                 |
//!           utf-8 decode
//!                 |
//!          split on "\r\n"
//!                 |
//!                 +-- first token == marker --> debug --> [debug log]
//!                 |
//!                 +-- everything else -------> response -> [text queries]
//! ```
//!
//! Every sub-stream fans each item out to all `every` observers and hands it to
//! the oldest `next` waiter, if any. Items that arrive while nobody waits are
//! seen by observers only.

use crate::error::{Error, Result};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Size of a single transport read.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Waiter<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

struct SubStreamState<T> {
    observers: Vec<Observer<T>>,
    waiters: VecDeque<Waiter<T>>,
    next_id: u64,
    closed: bool,
}

/// One logical branch of the demultiplexed stream.
pub struct SubStream<T> {
    name: &'static str,
    state: Arc<Mutex<SubStreamState<T>>>,
}

impl<T> Clone for SubStream<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> SubStream<T> {
    /// Create an open sub-stream.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(SubStreamState {
                observers: Vec::new(),
                waiters: VecDeque::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubStreamState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register an observer called for every item on this sub-stream.
    pub fn every<F>(&self, observer: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.lock().observers.push(Arc::new(observer));
    }

    /// Wait for the next item, queueing behind earlier waiters.
    pub fn next(&self, timeout: Duration) -> Result<T> {
        self.register()?.wait(timeout)
    }

    /// Reserve the only waiting slot on this sub-stream.
    ///
    /// Fails with [`Error::QueryInFlight`] when another waiter is queued.
    pub fn pending(&self) -> Result<PendingQuery<T>> {
        if !self.lock().waiters.is_empty() {
            return Err(Error::QueryInFlight);
        }
        self.register()
    }

    fn register(&self) -> Result<PendingQuery<T>> {
        let (tx, rx) = mpsc::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(Error::StreamClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.waiters.push_back(Waiter { id, tx });
        drop(state);

        Ok(PendingQuery {
            id,
            rx,
            stream: self.clone(),
            sent_at: Instant::now(),
        })
    }

    fn remove_waiter(&self, id: u64) {
        self.lock().waiters.retain(|w| w.id != id);
    }

    /// Number of queued waiters.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Deliver an item to all observers and the oldest waiter.
    ///
    /// Returns whether a waiter received the item.
    pub fn publish(&self, item: T) -> bool {
        let (observers, waiter) = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            (state.observers.clone(), state.waiters.pop_front())
        };

        for observer in &observers {
            observer(&item);
        }

        match waiter {
            Some(waiter) => {
                let delivered = waiter.tx.send(item).is_ok();
                if !delivered {
                    trace!("{} waiter {} went away before delivery", self.name, waiter.id);
                }
                delivered
            },
            None => false,
        }
    }

    /// Close the sub-stream, failing every current and future waiter.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
    }

    /// Whether the sub-stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// A waiting slot on a sub-stream.
///
/// Resolved by the next item published on the sub-stream. Dropping it removes
/// the slot from the queue.
pub struct PendingQuery<T: Send + 'static> {
    id: u64,
    rx: mpsc::Receiver<T>,
    stream: SubStream<T>,
    sent_at: Instant,
}

impl<T: Send + 'static> PendingQuery<T> {
    /// Record that the request for this slot just went out.
    pub fn mark_sent(&mut self) {
        self.sent_at = Instant::now();
    }

    /// Time since the request went out.
    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// Wait up to `timeout` without giving up the slot.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub fn poll(&self, timeout: Duration) -> Result<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::StreamClosed),
        }
    }

    /// Wait up to `timeout`, then give up the slot.
    pub fn wait(self, timeout: Duration) -> Result<T> {
        if let Some(item) = self.poll(timeout)? {
            return Ok(item);
        }
        self.cancel();
        // Delivery may have raced with the timeout.
        if let Some(item) = self.try_take() {
            return Ok(item);
        }
        Err(Error::Timeout(format!(
            "no {} data within {} ms",
            self.stream.name,
            timeout.as_millis()
        )))
    }

    /// Take an item that was already delivered, without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Remove this slot from the queue. Safe to call more than once.
    pub fn cancel(&self) {
        self.stream.remove_waiter(self.id);
    }
}

impl<T: Send + 'static> Drop for PendingQuery<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The three sub-streams produced from one transport.
#[derive(Clone)]
pub struct SubStreams {
    /// Raw byte chunks, as read from the transport.
    pub raw: SubStream<Vec<u8>>,
    /// Lines starting with the debug marker.
    pub debug: SubStream<String>,
    /// All other lines.
    pub response: SubStream<String>,
}

impl SubStreams {
    /// Create three open sub-streams.
    pub fn new() -> Self {
        Self {
            raw: SubStream::new("raw"),
            debug: SubStream::new("debug"),
            response: SubStream::new("response"),
        }
    }

    /// Close all three sub-streams.
    pub fn close(&self) {
        self.raw.close();
        self.debug.close();
        self.response.close();
    }
}

impl Default for SubStreams {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental UTF-8 decoder and `\r\n` line splitter.
#[derive(Debug, Default)]
pub struct LineDecoder {
    undecoded: Vec<u8>,
    partial: String,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.undecoded.extend_from_slice(chunk);
        let text = drain_utf8_lossy(&mut self.undecoded);
        self.partial.push_str(&text);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find("\r\n") {
            lines.push(self.partial[..pos].to_string());
            self.partial.drain(..pos + 2);
        }
        lines
    }

    /// Text received after the last complete line.
    pub fn partial(&self) -> &str {
        &self.partial
    }
}

/// Decode the valid UTF-8 prefix of `buffer`.
///
/// Invalid sequences become `�`. An incomplete sequence at the end stays in
/// `buffer` for the next chunk.
fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                output.push_str(&String::from_utf8_lossy(&buffer[..valid_up_to]));

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('\u{FFFD}');
                        buffer.drain(..valid_up_to + invalid_len);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Whether `line` belongs on the debug sub-stream.
pub fn is_debug_line(line: &str, marker: &str) -> bool {
    line.split(' ').next() == Some(marker)
}

/// Routes transport chunks onto the three sub-streams.
pub struct Demultiplexer {
    streams: SubStreams,
    decoder: LineDecoder,
    debug_marker: String,
}

impl Demultiplexer {
    /// Create a demultiplexer routing lines that start with `debug_marker`
    /// to the debug sub-stream.
    pub fn new(debug_marker: impl Into<String>) -> Self {
        Self {
            streams: SubStreams::new(),
            decoder: LineDecoder::new(),
            debug_marker: debug_marker.into(),
        }
    }

    /// Handles to the sub-streams.
    pub fn streams(&self) -> SubStreams {
        self.streams.clone()
    }

    /// Route one transport chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        trace!("RX {} bytes: {:02X?}", chunk.len(), chunk);
        self.streams.raw.publish(chunk.to_vec());

        for line in self.decoder.push(chunk) {
            if is_debug_line(&line, &self.debug_marker) {
                self.streams.debug.publish(line);
            } else if !self.streams.response.publish(line.clone()) {
                debug!("Discarding unsolicited line {line:?}");
            }
        }
    }

    /// Close all sub-streams.
    pub fn close(&self) {
        self.streams.close();
    }

    /// Pump `reader` until end of stream, a read error, or `shutdown`.
    ///
    /// Read timeouts are not errors: the loop re-checks `shutdown` and keeps
    /// reading. The sub-streams are closed on exit.
    pub fn run<R: Read>(mut self, mut reader: R, shutdown: &AtomicBool) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        while !shutdown.load(Ordering::Relaxed) {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("Transport reached end of stream");
                    break;
                },
                Ok(n) => self.feed(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {},
                Err(e) => {
                    warn!("Transport read failed: {e}");
                    break;
                },
            }
        }

        if !self.decoder.partial().is_empty() {
            debug!("Discarding unterminated line {:?}", self.decoder.partial());
        }
        self.close();
    }

    /// Run the pump on a dedicated reader thread.
    pub fn spawn<R>(self, reader: R, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        thread::Builder::new()
            .name("skalene-reader".into())
            .spawn(move || self.run(reader, &shutdown))
    }
}
