//! In-memory device for tests.
//!
//! The write half hands every payload to a responder closure; whatever it
//! returns is queued for the read half, one chunk per entry.

use crate::connection::{Connection, ConnectionOptions};
use crate::protocol::text;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const READ_POLL: Duration = Duration::from_millis(20);

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Encode a response line.
pub(crate) fn reply(body: &str) -> Vec<u8> {
    text::encode(body).unwrap()
}

/// Test-side view of a mock device.
#[derive(Clone)]
pub(crate) struct MockHandle {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    inject: Sender<Vec<u8>>,
    eof: Arc<AtomicBool>,
}

impl MockHandle {
    /// Every payload written so far.
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    /// Written payloads decoded as text message bodies.
    pub(crate) fn written_bodies(&self) -> Vec<String> {
        self.written()
            .iter()
            .filter_map(|w| std::str::from_utf8(w).ok())
            .filter_map(|line| text::SkaleneMessage::decode(line).ok())
            .map(text::SkaleneMessage::into_body)
            .collect()
    }

    /// Push unsolicited bytes to the host.
    pub(crate) fn inject(&self, chunk: &[u8]) {
        self.inject.send(chunk.to_vec()).unwrap();
    }

    /// Make the read half report end of stream.
    pub(crate) fn disconnect(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct MockWriter {
    responder: Responder,
    tx: Sender<Vec<u8>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().push(buf.to_vec());
        for chunk in (self.responder)(buf) {
            let _ = self.tx.send(chunk);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct MockReader {
    rx: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    eof: Arc<AtomicBool>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            if self.eof.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match self.rx.recv_timeout(READ_POLL) {
                Ok(chunk) => self.leftover = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
                },
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

/// Create a mock transport driven by `responder`.
pub(crate) fn device<F>(responder: F) -> (MockReader, MockWriter, MockHandle)
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let _ = env_logger::builder().is_test(true).try_init();

    let (tx, rx) = mpsc::channel();
    let written = Arc::new(Mutex::new(Vec::new()));
    let eof = Arc::new(AtomicBool::new(false));
    let handle = MockHandle {
        written: Arc::clone(&written),
        inject: tx.clone(),
        eof: Arc::clone(&eof),
    };
    let reader = MockReader {
        rx,
        leftover: Vec::new(),
        eof,
    };
    let writer = MockWriter {
        responder: Box::new(responder),
        tx,
        written,
    };
    (reader, writer, handle)
}

/// Open a [`Connection`] to a mock device.
pub(crate) fn connection<F>(responder: F, options: ConnectionOptions) -> (Connection, MockHandle)
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let (reader, writer, handle) = device(responder);
    let conn = Connection::new(reader, writer, options).unwrap();
    (conn, handle)
}

/// Responder answering text queries by body.
pub(crate) fn text_device<F>(mut answer: F) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    move |payload: &[u8]| {
        let Some(body) = std::str::from_utf8(payload)
            .ok()
            .and_then(|line| text::SkaleneMessage::decode(line).ok())
        else {
            return Vec::new();
        };
        answer(body.body())
            .map(|response| vec![reply(&response)])
            .unwrap_or_default()
    }
}

/// Open a [`Connection`] to a device that answers each text query after a
/// per-query latency, from a background thread.
pub(crate) fn slow_text_connection<F>(
    mut answer: F,
    options: ConnectionOptions,
) -> (Connection, MockHandle)
where
    F: FnMut(&str) -> Option<(Duration, String)> + Send + 'static,
{
    let inject: Arc<Mutex<Option<Sender<Vec<u8>>>>> = Arc::new(Mutex::new(None));
    let late = Arc::clone(&inject);
    let (conn, handle) = connection(
        move |payload: &[u8]| {
            let Some(message) = std::str::from_utf8(payload)
                .ok()
                .and_then(|line| text::SkaleneMessage::decode(line).ok())
            else {
                return Vec::new();
            };
            if let (Some((latency, response)), Some(tx)) =
                (answer(message.body()), late.lock().unwrap().clone())
            {
                thread::spawn(move || {
                    thread::sleep(latency);
                    let _ = tx.send(reply(&response));
                });
            }
            Vec::new()
        },
        options,
    );
    *inject.lock().unwrap() = Some(handle.inject.clone());
    (conn, handle)
}
