//! Request/response matching.
//!
//! The wire has no request IDs, so a response is matched to whichever query
//! is waiting on its sub-stream. Each query therefore:
//!
//! 1. takes the write slot,
//! 2. registers its waiter (at most one per sub-stream),
//! 3. writes the request and waits,
//! 4. releases the slot only once the exchange is over.
//!
//! Text queries are resent at a fixed interval until the deadline. A slow
//! device may answer every copy, so once the query is over (answered or
//! timed out) the slot stays held while the answers still owed for the other
//! copies are read and thrown away. Draining stops when they are all in or
//! the response stream stays quiet for the settle window.

use crate::connection::ConnectionOptions;
use crate::error::{Error, Result};
use crate::protocol::bootloader::{BootloaderFrame, response_code};
use crate::protocol::text::{SkaleneMessage, SkaleneResponse};
use crate::stream::SubStreams;
use crate::writer::WriteSerializer;
use log::{debug, warn};
use std::time::Instant;

/// Issues queries over a write serializer and the demultiplexed sub-streams.
#[derive(Clone)]
pub struct QueryEngine {
    writer: WriteSerializer,
    streams: SubStreams,
    options: ConnectionOptions,
}

impl QueryEngine {
    /// Create an engine.
    pub fn new(writer: WriteSerializer, streams: SubStreams, options: ConnectionOptions) -> Self {
        Self {
            writer,
            streams,
            options,
        }
    }

    /// Timing options in use.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Send one bootloader frame and check its single-byte answer.
    ///
    /// Returns the response code. Never retried.
    pub fn query_bootloader(&self, frame: &BootloaderFrame) -> Result<u8> {
        let command = frame.command();
        let expected = command.expected_response();

        let slot = self.writer.acquire()?;
        let mut pending = self.streams.raw.pending()?;

        debug!("Sending {command} frame ({} byte body)", frame.body().len());
        slot.write(&frame.build())?;
        pending.mark_sent();

        let timeout = self.options.bootloader_timeout;
        let chunk = pending.wait(timeout).map_err(|e| match e {
            Error::Timeout(_) => Error::Timeout(format!(
                "no response to {command} within {} ms",
                timeout.as_millis()
            )),
            other => other,
        })?;
        slot.release();

        let actual = response_code(&chunk)?;
        if actual != expected {
            return Err(Error::UnexpectedResponse {
                command,
                expected,
                actual,
            });
        }
        Ok(actual)
    }

    /// Send a text query and wait for its response line.
    ///
    /// The message is resent every `resend_interval` until a line arrives or
    /// `query_timeout` expires. Every copy sent may still be answered, so the
    /// slot stays held until those extra answers are drained.
    pub fn query(&self, body: &str) -> Result<SkaleneResponse> {
        let message = SkaleneMessage::new(body)?.encode();
        let timeout = self.options.query_timeout;

        let slot = self.writer.acquire()?;
        let mut pending = self.streams.response.pending()?;
        let deadline = Instant::now() + timeout;

        debug!("Query {body:?}");
        slot.write(&message)?;
        pending.mark_sent();

        let mut copies = 1u32;
        let answer = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                pending.cancel();
                break pending.try_take();
            }

            let wait = self
                .options
                .resend_interval
                .map_or(remaining, |interval| interval.min(remaining));
            if let Some(line) = pending.poll(wait)? {
                break Some(line);
            }

            if self.options.resend_interval.is_some() && Instant::now() < deadline {
                copies += 1;
                debug!("Resending {body:?} (copy {copies})");
                slot.write(&message)?;
                pending.mark_sent();
            }
        };
        drop(pending);

        let Some(line) = answer else {
            self.discard_late_answers(copies);
            slot.release();
            return Err(Error::Timeout(format!(
                "no response to {body:?} within {} ms ({} resends)",
                timeout.as_millis(),
                copies - 1
            )));
        };
        debug!("Response {line:?} after {copies} copies");

        self.discard_late_answers(copies - 1);
        slot.release();

        SkaleneResponse::parse(&line).inspect_err(|e| {
            if matches!(e, Error::CrcMismatch { .. } | Error::MalformedMessage(_)) {
                warn!("Discarding corrupt response {line:?}: {e}");
            }
        })
    }

    /// Swallow up to `outstanding` answers to copies already sent.
    ///
    /// Stops early once the response sub-stream stays quiet for the settle
    /// window. The caller must hold the write slot.
    fn discard_late_answers(&self, outstanding: u32) {
        let window = self.options.settle;
        if window.is_zero() {
            return;
        }
        for _ in 0..outstanding {
            let Ok(pending) = self.streams.response.pending() else {
                return;
            };
            match pending.wait(window) {
                Ok(line) => debug!("Discarding late answer {line:?}"),
                Err(_) => return,
            }
        }
    }
}
