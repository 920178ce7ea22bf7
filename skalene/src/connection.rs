//! Connection to a Skalene instrument.
//!
//! A [`Connection`] owns both halves of the transport. A reader thread pumps
//! the read half through the [`Demultiplexer`]; queries go out through the
//! [`WriteSerializer`] and are matched by the [`QueryEngine`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use skalene::{Connection, ConnectionOptions, SerialConfig};
//!
//! fn main() -> skalene::Result<()> {
//!     let conn = Connection::open(
//!         &SerialConfig::new("/dev/ttyUSB0", 115200),
//!         ConnectionOptions::default(),
//!     )?;
//!     conn.on_debug(|line| eprintln!("debug: {line}"));
//!
//!     let config = conn.get_config()?;
//!     println!("{config}");
//!     Ok(())
//! }
//! ```

use crate::config::{ConfigErrors, DeviceConfig, INTEGRATION_TIME_RANGE};
use crate::error::{Error, Result};
use crate::flasher::{FlashOptions, FlashSession, FlashStage};
use crate::protocol::bootloader::BootloaderFrame;
use crate::protocol::text::{CommandCode, DEFAULT_DEBUG_MARKER, SkaleneResponse};
use crate::query::QueryEngine;
use crate::stream::{Demultiplexer, SubStreams};
use crate::writer::WriteSerializer;
use log::{debug, info, warn};
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[cfg(feature = "native")]
use crate::port::{NativePort, Port, SerialConfig};

/// Timeout for a single bootloader response.
pub const BOOTLOADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall deadline for a text query, resends included.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between resends of an unanswered text query.
pub const RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Quiet period that ends the draining of answers to extra query copies.
pub const SETTLE_WINDOW: Duration = RESEND_INTERVAL;

/// Number of channels reported by results and live data.
pub const CHANNEL_COUNT: usize = 8;

/// Number of RAW_BLOCK queries in a full raw data read.
pub const RAW_BLOCK_COUNT: usize = 256;

/// Timing and routing options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Timeout for each bootloader frame.
    pub bootloader_timeout: Duration,
    /// Overall text query deadline.
    pub query_timeout: Duration,
    /// Text query resend interval. `None` disables resending.
    pub resend_interval: Option<Duration>,
    /// How long to keep waiting for answers still owed to earlier copies of
    /// a query before the next query may go out. Zero disables draining.
    pub settle: Duration,
    /// First token identifying debug lines.
    pub debug_marker: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            bootloader_timeout: BOOTLOADER_TIMEOUT,
            query_timeout: QUERY_TIMEOUT,
            resend_interval: Some(RESEND_INTERVAL),
            settle: SETTLE_WINDOW,
            debug_marker: DEFAULT_DEBUG_MARKER.to_string(),
        }
    }
}

impl ConnectionOptions {
    /// Set the debug marker.
    #[must_use]
    pub fn with_debug_marker(mut self, marker: impl Into<String>) -> Self {
        self.debug_marker = marker.into();
        self
    }

    /// Set the text query deadline.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            bootloader_timeout: Duration::from_millis(300),
            query_timeout: Duration::from_millis(800),
            resend_interval: Some(Duration::from_millis(100)),
            settle: Duration::from_millis(200),
            debug_marker: DEFAULT_DEBUG_MARKER.to_string(),
        }
    }
}

/// Samples collected by [`Connection::read_raw_data`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawData {
    samples: Vec<String>,
}

impl RawData {
    /// Wrap a flat, channel-interleaved sample list.
    pub fn new(samples: Vec<String>) -> Self {
        Self { samples }
    }

    /// Flat sample list.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples were read.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Render as CSV with one column per channel.
    pub fn to_csv(&self) -> String {
        let header: Vec<String> = (1..=CHANNEL_COUNT).map(|i| format!("Channel {i}")).collect();
        let mut csv = header.join(", ");
        csv.push_str("\r\n");
        for row in self.samples.chunks(CHANNEL_COUNT) {
            let _ = write!(csv, "{}\r\n", row.join(", "));
        }
        csv
    }
}

/// A live connection to an instrument.
pub struct Connection {
    engine: QueryEngine,
    streams: SubStreams,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    lost: Mutex<Option<String>>,
}

impl Connection {
    /// Start a connection over an arbitrary read/write pair.
    ///
    /// `reader` should return `TimedOut` or `WouldBlock` periodically so the
    /// reader thread can notice shutdown.
    pub fn new<R, W>(reader: R, writer: W, options: ConnectionOptions) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let demux = Demultiplexer::new(options.debug_marker.clone());
        let streams = demux.streams();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = demux.spawn(reader, Arc::clone(&shutdown))?;

        let writer = WriteSerializer::new(Box::new(writer));
        let engine = QueryEngine::new(writer, streams.clone(), options);

        Ok(Self {
            engine,
            streams,
            shutdown,
            reader: Some(handle),
            lost: Mutex::new(None),
        })
    }

    /// Open a native serial port and start a connection on it.
    #[cfg(feature = "native")]
    pub fn open(config: &SerialConfig, options: ConnectionOptions) -> Result<Self> {
        info!(
            "Opening {} at {} baud",
            config.port_name, config.baud_rate
        );
        let mut port = NativePort::open(config)?;
        port.clear_buffers()?;
        let reader = port.try_clone()?;
        Self::new(reader, port, options)
    }

    /// Handles to the demultiplexed sub-streams.
    pub fn streams(&self) -> &SubStreams {
        &self.streams
    }

    /// Options in use.
    pub fn options(&self) -> &ConnectionOptions {
        self.engine.options()
    }

    /// Call `callback` for every debug line.
    pub fn on_debug<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.streams.debug.every(move |line: &String| callback(line));
    }

    /// Call `callback` for every raw chunk read from the transport.
    pub fn on_raw<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.streams.raw.every(move |chunk: &Vec<u8>| callback(chunk));
    }

    /// Whether a fatal error has made this connection unusable.
    pub fn is_lost(&self) -> bool {
        self.lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn guarded<T>(&self, op: impl FnOnce(&QueryEngine) -> Result<T>) -> Result<T> {
        if let Some(reason) = self
            .lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Err(Error::ConnectionLost(reason.clone()));
        }

        op(&self.engine).inspect_err(|e| {
            if e.is_fatal() {
                warn!("Connection is no longer usable: {e}");
                *self.lost.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            }
        })
    }

    /// Send a text query and return its verified response.
    pub fn query(&self, body: &str) -> Result<SkaleneResponse> {
        self.guarded(|engine| engine.query(body))
    }

    /// Send a bootloader frame and return the expected response code.
    pub fn query_bootloader(&self, frame: &BootloaderFrame) -> Result<u8> {
        self.guarded(|engine| engine.query_bootloader(frame))
    }

    fn command(&self, code: CommandCode) -> Result<SkaleneResponse> {
        self.query(&code.body(iter::empty::<u8>()))
    }

    /// Flash a firmware image.
    pub fn flash(
        &self,
        image: &[u8],
        options: &FlashOptions,
        progress: &mut dyn FnMut(FlashStage, usize, usize),
    ) -> Result<()> {
        let mut session = FlashSession::new(image, options)?;
        info!(
            "Flashing {} bytes ({} blocks) at 0x{:08X}",
            image.len(),
            session.block_count(),
            session.address()
        );
        self.guarded(|engine| session.run(engine, progress))
    }

    /// Read the device configuration.
    pub fn get_config(&self) -> Result<DeviceConfig> {
        let response = self.command(CommandCode::GetConfig)?;
        DeviceConfig::from_tokens(&response.fields())
    }

    /// Validate and write the device configuration.
    pub fn set_config(&self, config: &DeviceConfig) -> Result<()> {
        config.validate().map_err(Error::InvalidConfig)?;
        self.query(&config.to_wire_body()).map(drop)
    }

    /// Change only the integration time (ms).
    pub fn set_integration(&self, millis: u32) -> Result<()> {
        if !INTEGRATION_TIME_RANGE.contains(&i64::from(millis)) {
            return Err(Error::InvalidConfig(ConfigErrors::single(
                "integrationTime",
                format!(
                    "invalid value {millis}, must be between {} and {}",
                    INTEGRATION_TIME_RANGE.start(),
                    INTEGRATION_TIME_RANGE.end()
                ),
            )));
        }
        self.query(&CommandCode::SetIntegration.body([millis]))
            .map(drop)
    }

    /// Start a measurement.
    pub fn start(&self) -> Result<()> {
        self.command(CommandCode::Start).map(drop)
    }

    /// Stop a measurement.
    pub fn stop(&self) -> Result<()> {
        self.command(CommandCode::Stop).map(drop)
    }

    /// Reboot the device into its bootloader.
    pub fn enter_bootloader(&self) -> Result<()> {
        self.command(CommandCode::BootloaderMode).map(drop)
    }

    /// Per-channel results of the last measurement.
    pub fn get_results(&self) -> Result<Vec<f64>> {
        let response = self.command(CommandCode::GetResults)?;
        channel_fields(&response)?
            .iter()
            .map(|token| {
                token.parse::<f64>().map_err(|_| {
                    Error::Protocol(format!("invalid result {token:?} in {:?}", response.body()))
                })
            })
            .collect()
    }

    /// Current channel readings.
    pub fn get_live_data(&self) -> Result<Vec<String>> {
        let response = self.command(CommandCode::GetLiveData)?;
        Ok(channel_fields(&response)?
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    /// Samples of one raw data block.
    pub fn read_raw_block(&self, index: u8) -> Result<Vec<String>> {
        let response = self.query(&CommandCode::RawBlock.body([index]))?;
        let fields = response.fields();
        if fields.len() < 3 {
            return Err(Error::Protocol(format!(
                "raw block {index} reply too short: {:?}",
                response.body()
            )));
        }
        Ok(fields[2..fields.len() - 1]
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    /// Read all raw data blocks in order.
    ///
    /// `progress` receives `(blocks_done, total_blocks)`.
    pub fn read_raw_data(&self, progress: &mut dyn FnMut(usize, usize)) -> Result<RawData> {
        let mut samples = Vec::new();
        for index in 0..=u8::MAX {
            samples.extend(self.read_raw_block(index)?);
            progress(usize::from(index) + 1, RAW_BLOCK_COUNT);
        }
        debug!("Read {} raw samples", samples.len());
        Ok(RawData::new(samples))
    }
}

fn channel_fields(response: &SkaleneResponse) -> Result<Vec<&str>> {
    let fields = response.fields();
    if fields.len() <= CHANNEL_COUNT {
        return Err(Error::Protocol(format!(
            "expected {CHANNEL_COUNT} channel values in {:?}",
            response.body()
        )));
    }
    Ok(fields[1..=CHANNEL_COUNT].to_vec())
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Reader thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::{self, reply, text_device};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_connection_is_send_sync() {
        assert_send_sync::<Connection>();
    }

    #[test]
    fn test_query_roundtrip() {
        let (conn, handle) = mock::connection(
            text_device(|body| (body == "5").then(|| "5 0".to_string())),
            ConnectionOptions::for_tests(),
        );
        conn.start().unwrap();
        assert_eq!(handle.written_bodies(), vec!["5"]);
    }

    #[test]
    fn test_device_error_is_not_fatal() {
        let (conn, _handle) = mock::connection(
            text_device(|_| Some("3 2".to_string())),
            ConnectionOptions::for_tests(),
        );
        let err = conn.query("3").unwrap_err();
        assert!(matches!(err, Error::DeviceError { code: 2, .. }));
        assert!(!conn.is_lost());
    }

    #[test]
    fn test_resend_until_answered() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let (conn, handle) = mock::connection(
            text_device(move |_| {
                // Ignore the first request, answer the resend.
                (a.fetch_add(1, Ordering::SeqCst) >= 1).then(|| "7 0".to_string())
            }),
            ConnectionOptions::for_tests(),
        );

        conn.stop().unwrap();
        assert_eq!(handle.written_bodies(), vec!["7", "7"]);
    }

    #[test]
    fn test_query_times_out_after_resends() {
        let (conn, handle) = mock::connection(text_device(|_| None), ConnectionOptions::for_tests());

        let started = Instant::now();
        let err = conn.query("9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(800));
        assert!(handle.written_bodies().len() >= 5);
        assert!(!conn.is_lost());
    }

    #[test]
    fn test_duplicate_answers_do_not_leak_into_next_query() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let (conn, handle) = mock::connection(
            move |payload: &[u8]| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                let line = String::from_utf8_lossy(payload);
                match n {
                    // First request is lost.
                    0 => Vec::new(),
                    // The resend is answered twice: once for each copy sent.
                    1 => vec![reply("3 old 0"), reply("3 old 0")],
                    _ if line.starts_with("17") => {
                        vec![reply("17 1 2 3 4 5 6 7 8 0")]
                    },
                    _ => Vec::new(),
                }
            },
            ConnectionOptions::for_tests(),
        );

        assert_eq!(conn.query("3").unwrap().body(), "3 old 0");
        let live = conn.get_live_data().unwrap();
        assert_eq!(live, vec!["1", "2", "3", "4", "5", "6", "7", "8"]);
        assert_eq!(handle.written_bodies(), vec!["3", "3", "17"]);
    }

    fn live_reply() -> String {
        "17 1 2 3 4 5 6 7 8 0".to_string()
    }

    #[test]
    fn test_slow_answers_to_every_copy_do_not_leak() {
        // Slower than the resend interval, so both copies of "3" get answered.
        let (conn, handle) = mock::slow_text_connection(
            |body| match body {
                "3" => Some((Duration::from_millis(120), "3 stale 0".to_string())),
                "17" => Some((Duration::from_millis(120), live_reply())),
                _ => None,
            },
            ConnectionOptions::for_tests(),
        );

        assert_eq!(conn.query("3").unwrap().body(), "3 stale 0");
        let live = conn.get_live_data().unwrap();
        assert_eq!(live, vec!["1", "2", "3", "4", "5", "6", "7", "8"]);
        assert!(handle.written_bodies().starts_with(&["3".to_string(), "3".to_string()]));
    }

    #[test]
    fn test_answers_after_timeout_do_not_leak() {
        let (conn, handle) = mock::slow_text_connection(
            |body| match body {
                "3" => Some((Duration::from_millis(850), "3 stale 0".to_string())),
                "17" => Some((Duration::from_millis(20), live_reply())),
                _ => None,
            },
            ConnectionOptions::for_tests(),
        );

        let err = conn.query("3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!conn.is_lost());

        let live = conn.get_live_data().unwrap();
        assert_eq!(live, vec!["1", "2", "3", "4", "5", "6", "7", "8"]);
        assert_eq!(handle.written_bodies().last().map(String::as_str), Some("17"));
    }

    #[test]
    fn test_body_with_separator_is_rejected_before_sending() {
        let (conn, handle) = mock::connection(
            text_device(|_| Some("3 0".to_string())),
            ConnectionOptions::for_tests(),
        );
        for body in ["3:1", "3\r", "3\n5"] {
            let err = conn.query(body).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{body:?}: {err}");
        }
        assert!(handle.written().is_empty());
        assert!(!conn.is_lost());
    }

    #[test]
    fn test_concurrent_queries_get_their_own_responses() {
        let (conn, _handle) = mock::connection(
            text_device(|body| {
                let index = body.split(' ').nth(1)?;
                Some(format!("11 {index} {index}a {index}b 0"))
            }),
            ConnectionOptions::for_tests(),
        );
        let conn = Arc::new(conn);

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let samples = conn.read_raw_block(i).unwrap();
                        assert_eq!(samples, vec![format!("{i}a"), format!("{i}b")]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_debug_lines_reach_callback_not_queries() {
        let (conn, handle) = mock::connection(
            text_device(|_| Some("5 0".to_string())),
            ConnectionOptions::for_tests(),
        );
        let lines = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&lines);
        conn.on_debug(move |line| l.lock().unwrap().push(line.to_string()));

        handle.inject(b"16 booting\r\n");
        conn.start().unwrap();

        assert_eq!(*lines.lock().unwrap(), vec!["16 booting"]);
    }

    #[test]
    fn test_on_raw_sees_every_chunk() {
        let (conn, handle) = mock::connection(text_device(|_| None), ConnectionOptions::for_tests());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        conn.on_raw(move |chunk| {
            s.fetch_add(chunk.len(), Ordering::SeqCst);
        });

        handle.inject(&[1, 2, 3]);
        handle.inject(&[4]);
        let deadline = Instant::now() + Duration::from_secs(1);
        while seen.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_stream_closed_poisons_connection() {
        let (conn, handle) = mock::connection(text_device(|_| None), ConnectionOptions::for_tests());
        handle.disconnect();

        let err = conn.query("3").unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(conn.is_lost());
        assert!(matches!(conn.query("3"), Err(Error::ConnectionLost(_))));
    }

    #[test]
    fn test_get_config() {
        let (conn, _handle) = mock::connection(
            text_device(|_| Some("3 100 50 250 0 1 10 20 30 40 50 60 70 80 0".to_string())),
            ConnectionOptions::for_tests(),
        );
        let config = conn.get_config().unwrap();
        assert_eq!(config.integration_time, 250);
        assert_eq!(config.leds[7], 80);
    }

    #[test]
    fn test_set_config_validates_before_sending() {
        let (conn, handle) = mock::connection(
            text_device(|_| Some("1 0".to_string())),
            ConnectionOptions::for_tests(),
        );
        let mut config = DeviceConfig {
            window_size: 100,
            discharge_time: 50,
            integration_time: 250,
            start_trigger: 0,
            stop_trigger: 1,
            leds: [0; 8],
        };
        conn.set_config(&config).unwrap();

        config.stop_trigger = 2;
        assert!(matches!(
            conn.set_config(&config),
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(handle.written_bodies(), vec!["1 100 50 250 0 1 0 0 0 0 0 0 0 0"]);
    }

    #[test]
    fn test_set_integration_range() {
        let (conn, handle) = mock::connection(
            text_device(|_| Some("21 0".to_string())),
            ConnectionOptions::for_tests(),
        );
        conn.set_integration(500).unwrap();
        assert!(conn.set_integration(49).is_err());
        assert!(conn.set_integration(5001).is_err());
        assert_eq!(handle.written_bodies(), vec!["21 500"]);
    }

    #[test]
    fn test_get_results() {
        let (conn, _handle) = mock::connection(
            text_device(|_| Some("9 1.5 2 3 4 5 6 7 8.25 0".to_string())),
            ConnectionOptions::for_tests(),
        );
        let results = conn.get_results().unwrap();
        assert_eq!(results.len(), CHANNEL_COUNT);
        assert!((results[0] - 1.5).abs() < f64::EPSILON);
        assert!((results[7] - 8.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_read_raw_data() {
        let (conn, _handle) = mock::connection(
            text_device(|body| {
                let index = body.split(' ').nth(1)?;
                let samples: Vec<String> = (0..8).map(|c| format!("{index}.{c}")).collect();
                Some(format!("11 {index} {} 0", samples.join(" ")))
            }),
            ConnectionOptions::for_tests(),
        );

        let mut last = (0, 0);
        let data = conn.read_raw_data(&mut |done, total| last = (done, total)).unwrap();
        assert_eq!(last, (256, 256));
        assert_eq!(data.len(), 256 * 8);
        assert_eq!(data.samples()[8], "1.0");

        let csv = data.to_csv();
        let mut lines = csv.split("\r\n");
        assert_eq!(
            lines.next(),
            Some("Channel 1, Channel 2, Channel 3, Channel 4, Channel 5, Channel 6, Channel 7, Channel 8")
        );
        assert_eq!(lines.next(), Some("0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7"));
    }

    #[test]
    fn test_csv_partial_last_row() {
        let data = RawData::new((0..10).map(|i| i.to_string()).collect());
        let csv = data.to_csv();
        assert!(csv.ends_with("8, 9\r\n"));
        assert_eq!(csv.matches("\r\n").count(), 3);
    }
}
