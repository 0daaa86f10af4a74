//! Broker client: session management and event production.
//!
//! The adapter owns the TCP session to the broker and the two threads that
//! feed the engine's work queue:
//!
//! ```text
//! broker ──TCP──► reader thread ──MessageReceived──► WorkQueue ──► engine
//!                 ticker thread ──TimerTick───────►
//! ```
//!
//! Control operations (connect, subscribe, unsubscribe, disconnect) are
//! blocking and serialised by one mutex so two threads cannot race on the
//! underlying session. Subscribe and unsubscribe wait for the broker's
//! confirmation, which the reader thread routes back over an internal
//! channel.
//!
//! Inbound messages are owned from the moment the reader decodes them: the
//! [`OwnedMessage`] moves into a work entry and ownership transfers across
//! the queue to the engine, which frees the buffer by dropping the entry.

// Rust guideline compliant 2026-02

pub mod protocol;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::engine::TopicControl;
use crate::queue::WorkQueue;
use crate::work::{OwnedMessage, WorkEntry};

use protocol::{encode_client_control, BrokerReply, ClientMessage, Frame, FrameDecoder};

/// How long a blocking control call waits for broker confirmation.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Non-failure result of a broker operation.
///
/// With `Err` as the failure arm, this preserves the adapter's three
/// observable outcomes: done, nothing to do, failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed.
    Done,
    /// The operation was a no-op in the current state (e.g. disconnecting
    /// with no session).
    NothingToDo,
}

// ─── Session state ─────────────────────────────────────────────────────────

/// Live broker session: write half plus the confirmation channel fed by the
/// reader thread.
struct Session {
    stream: TcpStream,
    replies: mpsc::Receiver<BrokerReply>,
    reader: Option<thread::JoinHandle<()>>,
}

/// Running 1-Hz tick source.
struct Ticker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Client for the message broker, producing work entries onto a queue.
pub struct BrokerAdapter {
    queue: Arc<WorkQueue>,
    session: Mutex<Option<Session>>,
    ticker: Mutex<Option<Ticker>>,
}

impl std::fmt::Debug for BrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let connected = self
            .session
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false);
        let ticking = self.ticker.lock().map(|t| t.is_some()).unwrap_or(false);
        f.debug_struct("BrokerAdapter")
            .field("connected", &connected)
            .field("ticking", &ticking)
            .finish_non_exhaustive()
    }
}

impl BrokerAdapter {
    /// Create an adapter that pushes its events onto `queue`.
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            queue,
            session: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    // ── Session lifecycle ───────────────────────────────────────────────────

    /// Connect to the broker at `host` and authenticate. Blocking.
    ///
    /// Performs the TCP connect and the login handshake, then starts the
    /// background reader thread. Returns `NothingToDo` if already connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect, the handshake write/read, or the
    /// thread spawn fails, or the broker rejects the login.
    pub fn connect(&self, host: &str, vpn: &str, username: &str, password: &str) -> Result<Outcome> {
        let mut guard = self.session.lock().expect("broker session mutex poisoned");
        if guard.is_some() {
            return Ok(Outcome::NothingToDo);
        }

        let mut stream = TcpStream::connect(host)
            .with_context(|| format!("failed to connect to broker at {host}"))?;
        stream
            .set_read_timeout(Some(CONFIRM_TIMEOUT))
            .context("failed to set broker read timeout")?;

        let login = ClientMessage::Login {
            vpn: vpn.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        };
        stream
            .write_all(&encode_client_control(&login))
            .context("failed to send Login")?;

        let mut decoder = FrameDecoder::new();
        match read_frame_sync(&mut stream, &mut decoder)? {
            Frame::BrokerControl(BrokerReply::LoginOk) => {}
            Frame::BrokerControl(BrokerReply::Error { message }) => {
                bail!("broker rejected login: {message}")
            }
            other => bail!("unexpected broker response to Login: {other:?}"),
        }

        // The reader thread takes over all reads, keeping any bytes the
        // handshake already buffered in the decoder.
        let (reply_tx, reply_rx) = mpsc::channel();
        let reader_stream = stream
            .try_clone()
            .context("failed to clone broker socket for reader thread")?;
        let queue = Arc::clone(&self.queue);
        let reader = thread::Builder::new()
            .name("broker-reader".to_owned())
            .spawn(move || reader_loop(reader_stream, decoder, queue, reply_tx))
            .context("failed to spawn broker reader thread")?;

        *guard = Some(Session {
            stream,
            replies: reply_rx,
            reader: Some(reader),
        });
        log::info!("connected to broker at {host} (vpn '{vpn}', user '{username}')");
        Ok(Outcome::Done)
    }

    /// Close the session and join the reader thread.
    ///
    /// Returns `NothingToDo` if no session exists.
    ///
    /// # Errors
    ///
    /// Infallible today; the result keeps the three-valued contract.
    pub fn disconnect(&self) -> Result<Outcome> {
        let mut guard = self.session.lock().expect("broker session mutex poisoned");
        let Some(mut session) = guard.take() else {
            return Ok(Outcome::NothingToDo);
        };
        let _ = session.stream.shutdown(Shutdown::Both);
        if let Some(reader) = session.reader.take() {
            let _ = reader.join();
        }
        log::info!("disconnected from broker");
        Ok(Outcome::Done)
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    /// Subscribe to `topic`, blocking until the broker confirms.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists, the send fails, the broker
    /// rejects the subscription, or confirmation times out.
    pub fn subscribe(&self, topic: &str) -> Result<Outcome> {
        self.topic_request(
            topic,
            ClientMessage::Subscribe {
                topic: topic.to_owned(),
            },
        )
    }

    /// Unsubscribe from `topic`, blocking until the broker confirms.
    ///
    /// # Errors
    ///
    /// Same contract as [`BrokerAdapter::subscribe`].
    pub fn unsubscribe(&self, topic: &str) -> Result<Outcome> {
        self.topic_request(
            topic,
            ClientMessage::Unsubscribe {
                topic: topic.to_owned(),
            },
        )
    }

    fn topic_request(&self, topic: &str, msg: ClientMessage) -> Result<Outcome> {
        let mut guard = self.session.lock().expect("broker session mutex poisoned");
        let Some(session) = guard.as_mut() else {
            bail!("not connected to broker");
        };

        session
            .stream
            .write_all(&encode_client_control(&msg))
            .with_context(|| format!("failed to send control request for topic '{topic}'"))?;

        match session.replies.recv_timeout(CONFIRM_TIMEOUT) {
            Ok(BrokerReply::Ack) => Ok(Outcome::Done),
            Ok(BrokerReply::Error { message }) => {
                bail!("broker rejected request for topic '{topic}': {message}")
            }
            Ok(other) => bail!("unexpected broker reply for topic '{topic}': {other:?}"),
            Err(_) => bail!("timed out waiting for broker confirmation on topic '{topic}'"),
        }
    }

    // ── Tick source ─────────────────────────────────────────────────────────

    /// Start the periodic tick thread pushing [`WorkEntry::TimerTick`] every
    /// `period`. Returns `NothingToDo` if already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start_tick_timer(&self, period: Duration) -> Result<Outcome> {
        let mut guard = self.ticker.lock().expect("broker ticker mutex poisoned");
        if guard.is_some() {
            return Ok(Outcome::NothingToDo);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let queue = Arc::clone(&self.queue);
        let handle = thread::Builder::new()
            .name("broker-ticker".to_owned())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    if flag.load(Ordering::Relaxed) {
                        break;
                    }
                    queue.push(WorkEntry::TimerTick);
                }
                log::debug!("[broker-ticker] thread exiting");
            })
            .context("failed to spawn broker ticker thread")?;

        *guard = Some(Ticker { stop, handle });
        Ok(Outcome::Done)
    }

    /// Stop the tick thread. Returns `NothingToDo` if it is not running.
    ///
    /// Blocks up to one period while the thread notices the stop flag.
    ///
    /// # Errors
    ///
    /// Infallible today; the result keeps the three-valued contract.
    pub fn stop_tick_timer(&self) -> Result<Outcome> {
        let mut guard = self.ticker.lock().expect("broker ticker mutex poisoned");
        let Some(ticker) = guard.take() else {
            return Ok(Outcome::NothingToDo);
        };
        ticker.stop.store(true, Ordering::Relaxed);
        let _ = ticker.handle.join();
        Ok(Outcome::Done)
    }
}

impl TopicControl for BrokerAdapter {
    fn unsubscribe(&self, topic: &str) -> Result<Outcome> {
        BrokerAdapter::unsubscribe(self, topic)
    }
}

// ─── Reader thread ─────────────────────────────────────────────────────────

/// Read one complete frame, accumulating bytes into `decoder`.
fn read_frame_sync(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Result<Frame> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).context("failed to read from broker")?;
        if n == 0 {
            bail!("broker closed connection unexpectedly");
        }
        let frames = decoder.feed(&buf[..n])?;
        if let Some(frame) = frames.into_iter().next() {
            return Ok(frame);
        }
    }
}

/// Background loop: decode broker frames, transfer message ownership onto
/// the work queue, route control replies to the blocking caller.
///
/// Exits silently when the stream closes.
fn reader_loop(
    mut stream: TcpStream,
    mut decoder: FrameDecoder,
    queue: Arc<WorkQueue>,
    reply_tx: mpsc::Sender<BrokerReply>,
) {
    // The reader should block until data arrives; the handshake timeout no
    // longer applies.
    let _ = stream.set_read_timeout(None);
    let mut buf = [0u8; 8192];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break, // broker closed or error
            Ok(n) => n,
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("[broker-reader] decode error: {e}");
                break;
            }
        };
        for frame in frames {
            match frame {
                Frame::Message { topic, payload } => {
                    queue.push(WorkEntry::MessageReceived {
                        message: OwnedMessage::new(topic, payload),
                    });
                }
                Frame::BrokerControl(reply) => {
                    // Receiver gone means no control call is waiting; the
                    // reply is stale and dropping it is fine.
                    let _ = reply_tx.send(reply);
                }
                Frame::ClientControl(_) => {
                    log::debug!("[broker-reader] ignoring client-direction frame");
                }
            }
        }
    }
    log::debug!("[broker-reader] thread exiting");
}

// ─── Tests ─────────────────────────────────────────────────────────────────
