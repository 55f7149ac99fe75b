//! Restartable frame stream.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Streaming
//!                     ^             | read failure / end of stream
//!                     |             v
//!                     +------ Reconnecting (release, wait backoff)
//!
//! any state -> Closed (explicit close or stop signal)
//! ```
//!
//! Only the first `open` may fail the caller. After that, read failures are
//! absorbed here and retried without bound until the stop signal fires.

use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};

use super::FrameSource;
use crate::frame::Frame;
use crate::signal::StopSignal;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

#[derive(Clone, Debug)]
pub struct StreamStats {
    pub state: StreamState,
    pub locator: String,
    pub frames_read: u64,
    /// Frames read since the last successful (re)connect.
    pub frames_this_connection: u64,
    pub reconnects: u64,
    pub consecutive_failures: u32,
}

pub struct StreamReader {
    source: Box<dyn FrameSource>,
    state: StreamState,
    backoff: Duration,
    next_seq: u64,
    frames_this_connection: u64,
    reconnects: u64,
    consecutive_failures: u32,
}

impl StreamReader {
    pub fn new(source: Box<dyn FrameSource>, backoff: Duration) -> Self {
        Self {
            source,
            state: StreamState::Disconnected,
            backoff,
            next_seq: 1,
            frames_this_connection: 0,
            reconnects: 0,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Initial connect. A failure here is a startup failure for the worker.
    pub fn open(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Err(anyhow!("stream {} is closed", self.source.locator()));
        }
        self.state = StreamState::Connecting;
        match self.source.connect() {
            Ok(()) => {
                self.state = StreamState::Streaming;
                self.frames_this_connection = 0;
                log::info!("stream opened: {}", self.source.locator());
                Ok(())
            }
            Err(e) => {
                self.source.disconnect();
                self.state = StreamState::Disconnected;
                Err(e.context(format!("could not open stream {}", self.source.locator())))
            }
        }
    }

    /// Next frame in capture order, reconnecting as often as needed.
    ///
    /// Returns `None` only when `stop` fires (the reader is then closed).
    pub fn read_frame(&mut self, stop: &StopSignal) -> Option<Frame> {
        loop {
            if stop.is_stopped() {
                self.close();
                return None;
            }
            match self.state {
                StreamState::Closed => return None,
                StreamState::Streaming => {}
                StreamState::Disconnected | StreamState::Connecting | StreamState::Reconnecting => {
                    if !self.reconnect(stop) {
                        continue;
                    }
                }
            }

            match self.source.next_frame() {
                Ok(Some(image)) => {
                    let frame = Frame::new(self.next_seq, SystemTime::now(), image);
                    self.next_seq += 1;
                    self.frames_this_connection += 1;
                    self.consecutive_failures = 0;
                    return Some(frame);
                }
                Ok(None) => {
                    log::warn!(
                        "stream {} ended, reconnecting in {:?}",
                        self.source.locator(),
                        self.backoff
                    );
                    self.begin_reconnect();
                }
                Err(e) => {
                    log::warn!(
                        "could not read frame from {} ({}), reconnecting in {:?}",
                        self.source.locator(),
                        e,
                        self.backoff
                    );
                    self.begin_reconnect();
                }
            }
        }
    }

    fn begin_reconnect(&mut self) {
        self.source.disconnect();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = StreamState::Reconnecting;
    }

    /// Wait out the backoff and re-open the same locator.
    /// Returns true when the stream is streaming again.
    fn reconnect(&mut self, stop: &StopSignal) -> bool {
        if stop.wait(self.backoff) {
            return false;
        }
        self.state = StreamState::Connecting;
        match self.source.connect() {
            Ok(()) => {
                self.state = StreamState::Streaming;
                self.reconnects += 1;
                self.frames_this_connection = 0;
                log::info!(
                    "stream {} reconnected (reconnect #{})",
                    self.source.locator(),
                    self.reconnects
                );
                true
            }
            Err(e) => {
                log::warn!(
                    "reconnect to {} failed: {}; retrying in {:?}",
                    self.source.locator(),
                    e,
                    self.backoff
                );
                self.source.disconnect();
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.state = StreamState::Reconnecting;
                false
            }
        }
    }

    /// Release the connection. Terminal.
    pub fn close(&mut self) {
        if self.state != StreamState::Closed {
            self.source.disconnect();
            self.state = StreamState::Closed;
            log::info!("stream closed: {}", self.source.locator());
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == StreamState::Streaming && self.source.is_healthy()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            state: self.state,
            locator: self.source.locator().to_string(),
            frames_read: self.next_seq - 1,
            frames_this_connection: self.frames_this_connection,
            reconnects: self.reconnects,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.close();
    }
}
