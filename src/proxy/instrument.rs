//! Client response instrumentation
//!
//! Captures what the record header needs about the outbound side of a
//! request: the status code sent, cumulative bytes written, and the
//! time-to-first-byte.

use http::StatusCode;
use std::time::Instant;

/// Meters the response flowing back to the client.
///
/// Constructed at request arrival; `ttft_ms` is the elapsed milliseconds to
/// the first observed write, or -1 if nothing was ever written.
pub struct ResponseMeter {
    status: StatusCode,
    bytes_written: u64,
    started_at: Instant,
    ttft_ms: i64,
}

impl ResponseMeter {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            bytes_written: 0,
            started_at: Instant::now(),
            ttft_ms: -1,
        }
    }

    /// Record the status sent to the client. Defaults to 200 when never set.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Record one write toward the client.
    pub fn observe_write(&mut self, bytes: usize) {
        if self.ttft_ms < 0 {
            self.ttft_ms = self.started_at.elapsed().as_millis() as i64;
        }
        self.bytes_written += bytes as u64;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn ttft_ms(&self) -> i64 {
        self.ttft_ms
    }

    /// Total elapsed milliseconds since request arrival.
    pub fn elapsed_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }
}

impl Default for ResponseMeter {
    fn default() -> Self {
        Self::new()
    }
}
