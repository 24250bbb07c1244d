//! Per-header cache of GATT read outcomes with exponential back-off.
//!
//! Reading a remote advertisement GATT server is expensive, so the tracker
//! keeps one `AdvertisementReadResult` per advertisement header and consults
//! it before issuing another read. Failures back off exponentially; a success
//! parks the header until its advertisements are evicted.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::time::{Clock, Duration, Instant};

/// The initial back-off after a failed read.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// How much the back-off grows with every repeated failure.
const BACKOFF_MULTIPLIER: u64 = 2;

/// The ceiling on the back-off between reads.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Outcome of the most recent read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStatus {
    Unknown,
    Success,
    Failure,
}

/// What the tracker should do with a newly sighted header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// The advertisement was already read; no reason to read again.
    PreviouslySucceeded,
    /// The last attempt failed and its back-off window is still open.
    TooSoon,
    /// Go ahead and read.
    Retry,
}

/// The cached outcome of GATT reads against one advertisement header.
pub struct AdvertisementReadResult {
    clock: Arc<dyn Clock>,
    advertisements: BTreeMap<u8, Bytes>,
    backoff: Duration,
    last_read_at: Instant,
    status: ReadStatus,
}

impl AdvertisementReadResult {
    /// Creates an empty read result.
    ///
    /// The last-read instant starts a full back-off cap in the past, so the
    /// first [`evaluate_retry`](Self::evaluate_retry) always reports
    /// [`RetryStatus::Retry`] and the first sighting reads unconditionally.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let last_read_at = clock.now() - MAX_BACKOFF;
        Self {
            clock,
            advertisements: BTreeMap::new(),
            backoff: BASE_BACKOFF,
            last_read_at,
            status: ReadStatus::Unknown,
        }
    }

    /// Stores (or replaces) the advertisement read from `slot`.
    ///
    /// Separate from [`record_last_read_status`](Self::record_last_read_status)
    /// because a read can fail overall and still have produced some slots.
    pub fn add_advertisement(&mut self, slot: u8, advertisement: Bytes) {
        self.advertisements.insert(slot, advertisement);
    }

    /// Whether `slot` holds an advertisement.
    pub fn has_advertisement(&self, slot: u8) -> bool {
        self.advertisements.contains_key(&slot)
    }

    /// All advertisements read so far, in slot order.
    pub fn advertisements(&self) -> Vec<Bytes> {
        self.advertisements.values().cloned().collect()
    }

    /// Records the outcome of a read attempt and recomputes the back-off.
    pub fn record_last_read_status(&mut self, success: bool) {
        self.last_read_at = self.clock.now();

        if success {
            self.backoff = BASE_BACKOFF;
        } else if self.status == ReadStatus::Failure {
            // Already failing, widen the window.
            self.backoff = Duration::from_millis(
                self.backoff.as_millis().saturating_mul(BACKOFF_MULTIPLIER),
            )
            .min(MAX_BACKOFF);
        } else {
            self.backoff = BASE_BACKOFF;
        }

        self.status = if success {
            ReadStatus::Success
        } else {
            ReadStatus::Failure
        };
    }

    /// Decides whether a fresh read is warranted right now.
    pub fn evaluate_retry(&self) -> RetryStatus {
        if self.status == ReadStatus::Success {
            return RetryStatus::PreviouslySucceeded;
        }
        if self.clock.now() - self.last_read_at < self.backoff {
            return RetryStatus::TooSoon;
        }
        RetryStatus::Retry
    }
}
