//! Wall-clock reconstruction for EEG packets.
//!
//! Muse frames carry only a 16-bit packet index. A [`TimestampTracker`]
//! anchors the first index it sees to the current time and extrapolates
//! every later packet from the index delta and the sample rate, so BLE
//! delivery jitter does not leak into the timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{EEG_FREQUENCY, EEG_SAMPLES_PER_READING};

/// A backward jump larger than this is treated as counter wrap-around.
const WRAP_THRESHOLD: i64 = 0x1000;

pub(crate) fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64() * 1000.0)
}

/// Per-channel timestamp anchor. One per electrode, owned by the session.
#[derive(Debug, Clone)]
pub struct TimestampTracker {
    /// Duration of one packet in ms.
    reading_ms: f64,
    /// `(index, timestamp_ms)` of the newest packet seen so far.
    anchor: Option<(u16, f64)>,
}

impl Default for TimestampTracker {
    fn default() -> Self {
        Self::new(EEG_SAMPLES_PER_READING, EEG_FREQUENCY)
    }
}

impl TimestampTracker {
    pub fn new(samples_per_reading: usize, frequency: f64) -> Self {
        Self {
            reading_ms: 1000.0 * samples_per_reading as f64 / frequency,
            anchor: None,
        }
    }

    /// Timestamp (ms since epoch) of the first sample in packet `index`.
    pub fn get(&mut self, index: u16) -> f64 {
        self.get_at(index, now_ms())
    }

    /// Same as [`get`](Self::get) with an explicit clock reading.
    ///
    /// The first packet is back-dated by one reading so the timestamp marks
    /// the start of its window rather than its arrival.
    pub fn get_at(&mut self, index: u16, now: f64) -> f64 {
        let (last_index, last_ts) = *self
            .anchor
            .get_or_insert((index, now - self.reading_ms));

        let last = i64::from(last_index);
        let mut idx = i64::from(index);
        while last - idx > WRAP_THRESHOLD {
            idx += 0x10000;
        }

        if idx > last {
            let ts = last_ts + self.reading_ms * (idx - last) as f64;
            self.anchor = Some((index, ts));
            ts
        } else {
            // Duplicate or late packet: back-date without moving the anchor.
            last_ts - self.reading_ms * (last - idx) as f64
        }
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 12 samples at 256 Hz.
    const READING_MS: f64 = 46.875;

    #[test]
    fn test_first_packet_back_dated() {
        let mut t = TimestampTracker::default();
        assert_eq!(t.get_at(100, 10_000.0), 10_000.0 - READING_MS);
    }

    #[test]
    fn test_forward_progress_uses_index_delta() {
        let mut t = TimestampTracker::default();
        let first = t.get_at(10, 5_000.0);
        // Arrival time is ignored after anchoring.
        assert_eq!(t.get_at(12, 9_999.0), first + 2.0 * READING_MS);
        assert_eq!(t.get_at(13, 0.0), first + 3.0 * READING_MS);
    }

    #[test]
    fn test_duplicate_and_late_packets() {
        let mut t = TimestampTracker::default();
        let first = t.get_at(50, 1_000.0);
        assert_eq!(t.get_at(50, 2_000.0), first);
        assert_eq!(t.get_at(48, 2_000.0), first - 2.0 * READING_MS);
        // Anchor unchanged by the late packet.
        assert_eq!(t.get_at(51, 2_000.0), first + READING_MS);
    }

    #[test]
    fn test_wrap_around() {
        let mut t = TimestampTracker::default();
        let first = t.get_at(0xffff, 1_000.0);
        assert_eq!(t.get_at(0x0001, 1_000.0), first + 2.0 * READING_MS);
    }

    #[test]
    fn test_reset_reanchors() {
        let mut t = TimestampTracker::default();
        t.get_at(7, 1_000.0);
        t.reset();
        assert_eq!(t.get_at(500, 3_000.0), 3_000.0 - READING_MS);
    }
}
