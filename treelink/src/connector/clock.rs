//! Peer clock estimation.
//!
//! Times are microseconds since the Unix epoch. Local time comes from a
//! process-wide [`minstant::Anchor`], so it is monotonic within a process
//! and comparable with a peer running the same scheme.
//!
//! Each sample is one time-sync exchange: round-trip time, the peer's clock
//! when it answered, and our clock when the answer arrived. The peer read its
//! clock roughly half a round trip before we received the answer, so
//!
//! ```text
//! offset = peer_clock - (local_receive - avg_rtt / 2)
//! ```
//!
//! Round trips inflated by scheduling or radio wake-up would skew that
//! estimate, so samples far above the window median are discarded.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;

use minstant::{Anchor, Instant};

/// Samples this many times the window median are outliers.
const OUTLIER_FACTOR: u32 = 4;

/// Median is only trusted once the window holds this many samples.
const MIN_SAMPLES_FOR_REJECTION: usize = 3;

/// Current local time in microseconds since the Unix epoch.
#[must_use]
pub fn wall_micros() -> i64 {
    static ANCHOR: OnceLock<Anchor> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Anchor::new);
    (Instant::now().as_unix_nanos(anchor) / 1_000) as i64
}

#[derive(Debug, Clone)]
pub struct ClockEstimate {
    window: VecDeque<Duration>,
    capacity: usize,
    offset: Option<i64>,
    rejected_in_a_row: usize,
}

impl ClockEstimate {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "clock window must hold at least one sample");
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            offset: None,
            rejected_in_a_row: 0,
        }
    }

    /// Adds one exchange. `peer_clock == None` ("never") clears the estimate.
    ///
    /// Returns the new offset if the sample was used.
    pub fn add_sample(
        &mut self,
        rtt: Duration,
        peer_clock: Option<i64>,
        local_receive: i64,
    ) -> Option<i64> {
        let Some(peer_clock) = peer_clock else {
            self.clear();
            return None;
        };

        if self.is_outlier(rtt) {
            self.rejected_in_a_row += 1;
            // A sustained shift is the new normal (route change, congestion),
            // not noise: start over from this sample.
            if self.rejected_in_a_row < self.capacity.max(MIN_SAMPLES_FOR_REJECTION) {
                return None;
            }
            self.window.clear();
        }
        self.rejected_in_a_row = 0;

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(rtt);
        if !self.screen_window() {
            return None;
        }

        let half_rtt = (self.average_rtt()?.as_micros() / 2) as i64;
        let offset = peer_clock - (local_receive - half_rtt);
        self.offset = Some(offset);
        Some(offset)
    }

    /// Outlier threshold over the window plus `candidate`, once there are
    /// enough samples for a median.
    fn outlier_limit(&self, candidate: Option<Duration>) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.window.iter().copied().chain(candidate).collect();
        if sorted.len() < MIN_SAMPLES_FOR_REJECTION {
            return None;
        }
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2] * OUTLIER_FACTOR)
    }

    fn is_outlier(&self, rtt: Duration) -> bool {
        self.outlier_limit(Some(rtt)).is_some_and(|limit| rtt > limit)
    }

    /// Drops samples that turn out to be outliers now that the window holds
    /// enough for a median. Early samples went in unscreened. Returns whether
    /// the newest sample survived.
    fn screen_window(&mut self) -> bool {
        let Some(limit) = self.outlier_limit(None) else {
            return true;
        };
        let newest_kept = self.window.back().is_some_and(|&rtt| rtt <= limit);
        self.window.retain(|&rtt| rtt <= limit);
        newest_kept
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.offset = None;
        self.rejected_in_a_row = 0;
    }

    /// `peer_clock - local_clock` in microseconds, if known.
    #[must_use]
    pub const fn offset(&self) -> Option<i64> {
        self.offset
    }

    #[must_use]
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().sum();
        Some(total / self.window.len() as u32)
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    #[must_use]
    pub fn local_to_peer(&self, local_micros: i64) -> Option<i64> {
        self.offset.map(|o| local_micros + o)
    }

    #[must_use]
    pub fn peer_to_local(&self, peer_micros: i64) -> Option<i64> {
        self.offset.map(|o| peer_micros - o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn offset_accounts_for_half_round_trip() {
        let mut clock = ClockEstimate::new(4);
        // Peer is 1s ahead; 10ms round trip, answered 5ms before receipt.
        let offset = clock.add_sample(10 * MS, Some(1_000_000 + 95_000), 100_000);
        assert_eq!(offset, Some(1_000_000));
        assert_eq!(clock.local_to_peer(0), Some(1_000_000));
        assert_eq!(clock.peer_to_local(1_000_000), Some(0));
    }

    #[test]
    fn outlier_is_excluded_from_window() {
        let mut clock = ClockEstimate::new(8);
        for _ in 0..5 {
            clock.add_sample(2 * MS, Some(0), 0);
        }
        assert_eq!(clock.add_sample(20 * MS, Some(0), 0), None);
        assert_eq!(clock.sample_count(), 5);
        assert_eq!(clock.average_rtt(), Some(2 * MS));

        clock.add_sample(4 * MS, Some(0), 0);
        assert_eq!(clock.sample_count(), 6);
    }

    #[test]
    fn early_outlier_is_screened_out() {
        let mut clock = ClockEstimate::new(8);
        clock.add_sample(20 * MS, Some(0), 0);
        for _ in 0..4 {
            clock.add_sample(2 * MS, Some(0), 0);
        }
        assert_eq!(clock.sample_count(), 4);
        assert_eq!(clock.average_rtt(), Some(2 * MS));
    }

    #[test]
    fn second_sample_outlier_is_screened_out() {
        let mut clock = ClockEstimate::new(8);
        clock.add_sample(2 * MS, Some(0), 0);
        clock.add_sample(20 * MS, Some(0), 0);
        for _ in 0..4 {
            clock.add_sample(2 * MS, Some(0), 0);
        }
        assert_eq!(clock.sample_count(), 5);
        assert_eq!(clock.average_rtt(), Some(2 * MS));
    }

    #[test]
    fn third_sample_outlier_is_not_used() {
        let mut clock = ClockEstimate::new(8);
        clock.add_sample(2 * MS, Some(0), 0);
        clock.add_sample(2 * MS, Some(0), 0);
        assert_eq!(clock.add_sample(20 * MS, Some(0), 0), None);
        assert_eq!(clock.sample_count(), 2);
        assert_eq!(clock.average_rtt(), Some(2 * MS));
    }

    #[test]
    fn shift_after_two_samples_is_adopted() {
        let mut clock = ClockEstimate::new(8);
        clock.add_sample(MS, Some(0), 0);
        clock.add_sample(MS, Some(0), 0);
        let accepted = (0..8)
            .filter(|_| clock.add_sample(50 * MS, Some(0), 0).is_some())
            .count();
        assert!(accepted > 0);
        assert_eq!(clock.average_rtt(), Some(50 * MS));
    }

    #[test]
    fn sustained_shift_resets_window() {
        let mut clock = ClockEstimate::new(4);
        for _ in 0..4 {
            clock.add_sample(MS, Some(0), 0);
        }
        for _ in 0..3 {
            assert_eq!(clock.add_sample(50 * MS, Some(0), 0), None);
        }
        assert!(clock.add_sample(50 * MS, Some(0), 0).is_some());
        assert_eq!(clock.average_rtt(), Some(50 * MS));
    }

    #[test]
    fn never_clears_estimate() {
        let mut clock = ClockEstimate::new(4);
        clock.add_sample(MS, Some(5), 0);
        assert!(clock.offset().is_some());
        assert_eq!(clock.add_sample(MS, None, 0), None);
        assert_eq!(clock.offset(), None);
        assert_eq!(clock.sample_count(), 0);
    }

    #[test]
    fn window_rolls() {
        let mut clock = ClockEstimate::new(2);
        clock.add_sample(MS, Some(0), 0);
        clock.add_sample(2 * MS, Some(0), 0);
        clock.add_sample(3 * MS, Some(0), 0);
        assert_eq!(clock.sample_count(), 2);
        assert_eq!(clock.average_rtt(), Some(Duration::from_micros(2500)));
    }

    #[test]
    fn wall_clock_is_monotonic_and_plausible() {
        let a = wall_micros();
        let b = wall_micros();
        assert!(b >= a);
        // After 2020-01-01.
        assert!(a > 1_577_836_800_000_000);
    }
}
