//! Priority queue and bandwidth scheduler
//!
//! A four-level FIFO (CONTROL > VOICE > TEXT > FILE) drained under a token
//! bucket: `bandwidth_bps` tokens per second, one token per byte. Burst
//! capacity is a tenth of the rate (floored at one max-size frame), which
//! keeps any one-second window under 1.1x the configured rate. The
//! scheduler pops the highest non-empty level whose head fits the current
//! balance. Entries that sit longer than `promote_after` move up one
//! level, so a busy voice stream cannot starve file transfer forever.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use lib_crypto::PublicKey;
use lib_wire::Priority;

/// One frame waiting for emission
#[derive(Debug, Clone)]
pub struct ScheduledFrame {
    /// Encoded wire bytes, signed and ready
    pub bytes: Vec<u8>,
    /// Unicast target; `None` floods
    pub recipient: Option<PublicKey>,
    /// Arrival peer of a forwarded frame, never sent back to
    pub exclude: Option<PublicKey>,
    pub priority: Priority,
    pub queued_at: Instant,
    /// Durable queue sequence to ack on successful handoff
    pub queue_seq: Option<u64>,
    /// True for frames this node relays rather than originates
    pub forwarded: bool,
}

pub struct BandwidthScheduler {
    levels: [VecDeque<ScheduledFrame>; Priority::LEVELS],
    /// Token balance in bytes
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
    promote_after: Duration,
}

/// Share of the per-second rate available as burst; bounds the sliding
/// one-second window at 1.1x the configured bandwidth
const BURST_FRACTION: f64 = 0.1;

/// Burst floor: one maximum-size fragment plus header must always fit
const BURST_FLOOR: f64 = 70_000.0;

impl BandwidthScheduler {
    pub fn new(bandwidth_bps: u64, promote_after: Duration, now: Instant) -> Self {
        let rate = bandwidth_bps as f64;
        let burst = (rate * BURST_FRACTION).max(BURST_FLOOR);
        BandwidthScheduler {
            levels: Default::default(),
            tokens: burst,
            rate,
            burst,
            last_refill: now,
            promote_after,
        }
    }

    pub fn push(&mut self, frame: ScheduledFrame) {
        self.levels[frame.priority.index()].push_back(frame);
    }

    /// Total frames waiting across all levels
    pub fn backlog(&self) -> usize {
        self.levels.iter().map(|level| level.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|level| level.is_empty())
    }

    /// Durable queue sequences currently waiting in memory, so a replay
    /// pass does not double-schedule them
    pub fn scheduled_seqs(&self) -> std::collections::HashSet<u64> {
        self.levels
            .iter()
            .flatten()
            .filter_map(|frame| frame.queue_seq)
            .collect()
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Move aged entries up one level. Promotion preserves FIFO order
    /// within the receiving level by appending at the tail.
    fn promote_aged(&mut self, now: Instant) {
        for index in 1..Priority::LEVELS {
            while let Some(head) = self.levels[index].front() {
                if now.duration_since(head.queued_at) < self.promote_after {
                    break;
                }
                let mut frame = self.levels[index].pop_front().unwrap();
                frame.priority = frame.priority.promoted();
                frame.queued_at = now;
                self.levels[index - 1].push_back(frame);
            }
        }
    }

    /// Pop the next frame the bandwidth window admits, if any
    pub fn pop_ready(&mut self, now: Instant) -> Option<ScheduledFrame> {
        self.refill(now);
        self.promote_aged(now);

        for level in self.levels.iter_mut() {
            if let Some(head) = level.front() {
                if head.bytes.len() as f64 <= self.tokens {
                    let frame = level.pop_front().unwrap();
                    self.tokens -= frame.bytes.len() as f64;
                    return Some(frame);
                }
                // Head does not fit; a lower-priority frame must not jump
                // the window, so stop here.
                return None;
            }
        }
        None
    }

    /// How long until the head frame's tokens accrue; `None` when idle
    pub fn next_ready_in(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        let head = self.levels.iter().find_map(|level| level.front())?;
        let deficit = head.bytes.len() as f64 - self.tokens;
        if deficit <= 0.0 {
            return Some(Duration::ZERO);
        }
        Some(Duration::from_secs_f64(deficit / self.rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(priority: Priority, size: usize, now: Instant) -> ScheduledFrame {
        ScheduledFrame {
            bytes: vec![0u8; size],
            recipient: None,
            exclude: None,
            priority,
            queued_at: now,
            queue_seq: None,
            forwarded: false,
        }
    }

    #[test]
    fn test_priority_order() {
        let now = Instant::now();
        let mut sched = BandwidthScheduler::new(1_000_000, Duration::from_secs(5), now);
        sched.push(frame(Priority::File, 100, now));
        sched.push(frame(Priority::Text, 100, now));
        sched.push(frame(Priority::Control, 100, now));

        assert_eq!(sched.pop_ready(now).unwrap().priority, Priority::Control);
        assert_eq!(sched.pop_ready(now).unwrap().priority, Priority::Text);
        assert_eq!(sched.pop_ready(now).unwrap().priority, Priority::File);
        assert!(sched.pop_ready(now).is_none());
    }

    #[test]
    fn test_fifo_within_level() {
        let now = Instant::now();
        let mut sched = BandwidthScheduler::new(1_000_000, Duration::from_secs(5), now);
        let mut a = frame(Priority::Text, 10, now);
        a.queue_seq = Some(1);
        let mut b = frame(Priority::Text, 10, now);
        b.queue_seq = Some(2);
        sched.push(a);
        sched.push(b);

        assert_eq!(sched.pop_ready(now).unwrap().queue_seq, Some(1));
        assert_eq!(sched.pop_ready(now).unwrap().queue_seq, Some(2));
    }

    #[test]
    fn test_token_bucket_blocks_until_refill() {
        let now = Instant::now();
        // 100 kB/s => burst floor of 70 kB applies
        let mut sched = BandwidthScheduler::new(100_000, Duration::from_secs(60), now);
        sched.push(frame(Priority::Text, 60_000, now));
        sched.push(frame(Priority::Text, 60_000, now));

        assert!(sched.pop_ready(now).is_some());
        // 10 kB of tokens left; the second frame needs ~0.5 s of refill
        assert!(sched.pop_ready(now).is_none());
        let wait = sched.next_ready_in(now).unwrap();
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(600));

        assert!(sched.pop_ready(now + Duration::from_millis(600)).is_some());
    }

    #[test]
    fn test_emission_respects_rate_over_window() {
        let now = Instant::now();
        let rate = 1_048_576u64;
        let mut sched = BandwidthScheduler::new(rate, Duration::from_secs(60), now);
        for _ in 0..2_000 {
            sched.push(frame(Priority::File, 1_000, now));
        }

        // Any one-second window, burst included, stays under 1.1x the rate
        let mut sent = 0usize;
        let mut t = now;
        while t < now + Duration::from_secs(1) {
            while let Some(f) = sched.pop_ready(t) {
                sent += f.bytes.len();
            }
            t += Duration::from_millis(10);
        }
        assert!(sent as f64 <= rate as f64 * 1.1);
    }

    #[test]
    fn test_aging_promotion() {
        let now = Instant::now();
        let mut sched = BandwidthScheduler::new(1_000_000, Duration::from_secs(5), now);
        sched.push(frame(Priority::File, 10, now));

        // After the threshold the file frame has climbed one level
        let later = now + Duration::from_secs(6);
        sched.push(frame(Priority::Text, 10, later));

        // Promotion happens on pop; the aged File frame drains at Text level
        let first = sched.pop_ready(later).unwrap();
        let second = sched.pop_ready(later).unwrap();
        assert_eq!(first.priority, Priority::Text);
        assert_eq!(second.priority, Priority::Text);
        assert_eq!(sched.backlog(), 0);
    }

    #[test]
    fn test_control_never_waits_behind_lower_levels() {
        let now = Instant::now();
        let mut sched = BandwidthScheduler::new(1_000_000, Duration::from_secs(5), now);
        sched.push(frame(Priority::File, 500, now));
        sched.push(frame(Priority::Control, 100, now + Duration::from_millis(1)));

        let first = sched.pop_ready(now + Duration::from_millis(2)).unwrap();
        assert_eq!(first.priority, Priority::Control);
    }
}
