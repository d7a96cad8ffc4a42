//! Stall Detector.
//!
//! Keeps a short ring of screen fingerprints. The chat is stalled when the
//! last K fingerprints are identical, or when the screen has not changed for
//! longer than the configured age.

use crate::capture::Fingerprint;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Why the detector considers the chat stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StallReason {
    IdenticalFrames,
    AgeExceeded,
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallReason::IdenticalFrames => write!(f, "IdenticalFrames"),
            StallReason::AgeExceeded => write!(f, "AgeExceeded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StallState {
    Fresh,
    Stalled(StallReason),
}

impl StallState {
    pub fn is_stalled(&self) -> bool {
        matches!(self, StallState::Stalled(_))
    }
}

impl fmt::Display for StallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallState::Fresh => write!(f, "Fresh"),
            StallState::Stalled(reason) => write!(f, "Stalled({})", reason),
        }
    }
}

#[derive(Debug)]
pub struct StallDetector {
    identical_frames: usize,
    max_age: Duration,
    history: VecDeque<(Fingerprint, Instant)>,
    last_change: Option<Instant>,
    last_observed: Option<Instant>,
}

impl StallDetector {
    /// `identical_frames` is K; `max_age` is the time-without-change limit.
    pub fn new(identical_frames: usize, max_age: Duration) -> Self {
        let capacity = identical_frames.max(2);
        Self {
            identical_frames,
            max_age,
            history: VecDeque::with_capacity(capacity),
            last_change: None,
            last_observed: None,
        }
    }

    /// Ring bound: `max(K, 2)`.
    pub fn capacity(&self) -> usize {
        self.identical_frames.max(2)
    }

    /// Record the fingerprint of a new capture.
    pub fn observe(&mut self, fingerprint: Fingerprint, now: Instant) {
        let changed = self
            .history
            .back()
            .map_or(true, |(last, _)| *last != fingerprint);
        if changed || self.last_change.is_none() {
            self.last_change = Some(now);
        }

        if self.history.len() == self.capacity() {
            self.history.pop_front();
        }
        self.history.push_back((fingerprint, now));
        self.last_observed = Some(now);
    }

    /// Current verdict. `IdenticalFrames` wins when both criteria hold.
    pub fn state(&self) -> StallState {
        if self.identical_run() {
            return StallState::Stalled(StallReason::IdenticalFrames);
        }

        match (self.last_change, self.last_observed) {
            (Some(changed), Some(observed))
                if observed.saturating_duration_since(changed) >= self.max_age =>
            {
                StallState::Stalled(StallReason::AgeExceeded)
            }
            _ => StallState::Fresh,
        }
    }

    /// Forget history after progress or a reactivation.
    pub fn reset(&mut self, now: Instant) {
        self.history.clear();
        self.last_change = Some(now);
        self.last_observed = Some(now);
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Time between the last change and the last observation.
    pub fn unchanged_for(&self) -> Duration {
        match (self.last_change, self.last_observed) {
            (Some(changed), Some(observed)) => observed.saturating_duration_since(changed),
            _ => Duration::ZERO,
        }
    }

    fn identical_run(&self) -> bool {
        let k = self.identical_frames;
        if k == 0 || self.history.len() < k {
            return false;
        }
        let mut tail = self.history.iter().rev().take(k).map(|(fp, _)| fp);
        match tail.next() {
            Some(first) => tail.all(|fp| fp == first),
            None => false,
        }
    }
}
