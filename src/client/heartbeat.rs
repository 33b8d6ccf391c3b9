//! Heartbeat scheduling and tick-latency telemetry
//!
//! The heartbeat runs on a fixed grid anchored at the moment the connection became
//! active. A late tick fires one heartbeat and skips to the next grid point in the
//! future instead of replaying every missed slot.

/// Fixed-interval schedule with catch-up arithmetic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSchedule {
    interval_ms: u64,
    next_due_ms: u64,
}

impl HeartbeatSchedule {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            next_due_ms: 0,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn next_due_ms(&self) -> u64 {
        self.next_due_ms
    }

    /// Anchor the grid at `now_ms`, making a heartbeat due immediately
    pub fn reset(&mut self, now_ms: u64) {
        self.next_due_ms = now_ms;
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_due_ms
    }

    /// Consume the due slot: move to the first grid point strictly after `now_ms`.
    ///
    /// Returns false (and leaves the schedule alone) when nothing was due.
    pub fn fire(&mut self, now_ms: u64) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }

        let behind = now_ms - self.next_due_ms;
        let slots = behind / self.interval_ms + 1;
        self.next_due_ms += slots * self.interval_ms;
        true
    }
}

/// Tick counters accumulated between two heartbeats
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleStats {
    tick_count: u64,
    max_tick_latency_ms: u64,
    previous_tick_ms: Option<u64>,
    previous_heartbeat_ms: u64,
}

/// Values reported in a heartbeat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSummary {
    pub avg_cycle_time_ms: f64,
    pub max_cycle_time_ms: u64,
    pub tick_count: u64,
}

impl CycleStats {
    pub fn new(now_ms: u64) -> Self {
        Self {
            previous_heartbeat_ms: now_ms,
            ..Self::default()
        }
    }

    pub fn record_tick(&mut self, now_ms: u64) {
        if let Some(previous) = self.previous_tick_ms {
            let latency = now_ms.saturating_sub(previous);
            self.max_tick_latency_ms = self.max_tick_latency_ms.max(latency);
        }
        self.tick_count += 1;
        self.previous_tick_ms = Some(now_ms);
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn max_tick_latency_ms(&self) -> u64 {
        self.max_tick_latency_ms
    }

    /// Average is elapsed time since the previous heartbeat over ticks counted
    pub fn summary(&self, now_ms: u64) -> CycleSummary {
        let elapsed = now_ms.saturating_sub(self.previous_heartbeat_ms);
        let avg_cycle_time_ms = if self.tick_count == 0 {
            0.0
        } else {
            elapsed as f64 / self.tick_count as f64
        };

        CycleSummary {
            avg_cycle_time_ms,
            max_cycle_time_ms: self.max_tick_latency_ms,
            tick_count: self.tick_count,
        }
    }

    /// Start a new measurement window after a heartbeat was sent.
    ///
    /// The previous tick time is kept so the next tick's latency is still measured.
    pub fn reset(&mut self, now_ms: u64) {
        self.tick_count = 0;
        self.max_tick_latency_ms = 0;
        self.previous_heartbeat_ms = now_ms;
    }
}
