//! Per-session latency aggregates
//!
//! Aggregates are recomputed from the full per-turn sample set after every
//! completed turn and written to the owning session row.

use colloquy_core::{SessionRecord, TurnLatency};

/// Running latency samples for one session.
#[derive(Debug, Default)]
pub struct TurnStats {
    totals_ms: Vec<u32>,
}

impl TurnStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: &TurnLatency) {
        self.totals_ms.push(latency.total_ms);
    }

    pub fn count(&self) -> u32 {
        self.totals_ms.len() as u32
    }

    pub fn avg_ms(&self) -> u32 {
        if self.totals_ms.is_empty() {
            return 0;
        }
        (self.totals_ms.iter().map(|&v| v as u64).sum::<u64>() / self.totals_ms.len() as u64) as u32
    }

    pub fn percentile_ms(&self, percentile: f64) -> u32 {
        if self.totals_ms.is_empty() {
            return 0;
        }
        let mut sorted = self.totals_ms.clone();
        sorted.sort_unstable();
        let rank = ((percentile / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    /// Write the aggregates onto the session row.
    pub fn apply(&self, session: &mut SessionRecord) {
        session.total_turns = self.count();
        session.avg_latency_ms = self.avg_ms();
        session.p95_latency_ms = self.percentile_ms(95.0);
        session.p99_latency_ms = self.percentile_ms(99.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency(total_ms: u32) -> TurnLatency {
        TurnLatency {
            total_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_stats() {
        let stats = TurnStats::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.avg_ms(), 0);
        assert_eq!(stats.percentile_ms(95.0), 0);
    }

    #[test]
    fn test_aggregates() {
        let mut stats = TurnStats::new();
        for total in [100, 200, 300, 400] {
            stats.record(&latency(total));
        }
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.avg_ms(), 250);
        assert_eq!(stats.percentile_ms(99.0), 400);
    }

    #[test]
    fn test_apply_to_session() {
        let mut stats = TurnStats::new();
        stats.record(&latency(1080));
        let mut session = SessionRecord::open("s1", "u1", "a1", None, None);
        stats.apply(&mut session);
        assert_eq!(session.total_turns, 1);
        assert_eq!(session.avg_latency_ms, 1080);
        assert_eq!(session.p95_latency_ms, 1080);
    }
}
