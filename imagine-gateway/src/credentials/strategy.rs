//! Selection policies over the available credentials.
//!
//! All functions take the usage records of the available set in list order
//! and return an index into it. Ties go to the earliest entry. None of them
//! suspend.

use super::types::{RotationStrategy, UsageRecord};

/// Inputs that are not part of the usage records.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub daily_limit: u32,
    pub now: i64,
    /// Rotation counter value for this call.
    pub cursor: u64,
    /// Uniform draw in `[0, 1)` for the weighted policy.
    pub draw: f64,
}

/// Pick an index into `available` (non-empty) according to `strategy`.
pub fn select_index(
    strategy: RotationStrategy,
    available: &[UsageRecord],
    ctx: &SelectionContext,
) -> usize {
    debug_assert!(!available.is_empty());
    match strategy {
        RotationStrategy::RoundRobin => round_robin(available.len(), ctx.cursor),
        RotationStrategy::LeastUsed => least_used(available),
        RotationStrategy::LeastRecent => least_recent(available),
        RotationStrategy::Weighted => weighted(available, ctx.daily_limit, ctx.draw),
        RotationStrategy::Hybrid => hybrid(available, ctx.daily_limit, ctx.now),
    }
}

fn round_robin(len: usize, cursor: u64) -> usize {
    (cursor % len as u64) as usize
}

fn least_used(available: &[UsageRecord]) -> usize {
    let mut best = 0;
    for (i, record) in available.iter().enumerate() {
        if record.count < available[best].count {
            best = i;
        }
    }
    best
}

fn least_recent(available: &[UsageRecord]) -> usize {
    let mut best = 0;
    for (i, record) in available.iter().enumerate() {
        if record.last_used < available[best].last_used {
            best = i;
        }
    }
    best
}

fn weighted(available: &[UsageRecord], daily_limit: u32, draw: f64) -> usize {
    let weights: Vec<f64> = available
        .iter()
        .map(|record| f64::from(record.remaining(daily_limit).max(1)))
        .collect();
    let target = draw * weights.iter().sum::<f64>();

    let mut cumulative = 0.0;
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if target <= cumulative {
            return i;
        }
    }
    available.len() - 1
}

/// `remaining * (1 + time_factor)`; never used scores the maximum factor of 10.
pub fn hybrid_score(record: &UsageRecord, daily_limit: u32, now: i64) -> f64 {
    let remaining = f64::from(record.remaining(daily_limit));
    let time_factor = if record.last_used == 0 {
        10.0
    } else {
        let minutes = (now - record.last_used).max(0) as f64 / 60.0;
        (minutes * 0.1).min(10.0)
    };
    remaining * (1.0 + time_factor)
}

fn hybrid(available: &[UsageRecord], daily_limit: u32, now: i64) -> usize {
    let mut best = 0;
    let mut best_score = f64::MIN;
    for (i, record) in available.iter().enumerate() {
        let score = hybrid_score(record, daily_limit, now);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    best
}
