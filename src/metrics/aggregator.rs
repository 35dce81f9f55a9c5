//! Strategy-level aggregation of per-draft performance.
//!
//! Clicks and impressions are plain sums; average position is the
//! impression-weighted mean so that a draft with 10 impressions at
//! position 2 does not outweigh one with 10,000 impressions at position 40.

use crate::models::Aggregate;

/// Combine per-draft aggregates into one strategy-level aggregate.
///
/// `avg_position` is `Σ(position × impressions) / Σ(impressions)`, defined
/// as 0 when total impressions is 0. Zero is the legitimate "no data yet"
/// state for freshly published content, not an error.
pub fn aggregate(items: &[Aggregate]) -> Aggregate {
    let clicks: i64 = items.iter().map(|a| a.clicks).sum();
    let impressions: i64 = items.iter().map(|a| a.impressions).sum();
    let avg_position = if impressions == 0 {
        0.0
    } else {
        let weighted: f64 = items
            .iter()
            .map(|a| a.avg_position * a.impressions as f64)
            .sum();
        weighted / impressions as f64
    };
    Aggregate {
        clicks,
        impressions,
        avg_position,
    }
}

/// Field-wise difference against the previous snapshot's aggregate.
///
/// Returns `None` for the first snapshot in a strategy's history. Deltas
/// are signed; a drop in performance yields negative fields.
pub fn delta(current: &Aggregate, previous: Option<&Aggregate>) -> Option<Aggregate> {
    previous.map(|prev| Aggregate {
        clicks: current.clicks - prev.clicks,
        impressions: current.impressions - prev.impressions,
        avg_position: current.avg_position - prev.avg_position,
    })
}
