//! Normalization of the two metrics providers into one overview shape.
//!
//! The observed provider reports a real row-per-day series that gets
//! partitioned into a previous and a current window. The estimated provider
//! only exposes monthly search-volume breakdowns, so current/previous values
//! are synthesized from the months covered by the lookback range. Both paths
//! are pure; I/O happens at the workflow layer.

use chrono::NaiveDate;

use crate::errors::MetricsError;
use crate::providers::{RankedKeyword, SearchRow};

/// Accepted lookback ranges. Anything else is an implementer error and is
/// rejected up front rather than silently defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookback {
    Days7,
    Days28,
    Days90,
}

impl Lookback {
    pub fn from_days(days: u32) -> Result<Self, MetricsError> {
        match days {
            7 => Ok(Self::Days7),
            28 => Ok(Self::Days28),
            90 => Ok(Self::Days90),
            _ => Err(MetricsError::UnsupportedLookback { days }),
        }
    }

    pub fn days(&self) -> u32 {
        match self {
            Self::Days7 => 7,
            Self::Days28 => 28,
            Self::Days90 => 90,
        }
    }
}

/// One day of observed performance.
#[derive(Debug, Clone)]
pub struct DayRow {
    pub date: NaiveDate,
    pub clicks: i64,
    pub impressions: i64,
}

/// Current/previous totals for one metric.
///
/// `previous` is `None` when the source offers no baseline for the range
/// (e.g. estimated 7-day). `change_percentage` is omitted — not zero —
/// whenever there is no usable baseline; brand-new content legitimately has
/// an empty previous window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricWindow {
    pub current: i64,
    pub previous: Option<i64>,
    pub change_percentage: Option<f64>,
}

/// The normalized overview both providers are blended into.
#[derive(Debug, Clone, PartialEq)]
pub struct OverviewMetrics {
    pub clicks: MetricWindow,
    pub impressions: MetricWindow,
}

fn change_percentage(current: f64, previous: Option<f64>) -> Option<f64> {
    match previous {
        Some(prev) if prev > 0.0 => Some((current - prev) / prev * 100.0),
        _ => None,
    }
}

fn window(current: f64, previous: Option<f64>) -> MetricWindow {
    MetricWindow {
        current: current.round() as i64,
        previous: previous.map(|p| p.round() as i64),
        change_percentage: change_percentage(current, previous),
    }
}

/// Blend an ordered row-per-day series into the overview shape.
///
/// Rows dated before `boundary` form the previous window; rows on or after
/// it form the current window. A boundary date with no rows at all still
/// splits correctly — the partition is by comparison, not by matching.
pub fn observed_overview(rows: &[DayRow], boundary: NaiveDate) -> OverviewMetrics {
    let mut current_clicks = 0i64;
    let mut current_impressions = 0i64;
    let mut previous_clicks = 0i64;
    let mut previous_impressions = 0i64;

    for row in rows {
        if row.date < boundary {
            previous_clicks += row.clicks;
            previous_impressions += row.impressions;
        } else {
            current_clicks += row.clicks;
            current_impressions += row.impressions;
        }
    }

    OverviewMetrics {
        clicks: window(current_clicks as f64, Some(previous_clicks as f64)),
        impressions: window(current_impressions as f64, Some(previous_impressions as f64)),
    }
}

/// Per-dimension passthrough row from the observed provider. No
/// current/previous split; breakdowns report one window only.
#[derive(Debug, Clone)]
pub struct DimensionRow {
    pub key: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
}

/// Reshape observed breakdown rows (query/page/country/device) into the
/// shared per-dimension form. The first key of each row is the dimension
/// value for single-dimension queries.
pub fn observed_breakdown(rows: &[SearchRow]) -> Vec<DimensionRow> {
    rows.iter()
        .map(|row| {
            let impressions = row.impressions.round() as i64;
            let clicks = row.clicks.round() as i64;
            let ctr = row.ctr.unwrap_or(if row.impressions > 0.0 {
                row.clicks / row.impressions
            } else {
                0.0
            });
            DimensionRow {
                key: row.keys.first().cloned().unwrap_or_default(),
                clicks,
                impressions,
                ctr,
            }
        })
        .collect()
}

/// Synthetic estimate for one keyword over one lookback range, before the
/// traffic ratio is applied. Impression units.
fn impression_estimate(breakdown: &[f64], lookback: Lookback) -> (f64, Option<f64>) {
    let latest = breakdown.last().copied().unwrap_or(0.0);
    match lookback {
        // One week of a month's volume.
        Lookback::Days7 => (latest / 4.0, None),
        Lookback::Days28 => {
            let previous = if breakdown.len() >= 2 {
                Some(breakdown[breakdown.len() - 2])
            } else {
                None
            };
            (latest, previous)
        }
        Lookback::Days90 => {
            let n = breakdown.len();
            let current: f64 = breakdown[n.saturating_sub(3)..].iter().sum();
            let prior_range = &breakdown[n.saturating_sub(6)..n.saturating_sub(3)];
            let previous = if prior_range.is_empty() {
                None
            } else {
                Some(prior_range.iter().sum())
            };
            (current, previous)
        }
    }
}

/// Ratio of actual estimated traffic to raw search volume for a keyword.
/// Assumed stable across the lookback window. A zero monthly average is
/// treated as 1 so the ratio stays finite for thin keywords.
fn traffic_ratio(keyword: &RankedKeyword) -> f64 {
    let average = if keyword.search_volume.monthly_average == 0.0 {
        1.0
    } else {
        keyword.search_volume.monthly_average
    };
    keyword.serp_details.estimated_traffic_volume / average
}

/// Blend the estimated provider's ranked keywords into the overview shape.
///
/// Impressions are synthesized from each keyword's monthly breakdown for
/// the given range; clicks apply the per-keyword traffic ratio. Totals sum
/// across keywords. `change_percentage` is omitted entirely when no keyword
/// offers a previous-period baseline.
pub fn estimated_overview(keywords: &[RankedKeyword], lookback: Lookback) -> OverviewMetrics {
    let mut impressions_current = 0.0f64;
    let mut impressions_previous: Option<f64> = None;
    let mut clicks_current = 0.0f64;
    let mut clicks_previous: Option<f64> = None;

    for keyword in keywords {
        let ratio = traffic_ratio(keyword);
        let (current, previous) =
            impression_estimate(&keyword.search_volume.monthly_breakdown, lookback);
        impressions_current += current;
        clicks_current += current * ratio;
        if let Some(prev) = previous {
            *impressions_previous.get_or_insert(0.0) += prev;
            *clicks_previous.get_or_insert(0.0) += prev * ratio;
        }
    }

    OverviewMetrics {
        clicks: window(clicks_current, clicks_previous),
        impressions: window(impressions_current, impressions_previous),
    }
}

/// Per-keyword estimate row for drill-down views.
#[derive(Debug, Clone)]
pub struct KeywordEstimate {
    pub keyword: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
}

/// Same per-keyword estimate as [`estimated_overview`] but one row per
/// keyword instead of a sum. `ctr` is 0 when the impression estimate is 0.
pub fn estimated_breakdown(keywords: &[RankedKeyword], lookback: Lookback) -> Vec<KeywordEstimate> {
    keywords
        .iter()
        .map(|keyword| {
            let ratio = traffic_ratio(keyword);
            let (impressions, _) =
                impression_estimate(&keyword.search_volume.monthly_breakdown, lookback);
            let clicks = impressions * ratio;
            let ctr = if impressions > 0.0 {
                clicks / impressions
            } else {
                0.0
            };
            KeywordEstimate {
                keyword: keyword.keyword.clone(),
                clicks: clicks.round() as i64,
                impressions: impressions.round() as i64,
                ctr,
            }
        })
        .collect()
}
