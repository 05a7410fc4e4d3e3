//! Load forecasting and scaling recommendations.
//!
//! Builds a seasonal-naive baseline (same-hour-of-day average over the
//! trailing days) from the mirrored history, scales it by a recent-growth
//! trend factor, and derives confidence intervals from the residual
//! variance of the baseline against actuals. Accuracy comes from
//! backtesting the baseline over the most recent known window.
//!
//! Forecast points are computed on demand and never persisted.

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregator::{DataSource, MetricsAggregator, SeriesBucket};
use crate::config::ForecastConfig;
use crate::error::ForecastError;

/// Hours per forecast horizon cap (one week).
const MAX_FORECAST_HOURS: u32 = 168;

/// Hours reserved for the backtest window.
const BACKTEST_HOURS: usize = 24;

/// z-score for a ~95% confidence interval.
const CI_Z: f64 = 1.96;

/// One hour of predicted load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// Start of the forecast hour.
    pub ts: DateTime<Utc>,
    /// Predicted trace count for the hour.
    pub predicted_traces: f64,
    /// Predicted cost for the hour (USD).
    pub predicted_cost: f64,
    /// Lower bound of the confidence interval (floored at zero).
    pub ci_lower: f64,
    /// Upper bound of the confidence interval.
    pub ci_upper: f64,
    /// Backtested model accuracy in [0, 1].
    pub model_accuracy: f64,
}

/// Recommended capacity action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
}

/// Urgency of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Capacity recommendation derived from the forecast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingRecommendation {
    pub action: ScalingAction,
    pub priority: Priority,
    /// Confidence in [0, 1], derived from model accuracy damped by how
    /// close the peak sits to the threshold.
    pub confidence: f64,
    /// Peak predicted traces/hour over the forecast window.
    pub forecast_peak_traces: f64,
    /// Forecast-window cost delta vs. the current hourly baseline (USD).
    pub estimated_cost_impact_usd: f64,
    pub reason: String,
}

/// Point-in-time load snapshot for the dashboard resource widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Traces in the trailing hour.
    pub traces_last_hour: u64,
    /// Cost in the trailing hour (USD).
    pub cost_last_hour_usd: f64,
    /// Error rate in the trailing hour, in [0, 1].
    pub error_rate_last_hour: f64,
    /// Trailing-hour load as a fraction of the scale-up threshold.
    pub capacity_utilization: f64,
    pub generated_at: DateTime<Utc>,
}

/// Seasonal baseline fitted over the training window.
struct FittedBaseline {
    /// Mean count per hour-of-day (index 0..24).
    hourly_mean: [f64; 24],
    /// Standard deviation of residuals against the training actuals.
    residual_std: f64,
}

impl FittedBaseline {
    fn fit(train: &[SeriesBucket]) -> Self {
        let mut sums = [0.0f64; 24];
        let mut counts = [0u32; 24];
        for bucket in train {
            let hod = bucket.bucket_start.hour() as usize;
            sums[hod] += bucket.count as f64;
            counts[hod] += 1;
        }

        let overall_mean = if train.is_empty() {
            0.0
        } else {
            train.iter().map(|b| b.count as f64).sum::<f64>() / train.len() as f64
        };

        let mut hourly_mean = [0.0f64; 24];
        for hod in 0..24 {
            // Hours never observed fall back to the overall mean.
            hourly_mean[hod] = if counts[hod] == 0 {
                overall_mean
            } else {
                sums[hod] / f64::from(counts[hod])
            };
        }

        let residual_std = if train.len() < 2 {
            0.0
        } else {
            let sq_sum: f64 = train
                .iter()
                .map(|b| {
                    let predicted = hourly_mean[b.bucket_start.hour() as usize];
                    let residual = b.count as f64 - predicted;
                    residual * residual
                })
                .sum();
            (sq_sum / (train.len() - 1) as f64).sqrt()
        };

        Self {
            hourly_mean,
            residual_std,
        }
    }

    fn predict(&self, ts: DateTime<Utc>) -> f64 {
        self.hourly_mean[ts.hour() as usize]
    }
}

/// Produces load forecasts and scaling recommendations from the mirrored
/// history.
pub struct ForecastEngine {
    aggregator: Arc<MetricsAggregator>,
    config: ForecastConfig,
}

impl ForecastEngine {
    /// Build an engine over the aggregator's local history feed.
    #[must_use]
    pub fn new(aggregator: Arc<MetricsAggregator>, config: ForecastConfig) -> Self {
        Self { aggregator, config }
    }

    /// One [`ForecastPoint`] per hour in `[1, min(hours_ahead, 168)]`.
    pub async fn generate_load_forecast(
        &self,
        hours_ahead: u32,
    ) -> Result<Vec<ForecastPoint>, ForecastError> {
        let hours_ahead = hours_ahead.clamp(1, MAX_FORECAST_HOURS);
        let history_hours = u32::from(self.config.trailing_days) * 24;
        let history = self.aggregator.local_history_series(history_hours);

        // History is dense; measure the usable span from the first
        // non-empty bucket.
        let first_active = history.iter().position(|b| b.count > 0);
        let have_hours = first_active.map_or(0, |i| history.len() - i) as u64;
        if have_hours < self.config.min_history_hours {
            return Err(ForecastError::InsufficientHistory {
                have_hours,
                need_hours: self.config.min_history_hours,
            });
        }
        let active = &history[first_active.unwrap_or(0)..];

        // Train on everything but the most recent day; backtest on it.
        let split = active.len().saturating_sub(BACKTEST_HOURS);
        let (train, test) = if split == 0 {
            (active, &[] as &[SeriesBucket])
        } else {
            active.split_at(split)
        };

        let baseline = FittedBaseline::fit(train);
        let trend = trend_factor(active);
        let accuracy = backtest_accuracy(&baseline, test);
        let cost_per_trace = self.cost_per_trace().await;

        debug!(
            have_hours,
            trend,
            accuracy,
            residual_std = baseline.residual_std,
            "Forecast model fitted"
        );

        let origin = Utc::now()
            .duration_trunc(Duration::hours(1))
            .unwrap_or_else(|_| Utc::now());
        let half_width = CI_Z * baseline.residual_std;

        let points = (1..=hours_ahead)
            .map(|i| {
                let ts = origin + Duration::hours(i64::from(i));
                let predicted = (baseline.predict(ts) * trend).max(0.0);
                ForecastPoint {
                    ts,
                    predicted_traces: predicted,
                    predicted_cost: predicted * cost_per_trace,
                    ci_lower: (predicted - half_width).max(0.0),
                    ci_upper: predicted + half_width,
                    model_accuracy: accuracy,
                }
            })
            .collect();
        Ok(points)
    }

    /// Derive a capacity action from the forecast peak vs. configured
    /// thresholds.
    pub async fn scaling_recommendations(
        &self,
        forecast_hours: u32,
    ) -> Result<ScalingRecommendation, ForecastError> {
        let forecast = self.generate_load_forecast(forecast_hours).await?;
        let peak = forecast
            .iter()
            .map(|p| p.predicted_traces)
            .fold(0.0f64, f64::max);
        let accuracy = forecast.first().map_or(0.0, |p| p.model_accuracy);

        let up = self.config.scale_up_threshold;
        let down = self.config.scale_down_threshold;

        let (action, priority, margin, reason) = if peak >= up {
            let margin = ((peak - up) / up).min(1.0);
            let priority = if peak >= up * 1.5 {
                Priority::High
            } else {
                Priority::Medium
            };
            (
                ScalingAction::ScaleUp,
                priority,
                margin,
                format!(
                    "forecast peak {peak:.0} traces/hour exceeds scale-up threshold {up:.0}"
                ),
            )
        } else if peak <= down {
            let margin = if down > 0.0 { ((down - peak) / down).min(1.0) } else { 1.0 };
            (
                ScalingAction::ScaleDown,
                Priority::Low,
                margin,
                format!(
                    "forecast peak {peak:.0} traces/hour is below scale-down threshold {down:.0}"
                ),
            )
        } else {
            let headroom = ((up - peak) / up).min(1.0);
            (
                ScalingAction::Maintain,
                Priority::Low,
                headroom,
                format!(
                    "forecast peak {peak:.0} traces/hour fits within thresholds [{down:.0}, {up:.0}]"
                ),
            )
        };

        // Dampen confidence when the peak hugs a threshold: a borderline
        // call deserves less conviction than a clear one.
        let confidence = (accuracy * (0.5 + 0.5 * margin.clamp(0.0, 1.0))).clamp(0.0, 1.0);

        let baseline_hourly_cost = self.current_hourly_cost().await;
        let forecast_cost: f64 = forecast.iter().map(|p| p.predicted_cost).sum();
        let estimated_cost_impact_usd =
            forecast_cost - baseline_hourly_cost * f64::from(forecast.len() as u32);

        Ok(ScalingRecommendation {
            action,
            priority,
            confidence,
            forecast_peak_traces: peak,
            estimated_cost_impact_usd,
            reason,
        })
    }

    /// Trailing-hour load snapshot.
    pub async fn current_resource_metrics(&self) -> ResourceMetrics {
        let metrics = self.aggregator.unified_metrics(1, DataSource::Local).await;
        let capacity_utilization = if self.config.scale_up_threshold > 0.0 {
            metrics.total_traces as f64 / self.config.scale_up_threshold
        } else {
            0.0
        };
        ResourceMetrics {
            traces_last_hour: metrics.total_traces,
            cost_last_hour_usd: metrics.total_cost_usd,
            error_rate_last_hour: metrics.error_rate,
            capacity_utilization,
            generated_at: Utc::now(),
        }
    }

    /// Average cost per trace over the trailing week of local data.
    async fn cost_per_trace(&self) -> f64 {
        let metrics = self.aggregator.unified_metrics(168, DataSource::Local).await;
        if metrics.total_traces == 0 {
            0.0
        } else {
            metrics.total_cost_usd / metrics.total_traces as f64
        }
    }

    async fn current_hourly_cost(&self) -> f64 {
        let metrics = self.aggregator.unified_metrics(24, DataSource::Local).await;
        metrics.total_cost_usd / 24.0
    }
}

impl std::fmt::Debug for ForecastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastEngine")
            .field("trailing_days", &self.config.trailing_days)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// Recent-growth trend: last 24h volume over the prior 24h, clamped to
/// [0.5, 2.0]. Returns 1.0 when either window is empty.
fn trend_factor(history: &[SeriesBucket]) -> f64 {
    if history.len() < 48 {
        return 1.0;
    }
    let recent: f64 = history[history.len() - 24..]
        .iter()
        .map(|b| b.count as f64)
        .sum();
    let prior: f64 = history[history.len() - 48..history.len() - 24]
        .iter()
        .map(|b| b.count as f64)
        .sum();
    if prior <= 0.0 || recent <= 0.0 {
        return 1.0;
    }
    (recent / prior).clamp(0.5, 2.0)
}

/// Accuracy = 1 − MAPE of the baseline over the backtest window, clamped
/// to [0, 1]. Actuals are floored at one trace to keep the error ratio
/// defined over quiet hours.
fn backtest_accuracy(baseline: &FittedBaseline, test: &[SeriesBucket]) -> f64 {
    if test.is_empty() {
        return 0.5;
    }
    let mape = test
        .iter()
        .map(|b| {
            let actual = b.count as f64;
            let predicted = baseline.predict(b.bucket_start);
            (actual - predicted).abs() / actual.max(1.0)
        })
        .sum::<f64>()
        / test.len() as f64;
    (1.0 - mape).clamp(0.0, 1.0)
}

// =============================================================================
// Tests
// =============================================================================
