//! Performance measurement: the baseline's own duration picks concurrent
//! racing (for long-running queries) versus sequential trimmed-mean timing
//! (cheap queries, where a race's scheduling noise would dominate the
//! signal); an inconclusive race additionally falls back to trimmed-mean.
//! Interleaved execution is reserved for cheap screening only -- the
//! authoritative comparison always runs each side back-to-back so
//! contention between the two queries never confounds the measurement.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::executor::{ExecutionSettings, Executor};

/// Perf-gate timing policy.
#[derive(Debug, Clone)]
pub struct RacePolicy {
    /// Baseline duration, in milliseconds, at or above which the perf gate
    /// races the original and candidate concurrently. Shorter baselines use
    /// the sequential trimmed-mean fallback instead, since a race's
    /// scheduling noise dominates the signal for cheap queries. Spec's
    /// "typically 2s" default.
    pub race_threshold_ms: f64,
    /// If the concurrent race's two wall times land within this fraction of
    /// each other, the race is inconclusive and a trimmed-mean
    /// remeasurement is triggered.
    pub grace_period: f64,
    /// Number of sequential runs per side for the trimmed-mean fallback.
    pub trimmed_mean_runs: usize,
    /// Fraction of runs trimmed from each end before averaging (e.g. 0.2
    /// drops the fastest and slowest 20%).
    pub trim_fraction: f64,
    /// Screening bail-out ratio: if the interleaved screen shows the
    /// candidate this many times slower than the baseline, skip the full
    /// race and report the regression immediately.
    pub screen_bailout_ratio: f64,
    /// Whether to run one untimed warmup execution per side before the
    /// sequential trimmed-mean measurement. Mitigates cold-cache bias and
    /// doubles as cold-start (e.g. warehouse spin-up) detection: a lane
    /// whose first run is dramatically slower than the rest has that run
    /// discarded rather than dragging the trimmed mean up.
    pub warmup: bool,
}

impl Default for RacePolicy {
    fn default() -> Self {
        Self {
            race_threshold_ms: 2000.0,
            grace_period: 0.05,
            trimmed_mean_runs: 5,
            trim_fraction: 0.2,
            screen_bailout_ratio: 3.0,
            warmup: true,
        }
    }
}

/// How a [`PerfMeasurement`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaceMethod {
    /// Both sides ran concurrently and were clearly separated.
    Concurrent,
    /// The concurrent race was inconclusive; sequential trimmed-mean runs
    /// settled it.
    TrimmedMean,
    /// An interleaved screen found the candidate too far behind to bother
    /// measuring further.
    ScreenedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfMeasurement {
    pub baseline_ms: f64,
    pub candidate_ms: f64,
    pub method: RaceMethod,
}

impl PerfMeasurement {
    /// `> 1.0` means the candidate is faster than the baseline.
    pub fn speedup(&self) -> f64 {
        if self.candidate_ms <= 0.0 {
            1.0
        } else {
            self.baseline_ms / self.candidate_ms
        }
    }
}

/// Quick, non-authoritative check: interleave one baseline and one
/// candidate execution and see if the candidate is wildly slower. Used only
/// to skip the expensive race/trimmed-mean measurement for obviously bad
/// candidates -- a pass here is never treated as a perf verdict on its own.
pub async fn interleaved_screen(
    executor: &dyn Executor,
    baseline_sql: &str,
    candidate_sql: &str,
    dialect: &str,
    settings: &ExecutionSettings,
    policy: &RacePolicy,
    timeout: Duration,
    execution_id_prefix: &str,
) -> Result<Option<PerfMeasurement>> {
    let baseline = executor
        .execute(
            &format!("{execution_id_prefix}-screen-baseline"),
            baseline_sql,
            dialect,
            settings,
            timeout,
        )
        .await?;
    let candidate = executor
        .execute(
            &format!("{execution_id_prefix}-screen-candidate"),
            candidate_sql,
            dialect,
            settings,
            timeout,
        )
        .await?;

    let baseline_ms = baseline.wall_time.as_secs_f64() * 1000.0;
    let candidate_ms = candidate.wall_time.as_secs_f64() * 1000.0;

    if baseline_ms > 0.0 && candidate_ms / baseline_ms >= policy.screen_bailout_ratio {
        return Ok(Some(PerfMeasurement {
            baseline_ms,
            candidate_ms,
            method: RaceMethod::ScreenedOut,
        }));
    }
    Ok(None)
}

/// Picks the perf measurement method off the baseline's own duration --
/// spec's "race when baseline >= a configured threshold (typically 2s),
/// sequential trimmed-mean as the fallback for short queries" -- then runs
/// it. Callers serialize calls to this function per executor fingerprint
/// (see [`crate::validation::ValidationHarness`]) so concurrent perf
/// measurements never share the executor's resources.
pub async fn race_or_trimmed_mean(
    executor: &dyn Executor,
    baseline_sql: &str,
    candidate_sql: &str,
    dialect: &str,
    settings: &ExecutionSettings,
    policy: &RacePolicy,
    timeout: Duration,
    execution_id_prefix: &str,
) -> Result<PerfMeasurement> {
    let probe_id = format!("{execution_id_prefix}-race-probe");
    let probe = executor
        .execute(&probe_id, baseline_sql, dialect, settings, timeout)
        .await?;
    let probe_ms = probe.wall_time.as_secs_f64() * 1000.0;

    if probe_ms >= policy.race_threshold_ms {
        race_concurrent(executor, baseline_sql, candidate_sql, dialect, settings, policy, timeout, execution_id_prefix)
            .await
    } else {
        trimmed_mean_measure(executor, baseline_sql, candidate_sql, dialect, settings, policy, timeout, execution_id_prefix)
            .await
    }
}

/// Races the baseline and candidate concurrently; if the result is within
/// `policy.grace_period` of a tie, falls back to sequential trimmed-mean
/// runs to settle an inconclusive race.
async fn race_concurrent(
    executor: &dyn Executor,
    baseline_sql: &str,
    candidate_sql: &str,
    dialect: &str,
    settings: &ExecutionSettings,
    policy: &RacePolicy,
    timeout: Duration,
    execution_id_prefix: &str,
) -> Result<PerfMeasurement> {
    let (baseline, candidate) = tokio::try_join!(
        executor.execute(
            &format!("{execution_id_prefix}-race-baseline"),
            baseline_sql,
            dialect,
            settings,
            timeout,
        ),
        executor.execute(
            &format!("{execution_id_prefix}-race-candidate"),
            candidate_sql,
            dialect,
            settings,
            timeout,
        ),
    )?;

    let baseline_ms = baseline.wall_time.as_secs_f64() * 1000.0;
    let candidate_ms = candidate.wall_time.as_secs_f64() * 1000.0;
    let slower = baseline_ms.max(candidate_ms);
    let diff = (baseline_ms - candidate_ms).abs();
    let relative_diff = if slower > 0.0 { diff / slower } else { 0.0 };

    if relative_diff > policy.grace_period {
        return Ok(PerfMeasurement {
            baseline_ms,
            candidate_ms,
            method: RaceMethod::Concurrent,
        });
    }

    trimmed_mean_measure(
        executor,
        baseline_sql,
        candidate_sql,
        dialect,
        settings,
        policy,
        timeout,
        execution_id_prefix,
    )
    .await
}

async fn trimmed_mean_measure(
    executor: &dyn Executor,
    baseline_sql: &str,
    candidate_sql: &str,
    dialect: &str,
    settings: &ExecutionSettings,
    policy: &RacePolicy,
    timeout: Duration,
    execution_id_prefix: &str,
) -> Result<PerfMeasurement> {
    let baseline_times = run_sequential(
        executor,
        baseline_sql,
        dialect,
        settings,
        policy,
        timeout,
        execution_id_prefix,
        "baseline",
    )
    .await?;
    let candidate_times = run_sequential(
        executor,
        candidate_sql,
        dialect,
        settings,
        policy,
        timeout,
        execution_id_prefix,
        "candidate",
    )
    .await?;

    Ok(PerfMeasurement {
        baseline_ms: trimmed_mean(baseline_times, policy.trim_fraction),
        candidate_ms: trimmed_mean(candidate_times, policy.trim_fraction),
        method: RaceMethod::TrimmedMean,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_sequential(
    executor: &dyn Executor,
    sql: &str,
    dialect: &str,
    settings: &ExecutionSettings,
    policy: &RacePolicy,
    timeout: Duration,
    execution_id_prefix: &str,
    label: &str,
) -> Result<Vec<f64>> {
    if policy.warmup {
        let execution_id = format!("{execution_id_prefix}-trimmed-{label}-warmup");
        executor.execute(&execution_id, sql, dialect, settings, timeout).await?;
    }

    let mut times = Vec::with_capacity(policy.trimmed_mean_runs);
    for run in 0..policy.trimmed_mean_runs {
        let execution_id = format!("{execution_id_prefix}-trimmed-{label}-{run}");
        let outcome = executor.execute(&execution_id, sql, dialect, settings, timeout).await?;
        times.push(outcome.wall_time.as_secs_f64() * 1000.0);
    }
    Ok(times)
}

fn trimmed_mean(mut times: Vec<f64>, trim_fraction: f64) -> f64 {
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let trim = ((times.len() as f64) * trim_fraction).floor() as usize;
    if times.len() <= 2 * trim {
        return times.iter().sum::<f64>() / times.len() as f64;
    }
    let trimmed = &times[trim..times.len() - trim];
    trimmed.iter().sum::<f64>() / trimmed.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimmed_mean_drops_outliers() {
        let times = vec![10.0, 11.0, 12.0, 13.0, 1000.0];
        let mean = trimmed_mean(times, 0.2);
        assert!(mean < 20.0, "outlier should have been trimmed, got {mean}");
    }

    #[test]
    fn trimmed_mean_falls_back_to_plain_average_for_tiny_samples() {
        let times = vec![5.0, 7.0];
        let mean = trimmed_mean(times, 0.2);
        assert!((mean - 6.0).abs() < 0.01);
    }

    #[test]
    fn speedup_above_one_means_candidate_is_faster() {
        let measurement = PerfMeasurement {
            baseline_ms: 100.0,
            candidate_ms: 50.0,
            method: RaceMethod::Concurrent,
        };
        assert_eq!(measurement.speedup(), 2.0);
    }
}
