use crate::config::options::BuilderOptions;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 單一 stage 的計時統計
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub stage: String,
    pub entered: u64,
    pub completed: u64,
    pub total: Duration,
    pub max: Duration,
}

impl StageStats {
    pub fn average(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.completed);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// 已進入但尚未回報時間的訊息（被過濾或合併的輸入也算在內）
    pub fn pending(&self) -> u64 {
        self.entered.saturating_sub(self.completed)
    }
}

#[derive(Default)]
struct StageEntry {
    entered: AtomicU64,
    completed: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

/// 收集 `BuilderOptions` 計時回呼的結果，依 stage 彙總
#[derive(Clone)]
pub struct TimingMonitor {
    stages: Arc<DashMap<String, StageEntry>>,
    start_time: Instant,
    enabled: bool,
}

impl TimingMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            stages: Arc::new(DashMap::new()),
            start_time: Instant::now(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_enter(&self, stage: &str) {
        if !self.enabled {
            return;
        }
        let entry = self.stages.entry(stage.to_string()).or_default();
        entry.entered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_elapsed(&self, stage: &str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let nanos = elapsed.as_nanos() as u64;
        let entry = self.stages.entry(stage.to_string()).or_default();
        entry.completed.fetch_add(1, Ordering::Relaxed);
        entry.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        entry.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// 在既有設定的回呼之外加上統計；停用時原樣回傳
    pub fn instrument(&self, options: BuilderOptions) -> BuilderOptions {
        if !self.enabled {
            return options;
        }

        let previous_enter = options.on_enter.clone();
        let previous_elapsed = options.on_elapsed.clone();
        let on_enter = self.clone();
        let on_elapsed = self.clone();

        options
            .on_enter(move |stage| {
                on_enter.record_enter(stage);
                if let Some(previous) = &previous_enter {
                    previous(stage);
                }
            })
            .on_elapsed(move |stage, elapsed| {
                on_elapsed.record_elapsed(stage, elapsed);
                if let Some(previous) = &previous_elapsed {
                    previous(stage, elapsed);
                }
            })
    }

    /// 依總時間由大到小排序
    pub fn stats(&self) -> Vec<StageStats> {
        let mut stats: Vec<StageStats> = self
            .stages
            .iter()
            .map(|entry| {
                let timing = entry.value();
                StageStats {
                    stage: entry.key().clone(),
                    entered: timing.entered.load(Ordering::Relaxed),
                    completed: timing.completed.load(Ordering::Relaxed),
                    total: Duration::from_nanos(timing.total_nanos.load(Ordering::Relaxed)),
                    max: Duration::from_nanos(timing.max_nanos.load(Ordering::Relaxed)),
                }
            })
            .collect();
        stats.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.stage.cmp(&b.stage)));
        stats
    }

    pub fn stage(&self, stage: &str) -> Option<StageStats> {
        self.stats().into_iter().find(|s| s.stage == stage)
    }

    pub fn log_stats(&self, phase: &str) {
        if !self.enabled {
            return;
        }
        for stats in self.stats() {
            tracing::info!(
                "📊 {} - Stage '{}': {} in / {} timed, avg {:?}, max {:?}",
                phase,
                stats.stage,
                stats.entered,
                stats.completed,
                stats.average(),
                stats.max
            );
        }
    }

    pub fn log_final_stats(&self) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            "📊 Final Stats - Total Time: {:?}, Stages timed: {}",
            self.start_time.elapsed(),
            self.stages.len()
        );
    }
}

impl Default for TimingMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_aggregates_per_stage() {
        let monitor = TimingMonitor::new(true);
        monitor.record_enter("parse");
        monitor.record_enter("parse");
        monitor.record_elapsed("parse", Duration::from_millis(10));
        monitor.record_elapsed("parse", Duration::from_millis(30));

        let parse = monitor.stage("parse").unwrap();
        assert_eq!(parse.entered, 2);
        assert_eq!(parse.completed, 2);
        assert_eq!(parse.max, Duration::from_millis(30));
        assert_eq!(parse.average(), Duration::from_millis(20));
        assert_eq!(parse.pending(), 0);
    }

    #[test]
    fn test_average_with_large_completion_count() {
        let completed = u64::from(u32::MAX) + 2;
        let stats = StageStats {
            stage: "hot".to_string(),
            entered: completed,
            completed,
            total: Duration::from_secs(completed),
            max: Duration::from_secs(1),
        };
        assert_eq!(stats.average(), Duration::from_secs(1));

        let idle = StageStats {
            completed: 0,
            total: Duration::ZERO,
            ..stats
        };
        assert_eq!(idle.average(), Duration::ZERO);
    }

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let monitor = TimingMonitor::default();
        monitor.record_elapsed("parse", Duration::from_millis(1));
        assert!(monitor.stats().is_empty());
        assert!(!monitor.instrument(BuilderOptions::new()).is_instrumented());
    }

    #[test]
    fn test_instrument_keeps_existing_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let options = BuilderOptions::new().on_elapsed(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let monitor = TimingMonitor::new(true);
        let options = monitor.instrument(options);
        if let Some(on_elapsed) = &options.on_elapsed {
            on_elapsed("emit", Duration::from_millis(5));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.stage("emit").unwrap().completed, 1);
    }
}
