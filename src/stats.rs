//! CPU accumulators and resource-usage conversion.
//!
//! The daemon reports cumulative CPU time; the orchestrator wants percent
//! usage between samples. Each handle owns three monotonic rate trackers
//! (total, user, system) that turn cumulative counters into percentages,
//! plus the host compute capacity used to express percent as ticks.

use crate::metrics::CgroupMetrics;
use crate::task::state::{CpuUsage, MemoryUsage, TaskResourceUsage};
use std::time::Instant;

/// Host compute capacity, supplied by the orchestrator at plugin
/// construction. `total_ticks` is the whole machine expressed in MHz.
#[derive(Debug, Clone, Copy)]
pub struct Compute {
    pub total_ticks: f64,
}

/// Tracks a cumulative CPU-time counter and derives percent usage between
/// consecutive observations.
#[derive(Debug)]
pub struct CpuRate {
    prev_value: f64,
    prev_at: Option<Instant>,
}

impl CpuRate {
    pub fn new() -> Self {
        Self {
            prev_value: 0.0,
            prev_at: None,
        }
    }

    /// Percent of one CPU consumed since the previous observation. The
    /// first observation seeds the tracker and reports zero.
    pub fn percent(&mut self, value: f64) -> f64 {
        let now = Instant::now();
        let percent = match self.prev_at {
            Some(prev_at) => {
                let elapsed_ns = now.duration_since(prev_at).as_nanos() as f64;
                if elapsed_ns > 0.0 && value >= self.prev_value {
                    (value - self.prev_value) / elapsed_ns * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.prev_value = value;
        self.prev_at = Some(now);
        percent
    }
}

impl Default for CpuRate {
    fn default() -> Self {
        Self::new()
    }
}

/// The three per-task accumulators.
#[derive(Debug, Default)]
pub struct CpuTrackers {
    pub total: CpuRate,
    pub user: CpuRate,
    pub system: CpuRate,
}

impl CpuTrackers {
    /// Ticks consumed at a given percent of the host's capacity.
    fn ticks_consumed(compute: &Compute, percent: f64) -> f64 {
        (percent / 100.0) * compute.total_ticks
    }

    /// Converts a decoded metrics payload into the canonical usage shape.
    pub fn convert(&mut self, metrics: &CgroupMetrics, compute: &Compute) -> TaskResourceUsage {
        let (cpu, memory) = match metrics {
            CgroupMetrics::V1(m) => {
                let usage = m.cpu.and_then(|c| c.usage).unwrap_or_default();
                let percent = self.total.percent(usage.total as f64);
                let cpu = CpuUsage {
                    system_mode: self.system.percent(usage.kernel as f64),
                    user_mode: self.user.percent(usage.user as f64),
                    percent,
                    total_ticks: Self::ticks_consumed(compute, percent),
                    measured: measured(&["Percent", "System Mode", "User Mode"]),
                };

                let mem = m.memory.unwrap_or_default();
                let memory = MemoryUsage {
                    rss: mem.rss,
                    cache: mem.cache,
                    swap: mem.swap.map(|s| s.usage).unwrap_or_default(),
                    usage: mem.usage.map(|u| u.usage).unwrap_or_default(),
                    max_usage: mem.usage.map(|u| u.max).unwrap_or_default(),
                    measured: measured(&["RSS", "Cache", "Swap", "Usage"]),
                };
                (cpu, memory)
            }
            CgroupMetrics::V2(m) => {
                let usage = m.cpu.unwrap_or_default();
                let percent = self
                    .total
                    .percent((usage.system_usec + usage.user_usec) as f64);
                let cpu = CpuUsage {
                    system_mode: self.system.percent(usage.system_usec as f64),
                    user_mode: self.user.percent(usage.user_usec as f64),
                    percent,
                    total_ticks: Self::ticks_consumed(compute, percent),
                    measured: measured(&["Percent", "System Mode", "User Mode"]),
                };

                let mem = m.memory.unwrap_or_default();
                let memory = MemoryUsage {
                    swap: mem.swap_usage,
                    usage: mem.usage,
                    measured: measured(&["Swap", "Usage"]),
                    ..Default::default()
                };
                (cpu, memory)
            }
        };

        TaskResourceUsage {
            cpu,
            memory,
            timestamp: unix_nanos(),
        }
    }
}

fn measured(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

fn unix_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsV1, MetricsV2, V1CpuStat, V1CpuUsage, V1MemoryStat, V2CpuStat, V2MemoryStat};

    #[test]
    fn first_observation_reports_zero() {
        let mut rate = CpuRate::new();
        assert_eq!(rate.percent(1_000_000.0), 0.0);
    }

    #[test]
    fn rate_is_monotone_against_counter_resets() {
        let mut rate = CpuRate::new();
        rate.percent(1_000_000.0);
        // A counter that goes backwards yields zero, not a negative rate.
        assert_eq!(rate.percent(500_000.0), 0.0);
    }

    #[test]
    fn v1_conversion_maps_memory_fields() {
        let metrics = CgroupMetrics::V1(MetricsV1 {
            cpu: Some(V1CpuStat {
                usage: Some(V1CpuUsage {
                    total: 100,
                    kernel: 40,
                    user: 60,
                }),
            }),
            memory: Some(V1MemoryStat {
                cache: 111,
                rss: 222,
                usage: Some(crate::metrics::V1MemoryEntry {
                    usage: 333,
                    max: 444,
                    ..Default::default()
                }),
                swap: Some(crate::metrics::V1MemoryEntry {
                    usage: 555,
                    ..Default::default()
                }),
            }),
        });
        let mut trackers = CpuTrackers::default();
        let usage = trackers.convert(&metrics, &Compute { total_ticks: 4000.0 });
        assert_eq!(usage.memory.rss, 222);
        assert_eq!(usage.memory.cache, 111);
        assert_eq!(usage.memory.usage, 333);
        assert_eq!(usage.memory.max_usage, 444);
        assert_eq!(usage.memory.swap, 555);
        assert!(usage.timestamp > 0);
    }

    #[test]
    fn v2_conversion_reports_swap_and_usage_only() {
        let metrics = CgroupMetrics::V2(MetricsV2 {
            cpu: Some(V2CpuStat {
                usage_usec: 100,
                user_usec: 60,
                system_usec: 40,
            }),
            memory: Some(V2MemoryStat {
                usage: 999,
                swap_usage: 11,
                ..Default::default()
            }),
        });
        let mut trackers = CpuTrackers::default();
        let usage = trackers.convert(&metrics, &Compute { total_ticks: 4000.0 });
        assert_eq!(usage.memory.usage, 999);
        assert_eq!(usage.memory.swap, 11);
        assert_eq!(usage.memory.rss, 0);
        assert_eq!(usage.memory.measured, vec!["Swap", "Usage"]);
    }
}
