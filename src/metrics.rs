//! Cgroup metrics payloads.
//!
//! The daemon wraps task metrics in a typed envelope whose payload is
//! either a cgroup v1 or a cgroup v2 metrics document. The prost messages
//! below mirror the daemon's wire format for exactly the fields the driver
//! converts; unknown fields are skipped on decode.

use crate::constants::{TYPE_URL_METRICS_V1, TYPE_URL_METRICS_V2};
use crate::error::{Error, Result};
use prost::Message;

// =============================================================================
// Cgroup v1 (io.containerd.cgroups.v1.Metrics)
// =============================================================================

#[derive(Clone, Copy, PartialEq, Message)]
pub struct V1CpuUsage {
    #[prost(uint64, tag = "1")]
    pub total: u64,
    #[prost(uint64, tag = "2")]
    pub kernel: u64,
    #[prost(uint64, tag = "3")]
    pub user: u64,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct V1CpuStat {
    #[prost(message, optional, tag = "1")]
    pub usage: Option<V1CpuUsage>,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct V1MemoryEntry {
    #[prost(uint64, tag = "1")]
    pub limit: u64,
    #[prost(uint64, tag = "2")]
    pub usage: u64,
    #[prost(uint64, tag = "3")]
    pub max: u64,
    #[prost(uint64, tag = "4")]
    pub failcnt: u64,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct V1MemoryStat {
    #[prost(uint64, tag = "1")]
    pub cache: u64,
    #[prost(uint64, tag = "2")]
    pub rss: u64,
    #[prost(message, optional, tag = "33")]
    pub usage: Option<V1MemoryEntry>,
    #[prost(message, optional, tag = "34")]
    pub swap: Option<V1MemoryEntry>,
}

/// Cgroup v1 metrics document, reduced to the converted fields.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct MetricsV1 {
    #[prost(message, optional, tag = "3")]
    pub cpu: Option<V1CpuStat>,
    #[prost(message, optional, tag = "4")]
    pub memory: Option<V1MemoryStat>,
}

// =============================================================================
// Cgroup v2 (io.containerd.cgroups.v2.Metrics)
// =============================================================================

#[derive(Clone, Copy, PartialEq, Message)]
pub struct V2CpuStat {
    #[prost(uint64, tag = "1")]
    pub usage_usec: u64,
    #[prost(uint64, tag = "2")]
    pub user_usec: u64,
    #[prost(uint64, tag = "3")]
    pub system_usec: u64,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct V2MemoryStat {
    #[prost(uint64, tag = "30")]
    pub usage: u64,
    #[prost(uint64, tag = "31")]
    pub usage_limit: u64,
    #[prost(uint64, tag = "32")]
    pub swap_usage: u64,
    #[prost(uint64, tag = "33")]
    pub swap_limit: u64,
}

/// Cgroup v2 metrics document, reduced to the converted fields.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct MetricsV2 {
    #[prost(message, optional, tag = "2")]
    pub cpu: Option<V2CpuStat>,
    #[prost(message, optional, tag = "4")]
    pub memory: Option<V2MemoryStat>,
}

// =============================================================================
// Tagged Union
// =============================================================================

/// A decoded metrics payload, tagged by cgroup generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CgroupMetrics {
    V1(MetricsV1),
    V2(MetricsV2),
}

/// Decodes the daemon's metrics envelope by payload type URL.
pub fn decode_metrics(payload: &prost_types::Any) -> Result<CgroupMetrics> {
    if payload.type_url.ends_with(TYPE_URL_METRICS_V1) {
        let metrics = MetricsV1::decode(payload.value.as_slice()).map_err(|e| {
            Error::MetricsDecode {
                type_url: payload.type_url.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(CgroupMetrics::V1(metrics))
    } else if payload.type_url.ends_with(TYPE_URL_METRICS_V2) {
        let metrics = MetricsV2::decode(payload.value.as_slice()).map_err(|e| {
            Error::MetricsDecode {
                type_url: payload.type_url.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(CgroupMetrics::V2(metrics))
    } else {
        Err(Error::MetricsDecode {
            type_url: payload.type_url.clone(),
            reason: "not a cgroup metrics payload".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_v1_round_trip() {
        let metrics = MetricsV1 {
            cpu: Some(V1CpuStat {
                usage: Some(V1CpuUsage {
                    total: 1_000_000,
                    kernel: 250_000,
                    user: 750_000,
                }),
            }),
            memory: Some(V1MemoryStat {
                cache: 4096,
                rss: 8192,
                usage: Some(V1MemoryEntry {
                    usage: 16384,
                    max: 32768,
                    ..Default::default()
                }),
                swap: Some(V1MemoryEntry {
                    usage: 128,
                    ..Default::default()
                }),
            }),
        };
        let any = prost_types::Any {
            type_url: format!("types.containerd.io/{TYPE_URL_METRICS_V1}"),
            value: metrics.encode_to_vec(),
        };
        match decode_metrics(&any).unwrap() {
            CgroupMetrics::V1(decoded) => assert_eq!(decoded, metrics),
            CgroupMetrics::V2(_) => panic!("decoded as v2"),
        }
    }

    #[test]
    fn decode_v2_round_trip() {
        let metrics = MetricsV2 {
            cpu: Some(V2CpuStat {
                usage_usec: 5_000,
                user_usec: 3_000,
                system_usec: 2_000,
            }),
            memory: Some(V2MemoryStat {
                usage: 65536,
                swap_usage: 256,
                ..Default::default()
            }),
        };
        let any = prost_types::Any {
            type_url: format!("types.containerd.io/{TYPE_URL_METRICS_V2}"),
            value: metrics.encode_to_vec(),
        };
        match decode_metrics(&any).unwrap() {
            CgroupMetrics::V2(decoded) => assert_eq!(decoded, metrics),
            CgroupMetrics::V1(_) => panic!("decoded as v1"),
        }
    }

    #[test]
    fn decode_rejects_unknown_type_url() {
        let any = prost_types::Any {
            type_url: "types.containerd.io/some.other.Type".to_string(),
            value: Vec::new(),
        };
        assert!(decode_metrics(&any).is_err());
    }
}
