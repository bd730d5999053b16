//! Input records and derived timing intervals
//!
//! All records are immutable once ingested. A run borrows them read-only
//! from discovery through aggregation.

use serde::{Deserialize, Serialize};

/// One call-graph row (a single RPC edge)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub trace_id: String,
    /// Dot-separated hierarchical call id (e.g. `0.1.3`)
    pub rpc_path: String,
    pub caller_service: String,
    pub callee_service: String,
    pub caller_instance_id: String,
    pub callee_instance_id: String,
    /// Call start, in trace time units (milliseconds in the source data)
    pub start_timestamp: i64,
    pub response_time: f64,
}

impl CallRecord {
    /// Create a record with empty instance ids
    pub fn new(
        trace_id: impl Into<String>,
        rpc_path: impl Into<String>,
        caller_service: impl Into<String>,
        callee_service: impl Into<String>,
        start_timestamp: i64,
        response_time: f64,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            rpc_path: rpc_path.into(),
            caller_service: caller_service.into(),
            callee_service: callee_service.into(),
            caller_instance_id: String::new(),
            callee_instance_id: String::new(),
            start_timestamp,
            response_time,
        }
    }

    /// Timing interval of this call, or `None` if the response time is
    /// unusable (NaN, infinite or negative)
    pub fn interval(&self, zero_epsilon: f64) -> Option<TimingInterval> {
        TimingInterval::from_call(self.start_timestamp, self.response_time, zero_epsilon)
    }
}

/// Half-open interval `[start, end)` of one call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingInterval {
    pub start: f64,
    pub end: f64,
}

impl TimingInterval {
    /// Build an interval from a start timestamp and a response time.
    ///
    /// A response time of exactly zero is widened to `zero_epsilon` so that
    /// zero-width calls still order against their neighbours.
    pub fn from_call(start_timestamp: i64, response_time: f64, zero_epsilon: f64) -> Option<Self> {
        if !response_time.is_finite() || response_time < 0.0 {
            return None;
        }
        let duration = if response_time == 0.0 {
            zero_epsilon
        } else {
            response_time
        };
        let start = start_timestamp as f64;
        Some(Self {
            start,
            end: start + duration,
        })
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// A record that can be placed in a time-bucket index
pub trait MetricSample {
    /// Short name of the metric kind, stored with persisted indexes
    const KIND: &'static str;

    fn timestamp(&self) -> i64;
    fn service_id(&self) -> &str;
}

/// System load sample (CPU and memory utilization of one service)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemLoadSample {
    pub timestamp: i64,
    pub service_id: String,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
}

impl SystemLoadSample {
    pub fn new(
        timestamp: i64,
        service_id: impl Into<String>,
        cpu_utilization: f64,
        memory_utilization: f64,
    ) -> Self {
        Self {
            timestamp,
            service_id: service_id.into(),
            cpu_utilization,
            memory_utilization,
        }
    }

    /// Weighted load: `cpu_weight * cpu + memory_weight * memory`
    pub fn weighted_load(&self, cpu_weight: f64, memory_weight: f64) -> f64 {
        cpu_weight * self.cpu_utilization + memory_weight * self.memory_utilization
    }
}

impl MetricSample for SystemLoadSample {
    const KIND: &'static str = "system-load";

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }
}

/// Provider call-rate sample of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRateSample {
    pub timestamp: i64,
    pub service_id: String,
    pub provider_call_rate: f64,
}

impl CallRateSample {
    pub fn new(timestamp: i64, service_id: impl Into<String>, provider_call_rate: f64) -> Self {
        Self {
            timestamp,
            service_id: service_id.into(),
            provider_call_rate,
        }
    }
}

impl MetricSample for CallRateSample {
    const KIND: &'static str = "call-rate";

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }
}
