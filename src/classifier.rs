//! Execution-order classification of two sibling calls
//!
//! Two half-open intervals are compared with `<=` on their boundaries, so
//! calls that merely touch (`[0,10)` and `[10,20)`) are sequential. Only a
//! real overlap is concurrent.
//!
//! ```
//! use sibscope::classifier::{classify, ExecutionOrder};
//! use sibscope::record::TimingInterval;
//!
//! let a = TimingInterval { start: 0.0, end: 10.0 };
//! let b = TimingInterval { start: 10.0, end: 20.0 };
//! assert_eq!(classify(&a, &b), ExecutionOrder::FirstThenSecond);
//! ```

use crate::record::TimingInterval;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of comparing the first and second service of a sibling pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrder {
    /// First service finished before the second started
    FirstThenSecond,
    /// Second service finished before the first started
    SecondThenFirst,
    /// The two calls overlap
    Concurrent,
}

impl ExecutionOrder {
    pub fn is_concurrent(self) -> bool {
        self == ExecutionOrder::Concurrent
    }

    /// The outcome seen from the other side of the pair
    pub fn reversed(self) -> Self {
        match self {
            ExecutionOrder::FirstThenSecond => ExecutionOrder::SecondThenFirst,
            ExecutionOrder::SecondThenFirst => ExecutionOrder::FirstThenSecond,
            ExecutionOrder::Concurrent => ExecutionOrder::Concurrent,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionOrder::FirstThenSecond => "sequential_s1_s2",
            ExecutionOrder::SecondThenFirst => "sequential_s2_s1",
            ExecutionOrder::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One comparison of two concrete calls of a sibling pair within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub trace_id: String,
    /// Earlier of the two call starts; the time context is looked up at
    pub timestamp: i64,
    pub order: ExecutionOrder,
}

/// Classify two concrete call intervals.
///
/// Checked in priority order: `a` ends at or before `b` starts, then `b`
/// ends at or before `a` starts, otherwise concurrent.
pub fn classify(a: &TimingInterval, b: &TimingInterval) -> ExecutionOrder {
    if a.end <= b.start {
        ExecutionOrder::FirstThenSecond
    } else if b.end <= a.start {
        ExecutionOrder::SecondThenFirst
    } else {
        ExecutionOrder::Concurrent
    }
}
