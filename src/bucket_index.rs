//! Time-bucketed nearest-record index for metric samples
//!
//! Metric samples are aligned to fixed-width buckets and stored in a
//! two-level ordered map:
//!
//! ```text
//! bucket (aligned timestamp)
//!   └─ service id
//!        └─ [sample, sample, ...]   (insertion order)
//! ```
//!
//! # Lookup contract
//!
//! 1. Exact bucket of the query timestamp.
//! 2. Otherwise radius `r = 1..=max_radius`: bucket `q - r·w` (left) then
//!    `q + r·w` (right). The first radius where either side holds data wins.
//! 3. Nothing within `max_radius` buckets: `None`.
//!
//! A match carries every record found at the winning radius, left side
//! first, each side in insertion order. Single-value metrics use
//! [`BucketMatch::first`]; rate metrics average with [`BucketMatch::mean_by`].
//!
//! [`LinearScan`] answers the same question without an index by scanning
//! every record of the service. The two must agree on every query.

use crate::error::{PipelineError, Result};
use crate::record::MetricSample;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const INDEX_FORMAT: &str = "sibscope-time-bucket-index";
const INDEX_VERSION: u32 = 1;

/// Align a timestamp to the start of its bucket (floor division)
///
/// `None` when the bucket start is not representable, which only happens
/// within one bucket width of `i64::MIN`.
pub fn bucket_of(timestamp: i64, bucket_width: i64) -> Option<i64> {
    timestamp
        .checked_div_euclid(bucket_width)?
        .checked_mul(bucket_width)
}

/// Records found by a nearest lookup
#[derive(Debug, Clone, PartialEq)]
pub struct BucketMatch<'a, T> {
    /// Radius (in buckets) at which the records were found; 0 = exact bucket
    pub radius: u32,
    /// Matched records: left bucket then right bucket, insertion order within each
    pub records: Vec<&'a T>,
    /// Smallest absolute distance between the query and a matched record timestamp
    pub lag: u64,
}

impl<'a, T> BucketMatch<'a, T> {
    /// First record by the deterministic tie-break order
    pub fn first(&self) -> &'a T {
        self.records[0]
    }

    /// Arithmetic mean of a value over all matched records
    pub fn mean_by<F>(&self, value: F) -> f64
    where
        F: Fn(&T) -> f64,
    {
        let sum: f64 = self.records.iter().map(|r| value(r)).sum();
        sum / self.records.len() as f64
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn build_match<'a, T: MetricSample>(
    radius: u32,
    records: Vec<&'a T>,
    timestamp: i64,
) -> Option<BucketMatch<'a, T>> {
    let lag = records
        .iter()
        .map(|r| r.timestamp().abs_diff(timestamp))
        .min()?;
    Some(BucketMatch {
        radius,
        records,
        lag,
    })
}

/// Nearest-record lookup by service and timestamp
pub trait NearestLookup<T> {
    fn lookup(&self, service_id: &str, timestamp: i64) -> Option<BucketMatch<'_, T>>;
}

/// Two-level ordered index: bucket → service → samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBucketIndex<T> {
    bucket_width: i64,
    max_radius: u32,
    buckets: BTreeMap<i64, BTreeMap<String, Vec<T>>>,
    record_count: usize,
}

impl<T: MetricSample> TimeBucketIndex<T> {
    /// Create an empty index
    ///
    /// # Panics
    ///
    /// Panics if `bucket_width` is not positive.
    pub fn new(bucket_width: i64, max_radius: u32) -> Self {
        assert!(bucket_width > 0, "bucket_width must be positive");
        Self {
            bucket_width,
            max_radius,
            buckets: BTreeMap::new(),
            record_count: 0,
        }
    }

    /// Build an index from samples, preserving their order within each bucket
    pub fn build<I>(records: I, bucket_width: i64, max_radius: u32) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut index = Self::new(bucket_width, max_radius);
        let mut skipped = 0usize;
        for record in records {
            if !index.insert(record) {
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::warn!(
                kind = T::KIND,
                skipped,
                "Skipped samples with timestamps outside the bucket range"
            );
        }
        tracing::debug!(
            kind = T::KIND,
            buckets = index.bucket_count(),
            records = index.len(),
            "Built time-bucket index"
        );
        index
    }

    /// Append a sample to its bucket. Existing samples are never overwritten.
    ///
    /// Returns `false`, leaving the index unchanged, when the sample's
    /// timestamp has no representable bucket.
    pub fn insert(&mut self, record: T) -> bool {
        let Some(bucket) = bucket_of(record.timestamp(), self.bucket_width) else {
            return false;
        };
        self.buckets
            .entry(bucket)
            .or_default()
            .entry(record.service_id().to_string())
            .or_default()
            .push(record);
        self.record_count += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_width(&self) -> i64 {
        self.bucket_width
    }

    pub fn max_radius(&self) -> u32 {
        self.max_radius
    }

    /// Change the search radius (e.g. after loading a persisted index)
    pub fn with_max_radius(mut self, max_radius: u32) -> Self {
        self.max_radius = max_radius;
        self
    }

    /// Samples of one service in one bucket, if any
    pub fn records_at(&self, bucket: i64, service_id: &str) -> Option<&[T]> {
        self.buckets
            .get(&bucket)
            .and_then(|services| services.get(service_id))
            .filter(|records| !records.is_empty())
            .map(|records| records.as_slice())
    }

    /// Iterate all samples in bucket order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buckets
            .values()
            .flat_map(|services| services.values())
            .flatten()
    }

    fn side(&self, query_bucket: i64, radius: u32, left: bool, service_id: &str) -> Option<&[T]> {
        let offset = self.bucket_width.checked_mul(i64::from(radius))?;
        let bucket = if left {
            query_bucket.checked_sub(offset)?
        } else {
            query_bucket.checked_add(offset)?
        };
        self.records_at(bucket, service_id)
    }
}

impl<T: MetricSample> NearestLookup<T> for TimeBucketIndex<T> {
    fn lookup(&self, service_id: &str, timestamp: i64) -> Option<BucketMatch<'_, T>> {
        let query = bucket_of(timestamp, self.bucket_width)?;

        if let Some(records) = self.records_at(query, service_id) {
            return build_match(0, records.iter().collect(), timestamp);
        }

        for radius in 1..=self.max_radius {
            let left = self.side(query, radius, true, service_id);
            let right = self.side(query, radius, false, service_id);
            if left.is_none() && right.is_none() {
                continue;
            }
            let records: Vec<&T> = left
                .into_iter()
                .chain(right)
                .flat_map(|side| side.iter())
                .collect();
            return build_match(radius, records, timestamp);
        }

        None
    }
}

/// Index-free nearest lookup over a flat sample list
///
/// Produces the same matches as [`TimeBucketIndex`] at linear cost per query.
#[derive(Debug, Clone)]
pub struct LinearScan<T> {
    bucket_width: i64,
    max_radius: u32,
    records: Vec<T>,
}

impl<T: MetricSample> LinearScan<T> {
    pub fn new(records: Vec<T>, bucket_width: i64, max_radius: u32) -> Self {
        assert!(bucket_width > 0, "bucket_width must be positive");
        Self {
            bucket_width,
            max_radius,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T: MetricSample> NearestLookup<T> for LinearScan<T> {
    fn lookup(&self, service_id: &str, timestamp: i64) -> Option<BucketMatch<'_, T>> {
        let query = bucket_of(timestamp, self.bucket_width)?;
        let width = self.bucket_width.unsigned_abs();
        let mut best: Option<u64> = None;
        let mut matches: Vec<(i64, &T)> = Vec::new();

        for record in self.records.iter().filter(|r| r.service_id() == service_id) {
            let Some(bucket) = bucket_of(record.timestamp(), self.bucket_width) else {
                continue;
            };
            let distance = bucket.abs_diff(query) / width;
            if distance > u64::from(self.max_radius) {
                continue;
            }
            match best {
                Some(d) if distance > d => continue,
                Some(d) if distance == d => matches.push((bucket, record)),
                _ => {
                    best = Some(distance);
                    matches.clear();
                    matches.push((bucket, record));
                }
            }
        }

        let radius = u32::try_from(best?).ok()?;
        // Stable: left bucket before right, insertion order within a bucket
        matches.sort_by_key(|(bucket, _)| *bucket);
        build_match(radius, matches.into_iter().map(|(_, r)| r).collect(), timestamp)
    }
}

#[derive(Serialize, Deserialize)]
struct IndexEnvelope<I> {
    format: String,
    version: u32,
    kind: String,
    index: I,
}

/// Envelope header only; the payload is skipped
#[derive(Deserialize)]
struct IndexHeader {
    format: String,
    version: u32,
    kind: String,
}

impl<T> TimeBucketIndex<T>
where
    T: MetricSample + Serialize + DeserializeOwned,
{
    /// Serialize the index to a MessagePack blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let envelope = IndexEnvelope {
            format: INDEX_FORMAT.to_string(),
            version: INDEX_VERSION,
            kind: T::KIND.to_string(),
            index: self,
        };
        Ok(rmp_serde::to_vec_named(&envelope)?)
    }

    /// Decode an index previously produced by [`TimeBucketIndex::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: IndexHeader = rmp_serde::from_slice(bytes)?;
        if header.format != INDEX_FORMAT || header.version != INDEX_VERSION {
            return Err(PipelineError::FormatMismatch {
                expected: format!("{} v{}", INDEX_FORMAT, INDEX_VERSION),
                found: format!("{} v{}", header.format, header.version),
            });
        }
        if header.kind != T::KIND {
            return Err(PipelineError::FormatMismatch {
                expected: T::KIND.to_string(),
                found: header.kind,
            });
        }

        let envelope: IndexEnvelope<TimeBucketIndex<T>> = rmp_serde::from_slice(bytes)?;
        if envelope.index.bucket_width <= 0 {
            return Err(PipelineError::IndexBuild(format!(
                "persisted index has invalid bucket width {}",
                envelope.index.bucket_width
            )));
        }
        Ok(envelope.index)
    }

    /// Save the index to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        fs::write(path.as_ref(), bytes)?;
        tracing::info!(
            path = %path.as_ref().display(),
            records = self.len(),
            "Saved time-bucket index"
        );
        Ok(())
    }

    /// Load an index from a file, checking it was built with `bucket_width`
    pub fn load<P: AsRef<Path>>(path: P, bucket_width: i64) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let index = Self::from_bytes(&bytes)?;
        if index.bucket_width != bucket_width {
            return Err(PipelineError::FormatMismatch {
                expected: format!("bucket width {}", bucket_width),
                found: format!("bucket width {}", index.bucket_width),
            });
        }
        Ok(index)
    }
}
