//! Telemetry store
//!
//! Append-only record of every telemetry sample received during a session.

use std::time::{Duration, Instant};

use super::{TelemetryLayout, TelemetryRecord};

/// Initial capacity; a few minutes of data at typical stand rates
const INITIAL_CAPACITY: usize = 10000;

/// A stored record with its host receive time
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Time since the store was created
    pub received_at: Duration,
    /// The decoded record
    pub record: TelemetryRecord,
}

/// Ordered, append-only telemetry table owned by a session.
///
/// Records are never reordered or deduplicated; a repeated sender index is
/// stored as received. The store is split into export segments: each command
/// run (or layout switch) starts a new one, and an export writes one segment.
pub struct TelemetryStore {
    /// Layout of the current segment
    layout: TelemetryLayout,
    /// All records in arrival order
    records: Vec<StoredRecord>,
    /// Index of the first record of the current segment
    segment_start: usize,
    /// Layout the current segment was started with
    segment_layout: TelemetryLayout,
    created: Instant,
}

impl TelemetryStore {
    /// Create an empty store
    pub fn new(layout: TelemetryLayout) -> Self {
        Self {
            layout,
            records: Vec::with_capacity(INITIAL_CAPACITY),
            segment_start: 0,
            segment_layout: layout,
            created: Instant::now(),
        }
    }

    /// Append a record at the end
    pub fn append(&mut self, record: TelemetryRecord) {
        let received_at = self.created.elapsed();
        self.records.push(StoredRecord {
            received_at,
            record,
        });
    }

    /// Start a new export segment at the current end of the store
    pub fn begin_segment(&mut self) {
        self.segment_start = self.records.len();
        self.segment_layout = self.layout;
    }

    /// Switch layout; opens a new segment so exports never mix layouts
    pub fn set_layout(&mut self, layout: TelemetryLayout) {
        self.layout = layout;
        self.begin_segment();
    }

    /// Current layout
    pub fn layout(&self) -> TelemetryLayout {
        self.layout
    }

    /// Layout of the current segment
    pub fn segment_layout(&self) -> TelemetryLayout {
        self.segment_layout
    }

    /// Records of the current segment
    pub fn segment(&self) -> &[StoredRecord] {
        &self.records[self.segment_start..]
    }

    /// Every stored record in arrival order
    pub fn export_rows(&self) -> &[StoredRecord] {
        &self.records
    }

    /// Last `n` records, oldest first
    pub fn latest(&self, n: usize) -> &[StoredRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been stored
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Span between the first and last receive time
    pub fn duration(&self) -> Duration {
        match (self.records.first(), self.records.last()) {
            (Some(first), Some(last)) => last.received_at.saturating_sub(first.received_at),
            _ => Duration::ZERO,
        }
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(TelemetryLayout::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64) -> TelemetryRecord {
        let mut values = vec![0.0; 22];
        values[0] = index as f64;
        TelemetryRecord::new(TelemetryLayout::Standard, values).unwrap()
    }

    #[test]
    fn test_store_preserves_order_and_duplicates() {
        let mut store = TelemetryStore::new(TelemetryLayout::Standard);
        assert!(store.is_empty());

        for index in [3, 1, 1, 2] {
            store.append(record(index));
        }

        let indices: Vec<_> = store
            .export_rows()
            .iter()
            .map(|r| r.record.sample_index().unwrap())
            .collect();
        assert_eq!(indices, vec![3, 1, 1, 2]);
    }

    #[test]
    fn test_segments() {
        let mut store = TelemetryStore::new(TelemetryLayout::Standard);
        store.append(record(1));
        store.begin_segment();
        store.append(record(2));
        store.append(record(3));

        assert_eq!(store.len(), 3);
        assert_eq!(store.segment().len(), 2);
        assert_eq!(store.segment()[0].record.sample_index(), Some(2));

        store.set_layout(TelemetryLayout::Compact);
        assert!(store.segment().is_empty());
        assert_eq!(store.segment_layout(), TelemetryLayout::Compact);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_latest_window() {
        let mut store = TelemetryStore::default();
        for index in 0..60 {
            store.append(record(index));
        }
        let window = store.latest(50);
        assert_eq!(window.len(), 50);
        assert_eq!(window[0].record.sample_index(), Some(10));
        assert_eq!(store.latest(100).len(), 60);
    }
}
