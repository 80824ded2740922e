//! Timed polling of control-bus attributes.
//!
//! # Architecture
//!
//! ```text
//!                    ┌─ poller(attr 0) ─┐
//! coordinator::run ──┼─ poller(attr 1) ─┼── join barrier ──▶ TimingTable
//!                    └─ poller(attr n) ─┘
//! ```
//!
//! Each poller owns its own [`TimingSeries`]. The coordinator builds the
//! [`TimingTable`] only after every poller has returned.

pub mod coordinator;
pub mod poller;

pub use coordinator::{run, PollOptions, WorkerErrorPolicy};
pub use poller::{poll_attribute, PollFailure};

use serde::{Deserialize, Serialize};

/// Access times of one attribute in milliseconds, in read order.
pub type TimingSeries = Vec<f64>;

/// Ordered mapping from attribute name to its timing series.
///
/// Iteration follows insertion order. Inserting an existing name replaces its
/// series in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingTable {
    entries: Vec<(String, TimingSeries)>,
}

impl TimingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table with room for `capacity` attributes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert or replace the series for `attribute`
    pub fn insert(&mut self, attribute: impl Into<String>, series: TimingSeries) {
        let attribute = attribute.into();
        match self.entries.iter_mut().find(|(name, _)| *name == attribute) {
            Some((_, existing)) => *existing = series,
            None => self.entries.push((attribute, series)),
        }
    }

    /// Series recorded for `attribute`
    pub fn get(&self, attribute: &str) -> Option<&TimingSeries> {
        self.entries
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, series)| series)
    }

    /// Attribute names in column order
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Entries in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TimingSeries)> {
        self.entries.iter().map(|(name, series)| (name.as_str(), series))
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no attribute was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Length of the longest series
    pub fn max_len(&self) -> usize {
        self.entries.iter().map(|(_, s)| s.len()).max().unwrap_or(0)
    }
}

impl FromIterator<(String, TimingSeries)> for TimingTable {
    fn from_iter<I: IntoIterator<Item = (String, TimingSeries)>>(iter: I) -> Self {
        let mut table = TimingTable::new();
        for (name, series) in iter {
            table.insert(name, series);
        }
        table
    }
}

/// Settings of one run, written as the header of the results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Requested camera frame rate
    pub fps: f64,
    /// Requested stream bandwidth in MB/s
    pub stream_mb: f64,
    /// Whether image change events were subscribed
    pub subscribe: bool,
    /// Pause between polls in seconds
    pub wait_s: f64,
    /// Total polling time in seconds
    pub total_time_s: f64,
}

impl RunParameters {
    /// `key=value` pairs in header order
    pub fn header_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("fps", self.fps.to_string()),
            ("streamMB", self.stream_mb.to_string()),
            ("subscribe", self.subscribe.to_string()),
            ("wait", self.wait_s.to_string()),
            ("totaltime", self.total_time_s.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_keeps_insertion_order() {
        let mut table = TimingTable::new();
        table.insert("z", vec![1.0]);
        table.insert("a", vec![2.0]);
        table.insert("m", vec![]);
        let names: Vec<&str> = table.attributes().collect();
        assert_eq!(names, vec!["z", "a", "m"]);
        assert_eq!(table.max_len(), 1);
    }

    #[test]
    fn duplicate_insert_replaces_in_place() {
        let mut table = TimingTable::new();
        table.insert("a", vec![1.0]);
        table.insert("b", vec![2.0]);
        table.insert("a", vec![3.0, 4.0]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.attributes().next(), Some("a"));
        assert_eq!(table.get("a"), Some(&vec![3.0, 4.0]));
    }

    #[test]
    fn empty_table_has_zero_rows() {
        assert_eq!(TimingTable::new().max_len(), 0);
        assert!(TimingTable::new().is_empty());
    }

    #[test]
    fn header_entries_follow_fixed_order() {
        let params = RunParameters {
            fps: 2.0,
            stream_mb: 1.5,
            subscribe: true,
            wait_s: 1.0,
            total_time_s: 30.0,
        };
        let keys: Vec<&str> = params.header_entries().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["fps", "streamMB", "subscribe", "wait", "totaltime"]);
        assert_eq!(params.header_entries()[1].1, "1.5");
    }
}
