//! In-process metrics for the sync layer.
//!
//! Every series is identified by a name plus a label set. Label order does
//! not matter: `[("a", "1"), ("b", "2")]` and `[("b", "2"), ("a", "1")]`
//! address the same series.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: BTreeMap<String, String>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }
}

enum Series {
    Counter(u64),
    Gauge(f64),
    /// Raw observations; sync histograms (backoff delays) stay small.
    Histogram(Vec<f64>),
}

/// Distribution of a histogram's observations.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

impl HistogramSummary {
    fn of(observations: &[f64]) -> Self {
        if observations.is_empty() {
            return Self::default();
        }
        let mut sorted = observations.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        // Nearest-rank percentile.
        let rank = |p: f64| sorted[((p * n as f64).ceil() as usize).clamp(1, n) - 1];
        Self {
            count: n as u64,
            sum: sorted.iter().sum(),
            min: sorted[0],
            max: sorted[n - 1],
            p50: rank(0.50),
            p95: rank(0.95),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricValue {
    Counter { value: u64 },
    Gauge { value: f64 },
    Histogram(HistogramSummary),
}

/// One series as of [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub value: MetricValue,
    pub taken_at: DateTime<Utc>,
}

/// Thread-safe recorder shared by the connection manager and dispatcher.
///
/// Recording into a series of the wrong kind (a counter name used as a
/// gauge) is ignored.
#[derive(Default)]
pub struct MetricsRecorder {
    series: Mutex<HashMap<SeriesKey, Series>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let mut series = self.series.lock();
        if let Series::Counter(total) = series
            .entry(SeriesKey::new(name, labels))
            .or_insert(Series::Counter(0))
        {
            *total += n;
        }
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut series = self.series.lock();
        if let Series::Gauge(current) = series
            .entry(SeriesKey::new(name, labels))
            .or_insert(Series::Gauge(0.0))
        {
            *current = value;
        }
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut series = self.series.lock();
        if let Series::Histogram(observations) = series
            .entry(SeriesKey::new(name, labels))
            .or_insert_with(|| Series::Histogram(Vec::new()))
        {
            observations.push(value);
        }
    }

    /// Zero when the counter was never incremented.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.series.lock().get(&SeriesKey::new(name, labels)) {
            Some(Series::Counter(total)) => *total,
            _ => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        match self.series.lock().get(&SeriesKey::new(name, labels)) {
            Some(Series::Gauge(value)) => *value,
            _ => 0.0,
        }
    }

    /// Empty summary (count 0) for a histogram with no observations.
    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.series.lock().get(&SeriesKey::new(name, labels)) {
            Some(Series::Histogram(observations)) => HistogramSummary::of(observations),
            _ => HistogramSummary::default(),
        }
    }

    /// Every series, ordered by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let taken_at = Utc::now();
        let series = self.series.lock();
        let mut keys: Vec<&SeriesKey> = series.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: match &series[key] {
                    Series::Counter(value) => MetricValue::Counter { value: *value },
                    Series::Gauge(value) => MetricValue::Gauge { value: *value },
                    Series::Histogram(observations) => {
                        MetricValue::Histogram(HistogramSummary::of(observations))
                    }
                },
                taken_at,
            })
            .collect()
    }
}
