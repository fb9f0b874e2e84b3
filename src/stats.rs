//! Statistics over a telemetry window.

use crate::telemetry::TelemetryRecord;

/// Mean and RMS deviation of one field over a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    /// Values the statistics cover
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// Population RMS of the deviation from `mean`.
    pub rms_deviation: f64,
}

impl WindowStats {
    /// Statistics of column `field` across `records`.
    ///
    /// Records too short to have the column are skipped. `None` when no
    /// record has it.
    pub fn compute(records: &[TelemetryRecord], field: usize) -> Option<Self> {
        let values: Vec<f64> = records
            .iter()
            .filter_map(|r| r.fields.get(field).copied())
            .collect();
        Self::from_values(&values)
    }

    /// Statistics over raw values, `None` when empty.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Some(Self {
            count,
            mean,
            rms_deviation: variance.sqrt(),
        })
    }

    /// At least two samples and a spread within `threshold`.
    pub fn is_stable(&self, threshold: f64) -> bool {
        self.count >= 2 && self.rms_deviation <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn records(values: &[f64]) -> Vec<TelemetryRecord> {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        values
            .iter()
            .map(|&v| TelemetryRecord::new(ts, vec![0.0, v]))
            .collect()
    }

    #[test]
    fn mean_and_rms_deviation() {
        let stats = WindowStats::compute(&records(&[1.0, 3.0, 1.0, 3.0]), 1).unwrap();
        assert_eq!(stats.count, 4);
        assert!((stats.mean - 2.0).abs() < 1e-12);
        assert!((stats.rms_deviation - 1.0).abs() < 1e-12);
    }

    #[test]
    fn stability_needs_two_samples() {
        let single = WindowStats::from_values(&[5.0]).unwrap();
        assert_eq!(single.rms_deviation, 0.0);
        assert!(!single.is_stable(1.0));

        let flat = WindowStats::from_values(&[5.0, 5.01, 4.99]).unwrap();
        assert!(flat.is_stable(0.05));
        assert!(!flat.is_stable(0.001));
    }

    #[test]
    fn missing_column_yields_none() {
        assert!(WindowStats::compute(&records(&[1.0]), 7).is_none());
        assert!(WindowStats::compute(&[], 0).is_none());
    }
}
