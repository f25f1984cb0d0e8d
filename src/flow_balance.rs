// Flow-rate reconciliation between the inflow and the two outflow branches

use crate::centerline::BranchTag;
use crate::geometry::Vector3D;
use crate::landmarks::LandmarkKey;
use crate::{Error, Result};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// Mean of the cluster of samples near the maximum.
///
/// Samples are sorted; starting at the maximum, the walk keeps every sample
/// with |max - x| / |max| <= `fraction` and stops at the first one outside.
pub fn trimmed_average(samples: &[f64], fraction: f64) -> Result<f64> {
    let mut sorted: Vec<OrderedFloat<f64>> = samples
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(OrderedFloat)
        .collect();
    sorted.sort();

    let Some(&OrderedFloat(max)) = sorted.last() else {
        return Err(Error::FlowBalance("no flux samples to average".to_string()));
    };

    let within = |x: f64| {
        if max == 0.0 {
            x == 0.0
        } else {
            (max - x).abs() / max.abs() <= fraction
        }
    };
    let retained: Vec<f64> = sorted
        .iter()
        .rev()
        .map(|v| v.into_inner())
        .take_while(|&x| within(x))
        .collect();

    Ok(retained.iter().sum::<f64>() / retained.len() as f64)
}

/// Flux samples of one time step, keyed by landmark
#[derive(Debug, Clone, Default)]
pub struct FlowRateTable {
    samples: BTreeMap<LandmarkKey, f64>,
    measured_inflow: Option<f64>,
}

impl FlowRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: LandmarkKey, flux: f64) {
        self.samples.insert(key, flux);
    }

    pub fn get(&self, key: &LandmarkKey) -> Option<f64> {
        self.samples.get(key).copied()
    }

    /// Cut-plane samples of one branch in index order
    pub fn samples(&self, tag: BranchTag) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|(k, _)| k.branch == tag && !k.is_clip())
            .map(|(_, &v)| v)
            .collect()
    }

    pub fn set_measured_inflow(&mut self, flux: f64) {
        self.measured_inflow = Some(flux);
    }

    pub fn measured_inflow(&self) -> Option<f64> {
        self.measured_inflow
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.measured_inflow = None;
    }
}

/// Trimmed per-branch averages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BranchAverages {
    pub cca: f64,
    pub ica: f64,
    pub eca: f64,
}

/// Outflow rates scaled so that ica + eca equals the inflow
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balanced {
    pub averages: BranchAverages,
    /// Inflow average over the measured inflow sample
    pub cca_constant: f64,
    pub ica: f64,
    pub eca: f64,
}

#[derive(Debug, Clone)]
pub struct FlowBalancer {
    trim_fraction: f64,
}

impl FlowBalancer {
    pub fn new(trim_fraction: f64) -> Self {
        Self { trim_fraction }
    }

    pub fn averages(&self, table: &FlowRateTable) -> Result<BranchAverages> {
        let average = |tag: BranchTag| {
            trimmed_average(&table.samples(tag), self.trim_fraction)
                .map_err(|_| Error::FlowBalance(format!("no flux samples on {}", tag)))
        };
        Ok(BranchAverages {
            cca: average(BranchTag::Cca)?,
            ica: average(BranchTag::Ica)?,
            eca: average(BranchTag::Eca)?,
        })
    }

    /// Trimmed averages then conservation redistribution
    pub fn reconcile(&self, table: &FlowRateTable) -> Result<Balanced> {
        let averages = self.averages(table)?;
        let measured = table
            .measured_inflow()
            .ok_or_else(|| Error::FlowBalance("no measured inflow sample".to_string()))?;
        let balanced = Self::redistribute(averages, measured)?;

        log::info!(
            "  Averages cca {:.6}, ica {:.6}, eca {:.6}; balanced ica {:.6}, eca {:.6} (cca constant {:.4})",
            averages.cca,
            averages.ica,
            averages.eca,
            balanced.ica,
            balanced.eca,
            balanced.cca_constant
        );
        Ok(balanced)
    }

    /// Keep the ica/eca ratio, rescale both so they sum to the inflow average
    pub fn redistribute(averages: BranchAverages, measured_inflow: f64) -> Result<Balanced> {
        if averages.eca == 0.0 {
            return Err(Error::FlowBalance("eca average is zero".to_string()));
        }
        let ratio = averages.ica / averages.eca;
        if ratio == 0.0 || !ratio.is_finite() {
            return Err(Error::FlowBalance(format!("invalid ica/eca ratio {}", ratio)));
        }
        if measured_inflow == 0.0 {
            return Err(Error::FlowBalance("measured inflow is zero".to_string()));
        }

        let ica = averages.cca / (1.0 + 1.0 / ratio);
        Ok(Balanced {
            averages,
            cca_constant: averages.cca / measured_inflow,
            ica,
            eca: ica / ratio,
        })
    }
}

/// Inlet velocity profile rescaled by the step's cca constant
pub fn scaled_inflow_velocities(velocities: &[Vector3D], cca_constant: f64) -> Vec<Vector3D> {
    velocities.iter().map(|v| v * cca_constant).collect()
}

/// One reconciled time step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalancedStep {
    pub step: usize,
    pub time: f64,
    pub cca_constant: f64,
    pub ica: f64,
    pub eca: f64,
}

/// Reconciled rates of one side, in time-step order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSeries {
    steps: Vec<BalancedStep>,
}

impl FlowSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps must arrive in strictly increasing order
    pub fn push(&mut self, step: BalancedStep) -> Result<()> {
        if let Some(last) = self.steps.last() {
            if step.step <= last.step {
                return Err(Error::FlowBalance(format!(
                    "time step {} arrived after step {}",
                    step.step, last.step
                )));
            }
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn steps(&self) -> &[BalancedStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// (time, value) outlet boundary values; outflow is negative
    pub fn outlet_values(&self, tag: BranchTag) -> Result<Vec<(f64, f64)>> {
        let pick: fn(&BalancedStep) -> f64 = match tag {
            BranchTag::Ica => |s| s.ica,
            BranchTag::Eca => |s| s.eca,
            BranchTag::Cca => {
                return Err(Error::FlowBalance("cca is the inflow branch".to_string()));
            }
        };
        Ok(self.steps.iter().map(|s| (s.time, -pick(s))).collect())
    }

    /// Parenthesized `(time value)` table repeated over `cycles` cycles
    pub fn boundary_table(&self, tag: BranchTag, cycles: usize, time_step_duration: f64) -> Result<String> {
        let values = self.outlet_values(tag)?;
        let mut table = String::from("(\n");
        if !values.is_empty() {
            for i in 0..values.len() * cycles {
                let value = values[i % values.len()].1;
                // Writing to a String cannot fail
                let _ = writeln!(table, "({}\t{})", time_step_duration * i as f64, value);
            }
        }
        table.push_str(")\n");
        Ok(table)
    }

    pub fn write_boundary_table<P: AsRef<Path>>(
        &self,
        path: P,
        tag: BranchTag,
        cycles: usize,
        time_step_duration: f64,
    ) -> Result<()> {
        std::fs::write(path, self.boundary_table(tag, cycles, time_step_duration)?)?;
        Ok(())
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trimmed_average_drops_outlier() {
        let avg = trimmed_average(&[10.0, 3.0, 9.8, 9.5], 0.10).unwrap();
        assert!((avg - 29.3 / 3.0).abs() < 1e-12);

        let avg = trimmed_average(&[10.0, 8.0, 9.5], 0.10).unwrap();
        assert!((avg - 9.75).abs() < 1e-12);

        assert!((trimmed_average(&[4.0], 0.10).unwrap() - 4.0).abs() < 1e-12);
        assert!(matches!(trimmed_average(&[], 0.10), Err(Error::FlowBalance(_))));
    }

    #[test]
    fn test_trimmed_average_negative_and_zero() {
        let avg = trimmed_average(&[-1.0, -1.05, -3.0], 0.10).unwrap();
        assert!((avg + 1.025).abs() < 1e-12);
        assert_eq!(trimmed_average(&[0.0, 0.0, -2.0], 0.10).unwrap(), 0.0);
    }

    #[test]
    fn test_redistribution_conserves_inflow() {
        let averages = BranchAverages {
            cca: 12.0,
            ica: 8.0,
            eca: 4.0,
        };
        let balanced = FlowBalancer::redistribute(averages, 6.0).unwrap();
        assert!((balanced.ica - 8.0).abs() < 1e-12);
        assert!((balanced.eca - 4.0).abs() < 1e-12);
        assert!((balanced.cca_constant - 2.0).abs() < 1e-12);

        let averages = BranchAverages {
            cca: 10.0,
            ica: 6.0,
            eca: 2.0,
        };
        let balanced = FlowBalancer::redistribute(averages, 10.0).unwrap();
        assert!((balanced.ica + balanced.eca - 10.0).abs() < 1e-12);
        assert!((balanced.ica / balanced.eca - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_redistribution_rejects_zero_divisors() {
        let zero_eca = BranchAverages { cca: 1.0, ica: 1.0, eca: 0.0 };
        let zero_ica = BranchAverages { cca: 1.0, ica: 0.0, eca: 1.0 };
        let fine = BranchAverages { cca: 1.0, ica: 1.0, eca: 1.0 };
        assert!(FlowBalancer::redistribute(zero_eca, 1.0).is_err());
        assert!(FlowBalancer::redistribute(zero_ica, 1.0).is_err());
        assert!(FlowBalancer::redistribute(fine, 0.0).is_err());
    }

    #[test]
    fn test_reconcile_from_table() {
        let mut table = FlowRateTable::new();
        for (i, v) in [9.0, 10.0, 9.6, 2.0].into_iter().enumerate() {
            table.record(LandmarkKey::cut(BranchTag::Cca, i), v);
        }
        for (i, v) in [6.0, 6.0, 5.9].into_iter().enumerate() {
            table.record(LandmarkKey::cut(BranchTag::Ica, i), v);
        }
        table.record(LandmarkKey::cut(BranchTag::Eca, 0), 3.0);
        // Clip entries never count as samples
        table.record(LandmarkKey::clip(BranchTag::Eca), 100.0);

        let balancer = FlowBalancer::new(0.10);
        assert!(matches!(balancer.reconcile(&table), Err(Error::FlowBalance(_))));

        table.set_measured_inflow(8.0);
        let balanced = balancer.reconcile(&table).unwrap();
        let cca = (9.0 + 10.0 + 9.6) / 3.0;
        assert!((balanced.averages.cca - cca).abs() < 1e-12);
        assert!((balanced.ica + balanced.eca - cca).abs() < 1e-12);
        assert!((balanced.cca_constant - cca / 8.0).abs() < 1e-12);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.measured_inflow(), None);
    }

    #[test]
    fn test_series_order_and_signs() {
        let mut series = FlowSeries::new();
        let step = |i: usize| BalancedStep {
            step: i,
            time: i as f64 * 0.05,
            cca_constant: 1.0,
            ica: 2.0 + i as f64,
            eca: 1.0,
        };
        series.push(step(0)).unwrap();
        series.push(step(1)).unwrap();
        assert!(series.push(step(1)).is_err());

        let ica = series.outlet_values(BranchTag::Ica).unwrap();
        assert_eq!(ica, vec![(0.0, -2.0), (0.05, -3.0)]);
        assert!(series.outlet_values(BranchTag::Cca).is_err());
    }

    #[test]
    fn test_boundary_table_repeats_cycles() {
        let mut series = FlowSeries::new();
        for i in 0..2 {
            series
                .push(BalancedStep {
                    step: i,
                    time: i as f64,
                    cca_constant: 1.0,
                    ica: 1.0,
                    eca: 0.5 + i as f64,
                })
                .unwrap();
        }

        let table = series.boundary_table(BranchTag::Eca, 3, 0.5).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.first(), Some(&"("));
        assert_eq!(lines.last(), Some(&")"));
        assert_eq!(lines.len(), 2 + 6);
        assert_eq!(lines[1], "(0\t-0.5)");
        assert_eq!(lines[4], "(1.5\t-1.5)");
    }

    #[test]
    fn test_series_json_file() {
        let mut series = FlowSeries::new();
        series
            .push(BalancedStep {
                step: 3,
                time: 0.3,
                cca_constant: 0.9,
                ica: 4.0,
                eca: 2.0,
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.json");
        series.to_json_file(&path).unwrap();
        assert_eq!(FlowSeries::from_json_file(&path).unwrap(), series);
    }

    #[test]
    fn test_scaled_inflow() {
        let scaled = scaled_inflow_velocities(&[Vector3D::new(0.0, 0.0, 2.0)], 1.5);
        assert_eq!(scaled, vec![Vector3D::new(0.0, 0.0, 3.0)]);
    }
}
