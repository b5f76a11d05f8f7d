use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Per-column standardisation `(x - mean) / scale` with population standard deviation.
/// Constant columns keep a scale of 1.0 so they map to zero instead of NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self> {
        let first = rows
            .first()
            .ok_or_else(|| anyhow!("Cannot fit a scaler on an empty dataset"))?;
        let width = first.len();
        if rows.iter().any(|row| row.len() != width) {
            return Err(anyhow!("Cannot fit a scaler on rows of unequal width"));
        }

        let n = rows.len() as f64;
        let mut mean = vec![0.0; width];
        for row in rows {
            for (acc, value) in mean.iter_mut().zip(row) {
                *acc += value;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut variance = vec![0.0; width];
        for row in rows {
            for ((acc, value), m) in variance.iter_mut().zip(row).zip(&mean) {
                let diff = value - m;
                *acc += diff * diff;
            }
        }
        let scale = variance
            .into_iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std.is_finite() && std > 1e-12 {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        Ok(Self { mean, scale })
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        if row.len() != self.width() {
            return Err(anyhow!(
                "Scaler expects {} features, received {}",
                self.width(),
                row.len()
            ));
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(value, (mean, scale))| (value - mean) / scale)
            .collect())
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        rows.iter().map(|row| self.transform_row(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standardizes_columns_with_population_std() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = StandardScaler::fit(&rows).expect("fit");
        assert_eq!(scaler.mean, vec![2.0, 5.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);
        let transformed = scaler.transform(&rows).expect("transform");
        assert_eq!(transformed, vec![vec![-1.0, 0.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn rejects_wrong_width() {
        let scaler = StandardScaler::fit(&[vec![1.0, 2.0]]).expect("fit");
        assert!(scaler.transform_row(&[1.0]).is_err());
        assert!(StandardScaler::fit(&[]).is_err());
    }
}
