//! Dense symmetric linear algebra for the normal equations

use super::FitError;

/// Square matrix, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let n = rows.len();
        let mut m = Self::zeros(n);
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().take(n).enumerate() {
                m.data[i * n + j] = *v;
            }
        }
        m
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    /// `self += scale * v v'`
    pub fn add_outer(&mut self, v: &[f64], scale: f64) {
        for i in 0..self.n {
            let vi = v[i] * scale;
            if vi == 0.0 {
                continue;
            }
            for j in 0..self.n {
                self.data[i * self.n + j] += vi * v[j];
            }
        }
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.n).map(|i| self.get(i, i)).collect()
    }
}

/// Lower-triangular factor `L` with `A = L L'`
#[derive(Debug, Clone)]
pub struct Cholesky {
    n: usize,
    l: Vec<f64>,
}

impl Cholesky {
    /// Factor a symmetric positive definite matrix. Pivots below a
    /// tolerance relative to the largest diagonal entry count as singular.
    pub fn new(a: &Matrix) -> Result<Self, FitError> {
        let n = a.dim();
        let scale = a.diagonal().into_iter().fold(0.0_f64, f64::max);
        let tolerance = scale.max(1.0) * 1e-12;

        let mut l = vec![0.0; n * n];
        for j in 0..n {
            let mut diag = a.get(j, j);
            for k in 0..j {
                diag -= l[j * n + k] * l[j * n + k];
            }
            if !diag.is_finite() || diag <= tolerance {
                return Err(FitError::Singular);
            }
            let pivot = diag.sqrt();
            l[j * n + j] = pivot;

            for i in (j + 1)..n {
                let mut s = a.get(i, j);
                for k in 0..j {
                    s -= l[i * n + k] * l[j * n + k];
                }
                l[i * n + j] = s / pivot;
            }
        }
        Ok(Self { n, l })
    }

    /// Solve `A x = b`
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut s = b[i];
            for k in 0..i {
                s -= self.l[i * n + k] * y[k];
            }
            y[i] = s / self.l[i * n + i];
        }
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut s = y[i];
            for k in (i + 1)..n {
                s -= self.l[k * n + i] * x[k];
            }
            x[i] = s / self.l[i * n + i];
        }
        x
    }

    /// `A⁻¹`, column by column
    pub fn inverse(&self) -> Matrix {
        let n = self.n;
        let mut inv = Matrix::zeros(n);
        let mut e = vec![0.0; n];
        for j in 0..n {
            e.iter_mut().for_each(|v| *v = 0.0);
            e[j] = 1.0;
            for (i, v) in self.solve(&e).into_iter().enumerate() {
                inv.data[i * n + j] = v;
            }
        }
        inv
    }

    /// `ln |A|`
    pub fn log_det(&self) -> f64 {
        (0..self.n).map(|i| self.l[i * self.n + i].ln()).sum::<f64>() * 2.0
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
