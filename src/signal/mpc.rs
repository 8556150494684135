//! Prediction matrices for single-input single-output model predictive control.
//!
//! A plant model `x' = A x + B u`, `y = C x` is discretised with a zero-order hold,
//! rewritten in incremental form (state `[Δx; y]`, input `Δu`) and expanded over a
//! prediction horizon `Np` and control horizon `Nc` into
//!
//! ```text
//! Y = F x(k) + Φ ΔU
//! ```
//!
//! where row `i` of `F` is `C A^(i+1)` and `Φ[i][j] = C A^(i-j) B` for `j <= i`.

use crate::error::{AppResult, DaqError};
use nalgebra::DMatrix;

/// State-space model `(A, B, C)`.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSpace {
    /// State matrix, `n × n`.
    pub a: DMatrix<f64>,
    /// Input matrix, `n × 1`.
    pub b: DMatrix<f64>,
    /// Output matrix, `1 × n`.
    pub c: DMatrix<f64>,
}

/// `F` and `Φ` over a prediction horizon.
#[derive(Clone, Debug, PartialEq)]
pub struct PredictionMatrices {
    /// Free response, `Np × n`.
    pub f: DMatrix<f64>,
    /// Forced response, `Np × Nc`, lower triangular.
    pub phi: DMatrix<f64>,
}

impl StateSpace {
    /// Build a SISO model, checking that the dimensions agree.
    pub fn new(a: DMatrix<f64>, b: DMatrix<f64>, c: DMatrix<f64>) -> AppResult<Self> {
        let n = a.nrows();
        if n == 0 || a.ncols() != n {
            return Err(DaqError::Configuration(format!(
                "A must be square and non-empty, got {}x{}",
                a.nrows(),
                a.ncols()
            )));
        }
        if b.shape() != (n, 1) {
            return Err(DaqError::Configuration(format!(
                "B must be {n}x1, got {}x{}",
                b.nrows(),
                b.ncols()
            )));
        }
        if c.shape() != (1, n) {
            return Err(DaqError::Configuration(format!(
                "C must be 1x{n}, got {}x{}",
                c.nrows(),
                c.ncols()
            )));
        }
        Ok(Self { a, b, c })
    }

    /// Number of states.
    pub fn order(&self) -> usize {
        self.a.nrows()
    }

    /// Zero-order-hold discretisation with sample time `sample_time` seconds.
    ///
    /// Uses the exponential of the block matrix `[[A, B], [0, 0]]·T`, whose top row
    /// is `[A_d, B_d]`. This holds whether or not `A` is invertible.
    pub fn discretize(&self, sample_time: f64) -> AppResult<Self> {
        if !(sample_time.is_finite() && sample_time > 0.0) {
            return Err(DaqError::Configuration(format!(
                "sample time must be positive, got {sample_time}"
            )));
        }
        let n = self.order();
        let mut block = DMatrix::<f64>::zeros(n + 1, n + 1);
        block.view_mut((0, 0), (n, n)).copy_from(&self.a);
        block.view_mut((0, n), (n, 1)).copy_from(&self.b);
        let exp = (block * sample_time).exp();

        Ok(Self {
            a: exp.view((0, 0), (n, n)).into_owned(),
            b: exp.view((0, n), (n, 1)).into_owned(),
            c: self.c.clone(),
        })
    }

    /// Incremental form with the output appended to the state:
    ///
    /// ```text
    /// A_e = [[A, 0], [C A, 1]]   B_e = [[B], [C B]]   C_e = [0 … 0, 1]
    /// ```
    pub fn augmented(&self) -> Self {
        let n = self.order();
        let ca = &self.c * &self.a;
        let cb = &self.c * &self.b;

        let mut a = DMatrix::<f64>::zeros(n + 1, n + 1);
        a.view_mut((0, 0), (n, n)).copy_from(&self.a);
        a.view_mut((n, 0), (1, n)).copy_from(&ca);
        a[(n, n)] = 1.0;

        let mut b = DMatrix::<f64>::zeros(n + 1, 1);
        b.view_mut((0, 0), (n, 1)).copy_from(&self.b);
        b[(n, 0)] = cb[(0, 0)];

        let mut c = DMatrix::<f64>::zeros(1, n + 1);
        c[(0, n)] = 1.0;

        Self { a, b, c }
    }

    /// `F` and `Φ` for prediction horizon `np` and control horizon `nc`.
    pub fn prediction_matrices(&self, np: usize, nc: usize) -> AppResult<PredictionMatrices> {
        if np == 0 || nc == 0 || nc > np {
            return Err(DaqError::Configuration(format!(
                "horizons need 1 <= Nc <= Np, got Np={np} Nc={nc}"
            )));
        }
        let n = self.order();
        let mut f = DMatrix::<f64>::zeros(np, n);
        let mut phi = DMatrix::<f64>::zeros(np, nc);

        // markov[k] = C A^k B; c_pow is C A^(i+1) once row i is filled.
        let mut markov = Vec::with_capacity(np);
        let mut c_pow = self.c.clone();
        for i in 0..np {
            markov.push((&c_pow * &self.b)[(0, 0)]);
            c_pow = &c_pow * &self.a;
            f.row_mut(i).copy_from(&c_pow);
        }
        for i in 0..np {
            for j in 0..=i.min(nc - 1) {
                phi[(i, j)] = markov[i - j];
            }
        }
        Ok(PredictionMatrices { f, phi })
    }
}
