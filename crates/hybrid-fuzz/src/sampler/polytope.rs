use minilp::{ComparisonOp, OptimizationDirection, Problem};
use nalgebra::{DMatrix, DVector};

#[derive(Debug, thiserror::Error)]
pub enum PolytopeError {
    #[error("No Chebyshev center: {_0}")]
    NoCenter(String),
    #[error("Walk state escaped the polytope")]
    OutsidePolytope,
    #[error("No positive distance to the boundary")]
    NoBoundary,
    #[error("Barrier Hessian is not positive definite")]
    DegenerateHessian,
}

/// Convex region `{x : A x <= b}` assembled from per-variable bounds.
#[derive(Debug, Clone)]
pub struct Polytope {
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
}

impl Polytope {
    /// Two rows per variable: `x_i <= upper_i` and `-x_i <= -lower_i`.
    pub fn from_box_bounds(bounds: &[(f64, f64)]) -> Self {
        let dim = bounds.len();
        let mut a = DMatrix::zeros(2 * dim, dim);
        let mut b = DVector::zeros(2 * dim);
        for (idx, &(lower, upper)) in bounds.iter().enumerate() {
            a[(2 * idx, idx)] = 1.0;
            b[2 * idx] = upper;
            a[(2 * idx + 1, idx)] = -1.0;
            b[2 * idx + 1] = -lower;
        }
        Self { a, b }
    }

    pub fn dim(&self) -> usize {
        self.a.ncols()
    }

    pub fn rows(&self) -> usize {
        self.a.nrows()
    }

    /// Slack vector `b - A x`.
    pub fn slack(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.b - &self.a * x
    }

    pub fn contains(&self, x: &DVector<f64>) -> bool {
        self.slack(x).iter().all(|slack| *slack >= 0.0)
    }

    /// Center of the largest inscribed ball, from the LP
    /// `min -t  s.t.  A x + ||a_i|| t <= b` with `x` and `t` free.
    pub fn chebyshev_center(&self) -> Result<DVector<f64>, PolytopeError> {
        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let free = (f64::NEG_INFINITY, f64::INFINITY);
        let xs: Vec<_> = (0..self.dim()).map(|_| problem.add_var(0.0, free)).collect();
        let radius = problem.add_var(-1.0, free);
        for row_idx in 0..self.rows() {
            let row = self.a.row(row_idx);
            let mut terms: Vec<_> = xs
                .iter()
                .zip(row.iter())
                .map(|(&var, &coeff)| (var, coeff))
                .collect();
            terms.push((radius, row.norm()));
            problem.add_constraint(terms.as_slice(), ComparisonOp::Le, self.b[row_idx]);
        }
        let solution = problem
            .solve()
            .map_err(|err| PolytopeError::NoCenter(err.to_string()))?;
        Ok(DVector::from_iterator(
            self.dim(),
            xs.iter().map(|&var| solution[var]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::Polytope;

    #[test]
    fn box_bounds_make_two_rows_per_variable() {
        let polytope = Polytope::from_box_bounds(&[(0.0, 255.0), (10.0, 20.0)]);
        assert_eq!(polytope.rows(), 4);
        assert_eq!(polytope.dim(), 2);
        assert_eq!(polytope.b[0], 255.0);
        assert_eq!(polytope.b[1], 0.0);
        assert_eq!(polytope.b[2], 20.0);
        assert_eq!(polytope.b[3], -10.0);
    }

    #[test]
    fn membership_respects_all_bounds() {
        let polytope = Polytope::from_box_bounds(&[(0.0, 10.0), (5.0, 6.0)]);
        assert!(polytope.contains(&DVector::from_vec(vec![3.0, 5.5])));
        assert!(!polytope.contains(&DVector::from_vec(vec![11.0, 5.5])));
        assert!(!polytope.contains(&DVector::from_vec(vec![3.0, 4.0])));
    }

    #[test]
    fn chebyshev_center_is_interior() {
        let polytope = Polytope::from_box_bounds(&[(0.0, 10.0), (2.0, 30.0), (1.0, 9.0)]);
        let center = polytope.chebyshev_center().unwrap();
        assert!(polytope.contains(&center));
        // The inscribed ball of a box has the radius of the narrowest
        // half-width, so every slack is at least that.
        let slack = polytope.slack(&center);
        assert!(slack.iter().all(|&s| s >= 4.0 - 1e-6));
    }
}
