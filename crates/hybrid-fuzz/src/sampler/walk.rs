use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use super::polytope::{Polytope, PolytopeError};

/// Proposal radius shared by the barrier walks.
pub const WALK_RADIUS: f64 = 0.5;

/// Chain points discarded before the first sample.
const CHAIN_BURN: usize = 1000;

/// Chain points consumed per accepted sample.
const CHAIN_THIN: usize = 10;

/// Fixed-point rounds for the approximate John weights.
const JOHN_ITERATIONS: usize = 5;

/// Which random walk explores the polytope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WalkKind {
    #[default]
    HitAndRun,
    Dikin,
    Vaidya,
    John,
}

/// One Markov chain over a polytope. `advance` yields the next chain
/// point, which may equal the current one for the Metropolis walks.
#[derive(Debug)]
pub struct PolytopeWalk<'a> {
    kind: WalkKind,
    polytope: &'a Polytope,
    radius: f64,
    x: DVector<f64>,
}

impl<'a> PolytopeWalk<'a> {
    pub fn new(kind: WalkKind, polytope: &'a Polytope, start: DVector<f64>) -> Self {
        Self {
            kind,
            polytope,
            radius: WALK_RADIUS,
            x: start,
        }
    }

    pub fn advance<R: Rng>(&mut self, rng: &mut R) -> Result<DVector<f64>, PolytopeError> {
        if !self.polytope.contains(&self.x) {
            return Err(PolytopeError::OutsidePolytope);
        }
        match self.kind {
            WalkKind::HitAndRun => self.hit_and_run_step(rng)?,
            WalkKind::Dikin | WalkKind::Vaidya | WalkKind::John => self.barrier_step(rng)?,
        }
        Ok(self.x.clone())
    }

    /// Pick a random direction, find the closest boundary along it and
    /// move a uniform fraction of that distance.
    fn hit_and_run_step<R: Rng>(&mut self, rng: &mut R) -> Result<(), PolytopeError> {
        let direction = sample_sphere(self.polytope.dim(), rng);
        let slack = self.polytope.slack(&self.x);
        let along = &self.polytope.a * &direction;
        let mut closest = f64::INFINITY;
        for (slack_i, along_i) in slack.iter().zip(along.iter()) {
            let dist = slack_i / along_i;
            if dist > 0.0 && dist < closest {
                closest = dist;
            }
        }
        if !closest.is_finite() {
            return Err(PolytopeError::NoBoundary);
        }
        self.x += direction * (closest * rng.gen_range(0.0..1.0));
        Ok(())
    }

    /// Lazy Metropolis step with an ellipsoidal proposal shaped by the
    /// walk's barrier Hessian.
    fn barrier_step<R: Rng>(&mut self, rng: &mut R) -> Result<(), PolytopeError> {
        if rng.gen_range(0.0..1.0) < 0.5 {
            return Ok(());
        }
        let h_x = self.hessian(&self.x)?;
        let proposal = &self.x + ellipsoid_sample(&h_x, self.radius, rng)?;
        if self.polytope.slack(&proposal).iter().any(|slack| *slack <= 0.0) {
            return Ok(());
        }
        let h_z = self.hessian(&proposal)?;
        let diff = &self.x - &proposal;
        if local_norm(&h_z, &diff) > 1.0 {
            return Ok(());
        }
        let ratio = (h_z.determinant() / h_x.determinant()).sqrt();
        if ratio >= 1.0 || rng.gen_range(0.0..1.0) < ratio {
            self.x = proposal;
        }
        Ok(())
    }

    /// Barrier Hessian `A^T W S^-2 A`. Dikin uses unit row weights;
    /// Vaidya and John reweight rows by leverage scores.
    fn hessian(&self, x: &DVector<f64>) -> Result<DMatrix<f64>, PolytopeError> {
        let slack = self.polytope.slack(x);
        if slack.iter().any(|slack_i| *slack_i <= 0.0) {
            return Err(PolytopeError::OutsidePolytope);
        }
        let rows = self.polytope.rows();
        let unit = DVector::from_element(rows, 1.0);
        let weights = match self.kind {
            WalkKind::HitAndRun | WalkKind::Dikin => unit,
            WalkKind::Vaidya => {
                let beta = self.polytope.dim() as f64 / rows as f64;
                let scores = leverage_scores(&self.polytope.a, &slack, &unit)?;
                scores.map(|score| score + beta)
            }
            WalkKind::John => self.john_weights(&slack)?,
        };
        Ok(weighted_hessian(&self.polytope.a, &slack, &weights))
    }

    /// Approximate John-ellipsoid weights by fixed-point iteration on
    /// the weighted leverage scores.
    fn john_weights(&self, slack: &DVector<f64>) -> Result<DVector<f64>, PolytopeError> {
        let dim = self.polytope.dim() as f64;
        let rows = self.polytope.rows() as f64;
        let alpha = 1.0 - 1.0 / (2.0 * rows / dim).log2();
        let floor = dim / (2.0 * rows);
        let mut weights = DVector::from_element(self.polytope.rows(), 1.0);
        for _ in 0..JOHN_ITERATIONS {
            let powered = weights.map(|weight: f64| weight.powf(alpha));
            let scores = leverage_scores(&self.polytope.a, slack, &powered)?;
            weights = scores.map(|score| score + floor);
        }
        Ok(weights)
    }
}

fn weighted_hessian(a: &DMatrix<f64>, slack: &DVector<f64>, weights: &DVector<f64>) -> DMatrix<f64> {
    let scaling = DVector::from_fn(slack.len(), |row, _| weights[row] / (slack[row] * slack[row]));
    a.transpose() * DMatrix::from_diagonal(&scaling) * a
}

/// Leverage score of every row of `S^-1 A` under the weighted Hessian.
fn leverage_scores(
    a: &DMatrix<f64>,
    slack: &DVector<f64>,
    weights: &DVector<f64>,
) -> Result<DVector<f64>, PolytopeError> {
    let hessian = weighted_hessian(a, slack, weights);
    let inverse = hessian
        .try_inverse()
        .ok_or(PolytopeError::DegenerateHessian)?;
    let scores = DVector::from_fn(a.nrows(), |row, _| {
        let a_row = a.row(row);
        let quad = (a_row * &inverse * a_row.transpose())[(0, 0)];
        weights[row] / (slack[row] * slack[row]) * quad
    });
    Ok(scores)
}

fn local_norm(hessian: &DMatrix<f64>, v: &DVector<f64>) -> f64 {
    v.dot(&(hessian * v))
}

/// Uniform point on the unit sphere.
fn sample_sphere<R: Rng>(dim: usize, rng: &mut R) -> DVector<f64> {
    loop {
        let point = DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));
        let norm = point.norm();
        if norm > 0.0 {
            return point / norm;
        }
    }
}

/// Uniform point in the ellipsoid `{v : v^T H v <= r}`.
fn ellipsoid_sample<R: Rng>(
    hessian: &DMatrix<f64>,
    radius: f64,
    rng: &mut R,
) -> Result<DVector<f64>, PolytopeError> {
    let dim = hessian.nrows();
    let mut point = sample_sphere(dim, rng);
    point *= rng.gen_range(0.0..1.0f64).powf(1.0 / dim as f64);
    let inverse = hessian
        .clone()
        .try_inverse()
        .ok_or(PolytopeError::DegenerateHessian)?;
    let factor = Cholesky::new(inverse).ok_or(PolytopeError::DegenerateHessian)?;
    Ok(factor.l() * point * radius.sqrt())
}

/// Draw `count` points from the chain, discarding `CHAIN_BURN` leading
/// points and `CHAIN_THIN - 1` points between consecutive samples.
pub fn collect_chain<R: Rng>(
    walk: &mut PolytopeWalk<'_>,
    count: usize,
    rng: &mut R,
) -> Result<Vec<DVector<f64>>, PolytopeError> {
    for _ in 0..CHAIN_BURN {
        walk.advance(rng)?;
    }
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        points.push(walk.advance(rng)?);
        for _ in 0..CHAIN_THIN - 1 {
            walk.advance(rng)?;
        }
    }
    Ok(points)
}

/// Sample `count` interior points, starting the chain from the
/// Chebyshev center.
pub fn sample_polytope<R: Rng>(
    kind: WalkKind,
    polytope: &Polytope,
    count: usize,
    rng: &mut R,
) -> Result<Vec<DVector<f64>>, PolytopeError> {
    let start = polytope.chebyshev_center()?;
    let mut walk = PolytopeWalk::new(kind, polytope, start);
    collect_chain(&mut walk, count, rng)
}
