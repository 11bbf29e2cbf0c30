use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{CostFunction, Executor, State};
use argmin::solver::neldermead::NelderMead;
use log::debug;
use ndarray::{concatenate, s, Array1, Array2, Axis};
use ndarray_linalg::{LeastSquaresSvd, Solve};

use crate::{Error, Result};

/// Threshold between the quadratic and linear regimes of the robust loss
pub(crate) const HUBER_THRESHOLD: f64 = 1e-5;

/// Ratio by which the barrier weight grows between centring steps
const BARRIER_GROWTH: f64 = 10.;
/// Target duality gap of the barrier method
const GAP_TOLERANCE: f64 = 1e-10;
const MAX_CENTRING_STEPS: usize = 40;
const NEWTON_TOLERANCE: f64 = 1e-10;
const MAX_NEWTON_STEPS: usize = 100;
const ARMIJO: f64 = 0.25;
const MIN_STEP_LENGTH: f64 = 1e-14;

/// The per-residual loss summed by a fit
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Loss {
    Squares,
    /// Quadratic below the threshold and linear above it
    Huber(f64),
}

impl Loss {
    fn value(self, residual: f64) -> f64 {
        match self {
            Self::Squares => residual.powi(2),
            Self::Huber(threshold) if residual.abs() <= threshold => residual.powi(2),
            Self::Huber(threshold) => 2. * threshold * residual.abs() - threshold.powi(2),
        }
    }

    fn derivative(self, residual: f64) -> f64 {
        match self {
            Self::Squares => 2. * residual,
            Self::Huber(threshold) if residual.abs() <= threshold => 2. * residual,
            Self::Huber(threshold) => 2. * threshold * residual.signum(),
        }
    }

    /// Curvature of the quadratic which majorises the loss at `residual`
    fn weight(self, residual: f64) -> f64 {
        match self {
            Self::Squares => 2.,
            Self::Huber(threshold) if residual.abs() <= threshold => 2.,
            Self::Huber(threshold) => 2. * threshold / residual.abs(),
        }
    }
}

/// A smooth convex objective, with a positive semi-definite curvature estimate
trait Objective {
    fn cost(&self, params: &Array1<f64>) -> f64;
    fn gradient_and_curvature(&self, params: &Array1<f64>) -> (Array1<f64>, Array2<f64>);
}

/// The half-spaces `matrix . x <= bound`
#[derive(Clone, Debug)]
pub(crate) struct LinearConstraints {
    matrix: Array2<f64>,
    bound: Array1<f64>,
}

impl LinearConstraints {
    pub(crate) fn new(matrix: Array2<f64>, bound: Array1<f64>) -> Result<Self> {
        if matrix.nrows() != bound.len() {
            return Err(Error::DimensionMismatch {
                expected: matrix.nrows(),
                found: bound.len(),
            });
        }
        Ok(Self { matrix, bound })
    }

    fn empty(num_params: usize) -> Self {
        Self {
            matrix: Array2::zeros((0, num_params)),
            bound: Array1::zeros(0),
        }
    }

    fn len(&self) -> usize {
        self.bound.len()
    }

    fn slack(&self, params: &Array1<f64>) -> Array1<f64> {
        &self.bound - &self.matrix.dot(params)
    }

    fn max_violation(&self, params: &Array1<f64>) -> f64 {
        self.slack(params)
            .iter()
            .fold(f64::NEG_INFINITY, |acc, &slack| acc.max(-slack))
    }
}

/// A linear regression `lhs ~ matrix . params` under a chosen loss
#[derive(Clone, Debug)]
pub(crate) struct Problem {
    /// The design matrix, one row per sample and one column per regressor
    matrix: Array2<f64>,
    /// The observed signal
    lhs: Array1<f64>,
    loss: Loss,
}

impl Problem {
    pub(crate) fn new(matrix: Array2<f64>, lhs: Array1<f64>, loss: Loss) -> Result<Self> {
        if matrix.nrows() != lhs.len() {
            return Err(Error::DimensionMismatch {
                expected: matrix.nrows(),
                found: lhs.len(),
            });
        }
        Ok(Self { matrix, lhs, loss })
    }

    pub(crate) fn residuals(&self, params: &Array1<f64>) -> Array1<f64> {
        &self.lhs - &self.matrix.dot(params)
    }

    /// Minimise the loss without constraints
    ///
    /// Squared loss is solved directly by least squares. The robust loss starts from the least
    /// squares solution and is refined by iteratively reweighted Newton steps.
    pub(crate) fn fit(&self) -> Result<Array1<f64>> {
        let initial = self.matrix.least_squares(&self.lhs)?.solution;
        match self.loss {
            Loss::Squares => Ok(initial),
            Loss::Huber(_) => {
                let constraints = LinearConstraints::empty(initial.len());
                centre(self, &constraints, initial, 1.)
            }
        }
    }

    /// Minimise the loss subject to `constraints`
    ///
    /// A strictly feasible start is located first. If none exists the problem is reported as a
    /// [`Error::SolverFailure`]. The log barrier method then follows the central path until the
    /// duality gap is below tolerance.
    pub(crate) fn fit_constrained(&self, constraints: &LinearConstraints) -> Result<Array1<f64>> {
        let initial = self.matrix.least_squares(&self.lhs)?.solution;
        let feasible = if constraints.max_violation(&initial) < 0. {
            initial
        } else {
            find_feasible_point(constraints, initial)?
        };
        let solution = barrier(self, constraints, feasible)?;
        if solution.iter().all(|value| value.is_finite()) {
            Ok(solution)
        } else {
            Err(Error::SolverFailure(
                "constrained fit diverged to a non-finite solution".into(),
            ))
        }
    }
}

impl Objective for Problem {
    fn cost(&self, params: &Array1<f64>) -> f64 {
        self.residuals(params)
            .iter()
            .map(|&residual| self.loss.value(residual))
            .sum()
    }

    fn gradient_and_curvature(&self, params: &Array1<f64>) -> (Array1<f64>, Array2<f64>) {
        let residuals = self.residuals(params);
        let derivative = residuals.mapv(|residual| self.loss.derivative(residual));
        let weights = residuals.mapv(|residual| self.loss.weight(residual));

        let gradient = -self.matrix.t().dot(&derivative);
        let weighted = &self.matrix * &weights.view().insert_axis(Axis(1));
        (gradient, weighted.t().dot(&self.matrix))
    }
}

/// Phase one objective: the largest constraint violation, held in the final parameter
struct Feasibility {
    num_params: usize,
}

impl Objective for Feasibility {
    fn cost(&self, params: &Array1<f64>) -> f64 {
        params[self.num_params]
    }

    fn gradient_and_curvature(&self, _params: &Array1<f64>) -> (Array1<f64>, Array2<f64>) {
        let mut gradient = Array1::zeros(self.num_params + 1);
        gradient[self.num_params] = 1.;
        (
            gradient,
            Array2::zeros((self.num_params + 1, self.num_params + 1)),
        )
    }
}

fn find_feasible_point(
    constraints: &LinearConstraints,
    initial: Array1<f64>,
) -> Result<Array1<f64>> {
    let num_params = initial.len();
    // matrix . x - s <= bound, together with s >= -1 so the phase one problem is bounded
    let shift = Array2::from_elem((constraints.len(), 1), -1.);
    let matrix = concatenate(Axis(1), &[constraints.matrix.view(), shift.view()])?;
    let mut floor = Array2::zeros((1, num_params + 1));
    floor[[0, num_params]] = -1.;
    let augmented = LinearConstraints::new(
        concatenate(Axis(0), &[matrix.view(), floor.view()])?,
        concatenate(Axis(0), &[constraints.bound.view(), Array1::ones(1).view()])?,
    )?;
    #[allow(clippy::cast_precision_loss)]
    let num_constraints = augmented.len() as f64;

    let violation = constraints.max_violation(&initial);
    let mut start = Array1::zeros(num_params + 1);
    start.slice_mut(s![..num_params]).assign(&initial);
    start[num_params] = violation.max(0.) + 1.;

    let objective = Feasibility { num_params };
    let mut point = start;
    let mut weight = 1.;
    for _ in 0..MAX_CENTRING_STEPS {
        point = centre(&objective, &augmented, point, weight)?;
        if point[num_params] < 0. {
            debug!("found a strictly feasible start after barrier weight {weight:e}");
            return Ok(point.slice(s![..num_params]).to_owned());
        }
        if num_constraints / weight < GAP_TOLERANCE {
            break;
        }
        weight *= BARRIER_GROWTH;
    }
    Err(Error::SolverFailure(format!(
        "constraints are infeasible, smallest achievable violation is {:e}",
        point[num_params]
    )))
}

/// Log barrier method from a strictly feasible start
fn barrier<O: Objective>(
    objective: &O,
    constraints: &LinearConstraints,
    initial: Array1<f64>,
) -> Result<Array1<f64>> {
    #[allow(clippy::cast_precision_loss)]
    let num_constraints = constraints.len() as f64;
    let mut params = initial;
    let mut weight = 1.;
    for iteration in 0..MAX_CENTRING_STEPS {
        params = centre(objective, constraints, params, weight)?;
        let gap = num_constraints / weight;
        if gap < GAP_TOLERANCE * objective.cost(&params).abs().max(1.) {
            debug!("barrier method converged after {iteration} centring steps, gap {gap:e}");
            return Ok(params);
        }
        weight *= BARRIER_GROWTH;
    }
    debug!("barrier method reached the centring limit");
    Ok(params)
}

/// Damped Newton minimisation of `weight * cost - sum(ln(slack))`
fn centre<O: Objective>(
    objective: &O,
    constraints: &LinearConstraints,
    initial: Array1<f64>,
    weight: f64,
) -> Result<Array1<f64>> {
    let barrier_cost = |params: &Array1<f64>| {
        let slack = constraints.slack(params);
        if slack.iter().any(|&value| value <= 0.) {
            f64::INFINITY
        } else {
            weight * objective.cost(params) - slack.mapv(f64::ln).sum()
        }
    };

    let mut params = initial;
    for _ in 0..MAX_NEWTON_STEPS {
        let inverse_slack = constraints.slack(&params).mapv(f64::recip);
        let (gradient, curvature) = objective.gradient_and_curvature(&params);
        let gradient = gradient * weight + constraints.matrix.t().dot(&inverse_slack);
        let scaled = &constraints.matrix * &inverse_slack.view().insert_axis(Axis(1));
        let mut hessian = curvature * weight + scaled.t().dot(&scaled);
        let ridge = 1e-12 * hessian.diag().iter().fold(1f64, |acc, &d| acc.max(d.abs()));
        hessian.diag_mut().mapv_inplace(|d| d + ridge);

        let step = hessian.solve(&gradient.mapv(|g| -g))?;
        let decrement = -gradient.dot(&step);
        if !decrement.is_finite() {
            return Err(Error::SolverFailure("newton step is not finite".into()));
        }
        if decrement / 2. <= NEWTON_TOLERANCE {
            break;
        }

        let current = barrier_cost(&params);
        let mut length = 1.;
        loop {
            let candidate = &params + &(&step * length);
            if barrier_cost(&candidate) <= current - ARMIJO * length * decrement {
                params = candidate;
                break;
            }
            length *= 0.5;
            if length < MIN_STEP_LENGTH {
                return Ok(params);
            }
        }
    }
    Ok(params)
}

/// Bounded least squares with the physical constraints replaced by a penalty
///
/// The cost is the root mean square residual, inflated by `1e3` whenever a residual falls below
/// the smallest observed value or the residuals sum to less than zero. Parameters are clamped to
/// `[0, upper]` before every evaluation.
#[derive(Clone, Debug)]
pub(crate) struct PenalisedProblem {
    matrix: Array2<f64>,
    lhs: Array1<f64>,
    upper: Array1<f64>,
}

impl PenalisedProblem {
    pub(crate) fn new(matrix: Array2<f64>, lhs: Array1<f64>, upper: Array1<f64>) -> Result<Self> {
        if matrix.nrows() != lhs.len() {
            return Err(Error::DimensionMismatch {
                expected: matrix.nrows(),
                found: lhs.len(),
            });
        }
        if matrix.ncols() != upper.len() {
            return Err(Error::DimensionMismatch {
                expected: matrix.ncols(),
                found: upper.len(),
            });
        }
        Ok(Self { matrix, lhs, upper })
    }

    fn clamp(&self, params: &Array1<f64>) -> Array1<f64> {
        params
            .iter()
            .zip(self.upper.iter())
            .map(|(&p, &upper)| p.clamp(0., upper))
            .collect()
    }

    fn penalised_cost(&self, params: &Array1<f64>) -> f64 {
        let residuals = &self.lhs - &self.matrix.dot(&self.clamp(params));
        let rmse = residuals.mapv(|r| r.powi(2)).mean().unwrap_or(f64::NAN).sqrt();
        let min_lhs = self.lhs.iter().copied().fold(f64::INFINITY, f64::min);
        let min_residual = residuals.iter().copied().fold(f64::INFINITY, f64::min);
        if min_residual < min_lhs || residuals.sum() < 0. {
            rmse.abs() + 1e3
        } else {
            rmse
        }
    }

    /// Run a Nelder-Mead search from the centre of the bounds
    pub(crate) fn solve(self, max_iters: u64, verbose: bool) -> Result<Array1<f64>> {
        let initial = &self.upper / 2.;
        let mut simplex = vec![initial.clone()];
        for jj in 0..initial.len() {
            let mut vertex = initial.clone();
            vertex[jj] += self.upper[jj] / 4.;
            simplex.push(vertex);
        }
        let solver = NelderMead::new(simplex)
            .with_sd_tolerance(1e-12)
            .map_err(|e| Error::solver(&e))?;

        let upper = self.upper.clone();
        let mut executor =
            Executor::new(self, solver).configure(|state| state.max_iters(max_iters));
        if verbose {
            executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
        }
        let res = executor.run().map_err(|e| Error::solver(&e))?;

        let mut state = res.state().clone();
        let param = state
            .take_best_param()
            .ok_or_else(|| Error::SolverFailure("nelder-mead returned no parameters".into()))?;
        debug!(
            "penalised fit finished with cost {:e} after {} iterations",
            state.get_best_cost(),
            state.get_iter()
        );
        Ok(param
            .iter()
            .zip(upper.iter())
            .map(|(&p, &upper)| p.clamp(0., upper))
            .collect())
    }
}

impl CostFunction for PenalisedProblem {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(self.penalised_cost(p))
    }
}
