#![allow(non_snake_case)]

//! Box-constrained quadratic programs
//!
//! ```text
//! minimize    ½ xᵀ H x + gᵀ x
//! subject to  lb ≤ x ≤ ub
//!             Aeq x = beq        (optional)
//! ```
//!
//! Solved with Nesterov-accelerated projected gradient. Problems without any
//! constraint take an exact Cholesky path instead. The solver never fails:
//! callers read [`QpSolution::converged`] and [`QpSolution::residual`].

use log::{debug, trace, warn};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn, RealField, Scalar, SimdRealField, convert};
use serde::{Deserialize, Serialize};

// Default settings
const QP_DEFAULT_MAX_ITER: usize = 500;
const QP_DEFAULT_TOL: f64 = 1e-8;
const QP_DEFAULT_REGULARIZATION: f64 = 1e-9;

/// Each failed factorization multiplies the diagonal shift by this factor.
const QP_REGULARIZATION_GROWTH: f64 = 100.0;
const QP_CHOLESKY_ATTEMPTS: usize = 8;

/// Solver settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpSettings {
    /// Iteration cap of the projected-gradient loop
    pub max_iter: usize,
    /// Convergence threshold on `‖x_new − x_old‖`
    pub tolerance: f64,
    /// Diagonal shift for the Cholesky path and the step-size bound
    pub regularization: f64,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            max_iter: QP_DEFAULT_MAX_ITER,
            tolerance: QP_DEFAULT_TOL,
            regularization: QP_DEFAULT_REGULARIZATION,
        }
    }
}

/// Linear equality constraint `Aeq x = beq`.
#[derive(Debug, Clone)]
pub struct EqualityConstraint<F: Scalar> {
    pub Aeq: DMatrix<F>, // m * n
    pub beq: DVector<F>, // m
}

/// Problem data. Missing bounds are unbounded.
#[derive(Debug, Clone)]
pub struct QpProblem<F: Scalar> {
    pub H: DMatrix<F>, // n * n
    pub g: DVector<F>, // n
    pub lb: Option<DVector<F>>,
    pub ub: Option<DVector<F>>,
    pub equality: Option<EqualityConstraint<F>>,
}

impl<F> QpProblem<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    #[must_use]
    pub fn new(H: DMatrix<F>, g: DVector<F>) -> Self {
        Self {
            H,
            g,
            lb: None,
            ub: None,
            equality: None,
        }
    }

    #[must_use]
    pub fn with_bounds(mut self, lb: DVector<F>, ub: DVector<F>) -> Self {
        self.lb = Some(lb);
        self.ub = Some(ub);
        self
    }

    #[must_use]
    pub fn with_lower_bound(mut self, lb: DVector<F>) -> Self {
        self.lb = Some(lb);
        self
    }

    #[must_use]
    pub fn with_upper_bound(mut self, ub: DVector<F>) -> Self {
        self.ub = Some(ub);
        self
    }

    #[must_use]
    pub fn with_equality(mut self, Aeq: DMatrix<F>, beq: DVector<F>) -> Self {
        self.equality = Some(EqualityConstraint { Aeq, beq });
        self
    }

    pub fn dim(&self) -> usize {
        self.g.len()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.lb.is_none() && self.ub.is_none() && self.equality.is_none()
    }

    /// Objective value `½ xᵀ H x + gᵀ x`.
    pub fn objective(&self, x: &DVector<F>) -> F {
        let half: F = convert(0.5);
        (&self.H * x).dot(x) * half + self.g.dot(x)
    }

    /// Clamp `x` into the box.
    pub fn project_box(&self, x: &mut DVector<F>) {
        if let Some(lb) = &self.lb {
            x.zip_apply(lb, |v, lo| *v = (*v).max(lo));
        }
        if let Some(ub) = &self.ub {
            x.zip_apply(ub, |v, hi| *v = (*v).min(hi));
        }
    }
}

/// Solution
#[derive(Debug, Clone)]
pub struct QpSolution<F: Scalar> {
    pub x: DVector<F>,
    pub converged: bool,
    pub iterations: usize,
    /// Final step norm for the gradient path, `‖Hx + g‖` for the Cholesky path
    pub residual: F,
}

/// Least-squares correction onto `Aeq x = beq`, factored once per solve.
struct EqualityProjector<F: Scalar + RealField> {
    Aeq: DMatrix<F>,
    beq: DVector<F>,
    gram: Cholesky<F, Dyn>, // Aeq Aeqᵀ
}

impl<F> EqualityProjector<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn new(constraint: &EqualityConstraint<F>, regularization: F) -> Option<Self> {
        let gram = &constraint.Aeq * constraint.Aeq.transpose();
        let m = gram.nrows();
        let gram = Cholesky::new(gram.clone())
            .or_else(|| Cholesky::new(gram + DMatrix::identity(m, m).scale(regularization)))?;
        Some(Self {
            Aeq: constraint.Aeq.clone(),
            beq: constraint.beq.clone(),
            gram,
        })
    }

    /// `x ← x + Aeqᵀ (Aeq Aeqᵀ)⁻¹ (beq − Aeq x)`
    fn project(&self, x: &mut DVector<F>) {
        let violation = &self.beq - &self.Aeq * &*x;
        let multiplier = self.gram.solve(&violation);
        *x += self.Aeq.transpose() * multiplier;
    }
}

/// Gershgorin upper bound on the largest eigenvalue of `H`.
pub fn gershgorin_bound<F>(H: &DMatrix<F>) -> F
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    H.row_iter()
        .map(|row| row.iter().fold(F::zero(), |acc, v| acc + v.abs()))
        .fold(F::zero(), |acc, v| acc.max(v))
}

#[derive(Debug, Clone, Default)]
pub struct QpSolver {
    pub settings: QpSettings,
}

impl QpSolver {
    pub fn new(settings: QpSettings) -> Self {
        Self { settings }
    }

    /// Solve `problem`, starting from `warm_start` when one of the right size
    /// is given. Unconstrained problems are solved exactly by Cholesky.
    pub fn solve<F>(&self, problem: &QpProblem<F>, warm_start: Option<&DVector<F>>) -> QpSolution<F>
    where
        F: Scalar + Copy + SimdRealField + RealField,
    {
        if problem.is_unconstrained() {
            self.solve_unconstrained(&problem.H, &problem.g)
        } else {
            self.projected_gradient(problem, warm_start)
        }
    }

    /// Solve `H x = −g` with a regularized Cholesky factorization. The shift
    /// grows until the factorization succeeds; if it never does the
    /// projected-gradient path produces a best-effort answer.
    ///
    /// Converged only when `‖Hx + g‖ ≤ tol · (‖H‖‖x‖ + ‖g‖)`, so a shift that
    /// had to dominate a singular or indefinite `H` is reported as such.
    pub fn solve_unconstrained<F>(&self, H: &DMatrix<F>, g: &DVector<F>) -> QpSolution<F>
    where
        F: Scalar + Copy + SimdRealField + RealField,
    {
        let n = g.len();
        let tolerance: F = convert(self.settings.tolerance);
        let growth: F = convert(QP_REGULARIZATION_GROWTH);
        let mut shift: F = convert(self.settings.regularization);
        if shift <= F::zero() {
            shift = convert(f64::EPSILON);
        }

        for attempt in 0..QP_CHOLESKY_ATTEMPTS {
            let regularized = H + DMatrix::identity(n, n).scale(shift);
            if let Some(chol) = Cholesky::new(regularized) {
                let x = chol.solve(&(-g));
                let residual = (H * &x + g).norm();
                // The shift only perturbs the answer when it is small next to H
                let converged = residual <= tolerance * (H.norm() * x.norm() + g.norm());
                if attempt > 0 {
                    debug!(
                        "Cholesky succeeded after {} regularization increases, residual {}",
                        attempt, residual
                    );
                }
                return QpSolution {
                    x,
                    converged,
                    iterations: 1,
                    residual,
                };
            }
            shift *= growth;
        }

        warn!("Hessian could not be factored, falling back to projected gradient");
        self.projected_gradient(&QpProblem::new(H.clone(), g.clone()), None)
    }

    /// Nesterov-accelerated projected gradient.
    pub fn projected_gradient<F>(
        &self,
        problem: &QpProblem<F>,
        warm_start: Option<&DVector<F>>,
    ) -> QpSolution<F>
    where
        F: Scalar + Copy + SimdRealField + RealField,
    {
        let n = problem.dim();
        let tolerance: F = convert(self.settings.tolerance);
        let regularization: F = convert(self.settings.regularization);
        let two: F = convert(2.0);
        let four: F = convert(4.0);

        let lipschitz = gershgorin_bound(&problem.H);
        let step = F::one() / (lipschitz + regularization.max(convert(f64::EPSILON)));

        let projector = problem.equality.as_ref().and_then(|eq| {
            let projector = EqualityProjector::new(eq, regularization);
            if projector.is_none() {
                warn!("Equality constraints are degenerate and will be ignored");
            }
            projector
        });
        let project = |x: &mut DVector<F>| {
            problem.project_box(x);
            if let Some(projector) = &projector {
                projector.project(x);
                problem.project_box(x);
            }
        };

        let mut x = match warm_start {
            Some(x0) if x0.len() == n => x0.clone(),
            _ => DVector::zeros(n),
        };
        project(&mut x);
        let mut y = x.clone();
        let mut t = F::one();
        let mut residual = F::zero();

        for iter in 0..self.settings.max_iter {
            // Gradient at the momentum point
            let grad = &problem.H * &y + &problem.g;
            let mut x_next = &y - grad.scale(step);
            project(&mut x_next);

            let t_next = (F::one() + (F::one() + four * t * t).sqrt()) / two;
            let beta = (t - F::one()) / t_next;

            let delta = &x_next - &x;
            residual = delta.norm();
            y = &x_next + delta.scale(beta);
            x = x_next;
            t = t_next;

            if residual < tolerance {
                trace!("QP converged in {} iterations", iter + 1);
                return QpSolution {
                    x,
                    converged: true,
                    iterations: iter + 1,
                    residual,
                };
            }
        }

        debug!(
            "QP stopped at the iteration cap ({}) with step norm {}",
            self.settings.max_iter, residual
        );
        QpSolution {
            x,
            converged: false,
            iterations: self.settings.max_iter,
            residual,
        }
    }
}
