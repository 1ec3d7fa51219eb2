#![allow(non_snake_case)]

//! Condensed horizon
//!
//! Eliminates the predicted states from the horizon problem: every state is
//! written as an affine function of the initial state and the stacked input
//! vector `U = [u_0; …; u_{N−1}]`,
//!
//! ```text
//! x_k = Φ_k x_0 + Ψ_k U + offset_k
//! ```
//!
//! so one QP over `U` (or a perturbation `δU`) covers the whole horizon.

use nalgebra::{Const, DMatrix, DVector, Dyn, OMatrix};

use crate::config::CostWeights;
use crate::dynamics::{Input, NU, NX, QUAT, State, quaternion};
use crate::linearize::{Linearization, StateMatrix};
use crate::qp::QpProblem;

/// Input sensitivity of one predicted state, `NX × N·NU`.
pub type Sensitivity = OMatrix<f64, Const<NX>, Dyn>;

#[derive(Debug, Clone)]
pub struct CondensedHorizon {
    /// Φ_k for k = 0..=N
    pub Phi: Vec<StateMatrix>,
    /// Ψ_k for k = 0..=N. Ψ_0 is zero.
    pub Psi: Vec<Sensitivity>,
    /// offset_k for k = 0..=N
    pub offset: Vec<State>,
}

impl CondensedHorizon {
    /// Forward recursion over the per-step linearizations.
    pub fn build(linearizations: &[Linearization]) -> Self {
        let n = linearizations.len();
        let n_inputs = n * NU;

        let mut Phi = Vec::with_capacity(n + 1);
        let mut Psi = Vec::with_capacity(n + 1);
        let mut offset = Vec::with_capacity(n + 1);
        Phi.push(StateMatrix::identity());
        Psi.push(Sensitivity::zeros(n_inputs));
        offset.push(State::zeros());

        for (k, lin) in linearizations.iter().enumerate() {
            let Phi_next = lin.a * Phi[k];

            let mut Psi_next = lin.a * &Psi[k];
            let mut block = Psi_next.fixed_columns_mut::<NU>(k * NU);
            block += &lin.b;

            let offset_next = lin.a * offset[k] + lin.c;

            Phi.push(Phi_next);
            Psi.push(Psi_next);
            offset.push(offset_next);
        }

        Self { Phi, Psi, offset }
    }

    /// Number of steps N
    pub fn horizon_steps(&self) -> usize {
        self.Psi.len() - 1
    }

    /// Length of the stacked input vector
    pub fn num_inputs(&self) -> usize {
        self.horizon_steps() * NU
    }

    /// Predicted states `x_0..=x_N` of the affine model.
    pub fn predict(&self, x0: &State, inputs: &DVector<f64>) -> Vec<State> {
        (0..=self.horizon_steps())
            .map(|k| self.Phi[k] * x0 + &self.Psi[k] * inputs + self.offset[k])
            .collect()
    }

    /// Condensed QP in the input perturbation `δU`.
    ///
    /// `residuals[k]` is the nominal-minus-reference error of state `k + 1`.
    /// `input_deviation` is `U_nom − U_ref`, and the bounds apply to `δU`.
    pub fn build_qp(
        &self,
        residuals: &[State],
        weights: &CostWeights,
        input_deviation: &DVector<f64>,
        lower: DVector<f64>,
        upper: DVector<f64>,
    ) -> QpProblem<f64> {
        let n = self.horizon_steps();
        let n_inputs = self.num_inputs();

        let mut H = DMatrix::zeros(n_inputs, n_inputs);
        let mut g = DVector::zeros(n_inputs);

        for (k, residual) in residuals.iter().enumerate().take(n) {
            let q = weights.state_weights(k + 1, n);
            let Psi = &self.Psi[k + 1];

            // Rows of Ψ scaled by the diagonal weights
            let mut WPsi = Psi.clone();
            for (i, mut row) in WPsi.row_iter_mut().enumerate() {
                row *= q[i];
            }

            H.gemm_tr(1.0, &WPsi, Psi, 1.0);
            g.gemv_tr(1.0, &WPsi, residual, 1.0);
        }

        for k in 0..n {
            for j in 0..NU {
                let i = k * NU + j;
                H[(i, i)] += weights.r[j];
                g[i] += weights.r[j] * input_deviation[i];
            }
        }

        QpProblem::new(H, g).with_bounds(lower, upper)
    }
}

/// `nominal − reference`, with the reference quaternion flipped into the
/// nominal hemisphere first.
pub fn state_residual(nominal: &State, reference: &State) -> State {
    let mut residual = nominal - reference;
    if quaternion(nominal).dot(&quaternion(reference)) < 0.0 {
        let aligned = quaternion(nominal) + quaternion(reference);
        residual.fixed_rows_mut::<4>(QUAT).copy_from(&aligned);
    }
    residual
}

/// Stack inputs into `[u_0; …; u_{N−1}]`.
pub fn stack_inputs(inputs: &[Input]) -> DVector<f64> {
    DVector::from_iterator(
        inputs.len() * NU,
        inputs.iter().flat_map(|u| u.iter().copied()),
    )
}

/// Split a stacked vector back into per-step inputs.
pub fn unstack_inputs(stacked: &DVector<f64>) -> Vec<Input> {
    stacked
        .as_slice()
        .chunks_exact(NU)
        .map(Input::from_column_slice)
        .collect()
}
