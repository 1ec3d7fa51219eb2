//! First-order models of [`QuadrotorModel::step`] about an operating point.
//!
//! Two implementations share the [`Linearizer`] contract: finite differences
//! ([`NumericalLinearizer`]) and closed-form Jacobians
//! ([`AnalyticalLinearizer`]). Both produce `x⁺ ≈ A x + B u + c`.

use nalgebra::{Matrix4, SMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::dynamics::{
    ACT, Input, NU, NX, NORM_EPSILON, POS, QUAT, QuadrotorModel, State, VEL, actuators,
    normalize_quaternion, quaternion, rate_input_matrix, rate_matrix,
    renormalize_attitude, thrust_direction, thrust_direction_jacobian,
};

pub type StateMatrix = SMatrix<f64, NX, NX>;
pub type InputMatrix = SMatrix<f64, NX, NU>;

/// Default finite-difference step
pub const FD_EPSILON: f64 = 1e-6;

/// Affine model of one discrete step.
#[derive(Debug, Clone, PartialEq)]
pub struct Linearization {
    /// State Jacobian
    pub a: StateMatrix,
    /// Input Jacobian
    pub b: InputMatrix,
    /// Affine residual `f(x, u) − A x − B u`
    pub c: State,
}

impl Linearization {
    /// Complete a pair of Jacobians with the affine term. `next` must be
    /// `f(state, input)`.
    pub fn from_jacobians(
        a: StateMatrix,
        b: InputMatrix,
        state: &State,
        input: &Input,
        next: &State,
    ) -> Self {
        let c = next - a * state - b * input;
        Self { a, b, c }
    }

    /// Evaluate the affine model.
    pub fn predict(&self, state: &State, input: &Input) -> State {
        self.a * state + self.b * input + self.c
    }
}

pub trait Linearizer {
    fn linearize(
        &self,
        model: &QuadrotorModel,
        state: &State,
        input: &Input,
        dt: f64,
    ) -> Linearization;
}

/// One-sided finite differences. Kept as the reference the analytical path is
/// checked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericalLinearizer {
    pub epsilon: f64,
}

impl Default for NumericalLinearizer {
    fn default() -> Self {
        Self {
            epsilon: FD_EPSILON,
        }
    }
}

impl Linearizer for NumericalLinearizer {
    fn linearize(
        &self,
        model: &QuadrotorModel,
        state: &State,
        input: &Input,
        dt: f64,
    ) -> Linearization {
        let base = model.step(state, input, dt);
        let mut a = StateMatrix::zeros();
        let mut b = InputMatrix::zeros();

        for j in 0..NX {
            let mut perturbed = *state;
            perturbed[j] += self.epsilon;
            if (QUAT..QUAT + 4).contains(&j) {
                renormalize_attitude(&mut perturbed);
            }
            let column = (model.step(&perturbed, input, dt) - base) / self.epsilon;
            a.set_column(j, &column);
        }

        for j in 0..NU {
            let mut perturbed = *input;
            perturbed[j] += self.epsilon;
            let column = (model.step(state, &perturbed, dt) - base) / self.epsilon;
            b.set_column(j, &column);
        }

        Linearization::from_jacobians(a, b, state, input, &base)
    }
}

/// Closed-form Jacobians of [`QuadrotorModel::step`].
///
/// The attitude update `q⁺ = N(M(ω⁺) q)` is differentiated through the
/// normalization with `J_norm = (I − q̂ q̂ᵀ) / ‖q_raw‖`. Velocity and position
/// rows chain the thrust-direction Jacobian through the attitude rows, since
/// the thrust is rotated with the updated attitude.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AnalyticalLinearizer;

impl Linearizer for AnalyticalLinearizer {
    fn linearize(
        &self,
        model: &QuadrotorModel,
        state: &State,
        input: &Input,
        dt: f64,
    ) -> Linearization {
        let params = model.params();
        let (alpha_thrust, alpha_rate) = params.lag_factors(dt);
        let hold_thrust = 1.0 - alpha_thrust;
        let hold_rate = 1.0 - alpha_rate;
        let half_dt2 = 0.5 * dt * dt;

        let act = actuators(state);
        let thrust = act[0] + alpha_thrust * (input[0] - act[0]);
        let body_rates = Vector3::new(
            act[1] + alpha_rate * (input[1] - act[1]),
            act[2] + alpha_rate * (input[2] - act[2]),
            act[3] + alpha_rate * (input[3] - act[3]),
        );

        let q = quaternion(state);
        let propagation = Matrix4::identity() + rate_matrix(&body_rates) * (0.5 * dt);
        let (q_next, norm) = normalize_quaternion(&(propagation * q));
        let j_norm = if norm > NORM_EPSILON {
            (Matrix4::identity() - q_next * q_next.transpose()) / norm
        } else {
            Matrix4::identity()
        };

        // Attitude sensitivities
        let dq_dq = j_norm * propagation;
        let dq_drates = j_norm * rate_input_matrix(&q) * (0.5 * dt);

        // Acceleration sensitivities
        let direction = thrust_direction(&q_next);
        let direction_jac = thrust_direction_jacobian(&q_next) * (thrust / params.mass);
        let da_dq = direction_jac * dq_dq;
        let da_drates = direction_jac * dq_drates;
        let da_dthrust = direction / params.mass;
        let drag = params.linear_drag;

        let mut a = StateMatrix::zeros();
        let mut b = InputMatrix::zeros();

        // Position rows
        a.fixed_view_mut::<3, 3>(POS, POS).fill_with_identity();
        a.fixed_view_mut::<3, 3>(POS, VEL).fill_diagonal(dt - drag * half_dt2);
        a.fixed_view_mut::<3, 4>(POS, QUAT).copy_from(&(da_dq * half_dt2));
        a.fixed_view_mut::<3, 1>(POS, ACT).copy_from(&(da_dthrust * (half_dt2 * hold_thrust)));
        a.fixed_view_mut::<3, 3>(POS, ACT + 1).copy_from(&(da_drates * (half_dt2 * hold_rate)));
        b.fixed_view_mut::<3, 1>(POS, 0).copy_from(&(da_dthrust * (half_dt2 * alpha_thrust)));
        b.fixed_view_mut::<3, 3>(POS, 1).copy_from(&(da_drates * (half_dt2 * alpha_rate)));

        // Velocity rows
        a.fixed_view_mut::<3, 3>(VEL, VEL).fill_diagonal(1.0 - drag * dt);
        a.fixed_view_mut::<3, 4>(VEL, QUAT).copy_from(&(da_dq * dt));
        a.fixed_view_mut::<3, 1>(VEL, ACT).copy_from(&(da_dthrust * (dt * hold_thrust)));
        a.fixed_view_mut::<3, 3>(VEL, ACT + 1).copy_from(&(da_drates * (dt * hold_rate)));
        b.fixed_view_mut::<3, 1>(VEL, 0).copy_from(&(da_dthrust * (dt * alpha_thrust)));
        b.fixed_view_mut::<3, 3>(VEL, 1).copy_from(&(da_drates * (dt * alpha_rate)));

        // Attitude rows
        a.fixed_view_mut::<4, 4>(QUAT, QUAT).copy_from(&dq_dq);
        a.fixed_view_mut::<4, 3>(QUAT, ACT + 1).copy_from(&(dq_drates * hold_rate));
        b.fixed_view_mut::<4, 3>(QUAT, 1).copy_from(&(dq_drates * alpha_rate));

        // Actuator rows
        a[(ACT, ACT)] = hold_thrust;
        b[(ACT, 0)] = alpha_thrust;
        for i in 1..NU {
            a[(ACT + i, ACT + i)] = hold_rate;
            b[(ACT + i, i)] = alpha_rate;
        }

        let next = model.step(state, input, dt);
        Linearization::from_jacobians(a, b, state, input, &next)
    }
}

/// Selects a [`Linearizer`] from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearizationMethod {
    #[default]
    Analytical,
    Numerical,
}

impl Linearizer for LinearizationMethod {
    fn linearize(
        &self,
        model: &QuadrotorModel,
        state: &State,
        input: &Input,
        dt: f64,
    ) -> Linearization {
        match self {
            LinearizationMethod::Analytical => {
                AnalyticalLinearizer.linearize(model, state, input, dt)
            }
            LinearizationMethod::Numerical => {
                NumericalLinearizer::default().linearize(model, state, input, dt)
            }
        }
    }
}
