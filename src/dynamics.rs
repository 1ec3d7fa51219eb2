//! Quaternion-parameterized quadrotor model with first-order actuator lag.
//!
//! State layout (14 scalars):
//!
//! | index   | content                                   |
//! |---------|-------------------------------------------|
//! | 0..3    | position, world frame (m)                 |
//! | 3..6    | velocity, world frame (m/s)               |
//! | 6..10   | attitude quaternion w, x, y, z (body→world) |
//! | 10      | lagged collective thrust (m/s²)           |
//! | 11..14  | lagged body rates (rad/s)                 |
//!
//! Input layout (4 scalars): commanded thrust followed by the three commanded
//! body rates. Input bounds are a concern of the optimizer, the model accepts
//! any finite command.

use nalgebra::{
    Matrix3x4, Matrix4, Matrix4x3, Quaternion, SVector, UnitQuaternion, Vector3, Vector4,
};
use serde::{Deserialize, Serialize};

/// Number of states
pub const NX: usize = 14;
/// Number of inputs
pub const NU: usize = 4;

pub const POS: usize = 0;
pub const VEL: usize = 3;
pub const QUAT: usize = 6;
pub const ACT: usize = 10;

/// Largest integration step callers should hand to [`QuadrotorModel::step`].
pub const MAX_DT: f64 = 0.05;

/// Below this norm a quaternion is left unnormalized.
pub(crate) const NORM_EPSILON: f64 = 1e-12;

const DEFAULT_MASS: f64 = 1.0;
const DEFAULT_GRAVITY: f64 = 9.81;
const DEFAULT_LINEAR_DRAG: f64 = 0.1;
const DEFAULT_THRUST_TIME_CONSTANT: f64 = 0.04;
const DEFAULT_RATE_TIME_CONSTANT: f64 = 0.03;

pub type State = SVector<f64, NX>;
pub type Input = SVector<f64, NU>;

/// Physical parameters of the point-mass-with-attitude model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicsParams {
    /// Vehicle mass (kg)
    pub mass: f64,
    /// Gravitational acceleration magnitude (m/s²)
    pub gravity: f64,
    /// Linear drag coefficient (1/s)
    pub linear_drag: f64,
    /// Thrust actuator time constant (s)
    pub thrust_time_constant: f64,
    /// Body-rate actuator time constant (s)
    pub rate_time_constant: f64,
}

impl Default for DynamicsParams {
    fn default() -> Self {
        Self {
            mass: DEFAULT_MASS,
            gravity: DEFAULT_GRAVITY,
            linear_drag: DEFAULT_LINEAR_DRAG,
            thrust_time_constant: DEFAULT_THRUST_TIME_CONSTANT,
            rate_time_constant: DEFAULT_RATE_TIME_CONSTANT,
        }
    }
}

impl DynamicsParams {
    /// Thrust that exactly cancels gravity.
    pub fn hover_thrust(&self) -> f64 {
        self.mass * self.gravity
    }

    /// Exponential smoothing factors `(thrust, rate)` for one step of length `dt`.
    pub fn lag_factors(&self, dt: f64) -> (f64, f64) {
        (
            1.0 - (-dt / self.thrust_time_constant).exp(),
            1.0 - (-dt / self.rate_time_constant).exp(),
        )
    }
}

/// Clamp an integration step to `[0, MAX_DT]`.
pub fn clamp_dt(dt: f64) -> f64 {
    dt.clamp(0.0, MAX_DT)
}

/// Discrete-time quadrotor model. Every method is a pure function of its
/// arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuadrotorModel {
    pub params: DynamicsParams,
}

impl QuadrotorModel {
    pub fn new(params: DynamicsParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DynamicsParams {
        &self.params
    }

    /// Advance `state` by `dt` seconds under the constant command `input`.
    ///
    /// The lagged actuators are updated first and drive the rigid body for the
    /// rest of the step: the attitude is integrated with the new body rates and
    /// renormalized, and the new thrust is rotated with the new attitude.
    pub fn step(&self, state: &State, input: &Input, dt: f64) -> State {
        let params = &self.params;
        let (alpha_thrust, alpha_rate) = params.lag_factors(dt);

        let actuators = actuators(state);
        let mut lagged = actuators;
        lagged[0] += alpha_thrust * (input[0] - actuators[0]);
        for i in 1..NU {
            lagged[i] += alpha_rate * (input[i] - actuators[i]);
        }
        let body_rates = Vector3::new(lagged[1], lagged[2], lagged[3]);

        let q = quaternion(state);
        let q_raw = q + rate_matrix(&body_rates) * q * (0.5 * dt);
        let (q_next, _) = normalize_quaternion(&q_raw);

        let position = position(state);
        let velocity = velocity(state);
        let accel = thrust_direction(&q_next) * (lagged[0] / params.mass)
            - Vector3::z() * params.gravity
            - velocity * params.linear_drag;

        let mut next = State::zeros();
        next.fixed_rows_mut::<3>(POS)
            .copy_from(&(position + velocity * dt + accel * (0.5 * dt * dt)));
        next.fixed_rows_mut::<3>(VEL)
            .copy_from(&(velocity + accel * dt));
        next.fixed_rows_mut::<4>(QUAT).copy_from(&q_next);
        next.fixed_rows_mut::<NU>(ACT).copy_from(&lagged);
        next
    }

    /// Apply [`step`](Self::step) for every input in turn. The returned
    /// trajectory starts with `initial` and holds `inputs.len() + 1` states.
    pub fn rollout(&self, initial: &State, inputs: &[Input], dt: f64) -> Vec<State> {
        let mut states = Vec::with_capacity(inputs.len() + 1);
        states.push(*initial);
        for input in inputs {
            let next = self.step(&states[states.len() - 1], input, dt);
            states.push(next);
        }
        states
    }

    /// Hover command: thrust cancels gravity, no rotation.
    pub fn hover_input(&self) -> Input {
        Input::new(self.params.hover_thrust(), 0.0, 0.0, 0.0)
    }

    /// Level, motionless state at `position` with actuators settled at hover.
    pub fn hover_state(&self, position: Vector3<f64>) -> State {
        state_from_parts(
            &position,
            &Vector3::zeros(),
            &UnitQuaternion::identity(),
            &self.hover_input(),
        )
    }
}

/// Assemble a state vector from its physical parts.
pub fn state_from_parts(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    orientation: &UnitQuaternion<f64>,
    actuators: &Input,
) -> State {
    let mut x = State::zeros();
    x.fixed_rows_mut::<3>(POS).copy_from(position);
    x.fixed_rows_mut::<3>(VEL).copy_from(velocity);
    x[QUAT] = orientation.w;
    x[QUAT + 1] = orientation.i;
    x[QUAT + 2] = orientation.j;
    x[QUAT + 3] = orientation.k;
    x.fixed_rows_mut::<NU>(ACT).copy_from(actuators);
    x
}

pub fn position(x: &State) -> Vector3<f64> {
    x.fixed_rows::<3>(POS).into_owned()
}

pub fn velocity(x: &State) -> Vector3<f64> {
    x.fixed_rows::<3>(VEL).into_owned()
}

/// Attitude as raw `[w, x, y, z]` components.
pub fn quaternion(x: &State) -> Vector4<f64> {
    x.fixed_rows::<4>(QUAT).into_owned()
}

pub fn actuators(x: &State) -> Input {
    x.fixed_rows::<NU>(ACT).into_owned()
}

/// Attitude as a normalized nalgebra quaternion.
pub fn orientation(x: &State) -> UnitQuaternion<f64> {
    UnitQuaternion::new_normalize(Quaternion::new(
        x[QUAT],
        x[QUAT + 1],
        x[QUAT + 2],
        x[QUAT + 3],
    ))
}

/// Divide `q` by its norm. Degenerate quaternions are returned unchanged.
/// The second element is the norm before normalization.
pub fn normalize_quaternion(q: &Vector4<f64>) -> (Vector4<f64>, f64) {
    let norm = q.norm();
    if norm > NORM_EPSILON {
        (q / norm, norm)
    } else {
        (*q, norm)
    }
}

/// Renormalize the attitude block of `x` in place.
pub fn renormalize_attitude(x: &mut State) {
    let (q, _) = normalize_quaternion(&quaternion(x));
    x.fixed_rows_mut::<4>(QUAT).copy_from(&q);
}

/// `Ω(ω)` such that `Ω(ω) q = q ⊗ [0, ω]`.
pub fn rate_matrix(omega: &Vector3<f64>) -> Matrix4<f64> {
    #[rustfmt::skip]
    let m = Matrix4::new(
        0.0,     -omega.x, -omega.y, -omega.z,
        omega.x,  0.0,      omega.z, -omega.y,
        omega.y, -omega.z,  0.0,      omega.x,
        omega.z,  omega.y, -omega.x,  0.0,
    );
    m
}

/// `G(q)` such that `G(q) ω = q ⊗ [0, ω]`.
pub fn rate_input_matrix(q: &Vector4<f64>) -> Matrix4x3<f64> {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    #[rustfmt::skip]
    let m = Matrix4x3::new(
        -x, -y, -z,
         w, -z,  y,
         z,  w, -x,
        -y,  x,  w,
    );
    m
}

/// Rotate a body-frame vector into the world frame with the cross-product
/// form of the sandwich product, `v + w t + u × t` with `t = 2 u × v`.
pub fn rotate_vector(q: &Vector4<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    let u = Vector3::new(q[1], q[2], q[3]);
    let t = u.cross(v) * 2.0;
    v + t * q[0] + u.cross(&t)
}

/// World-frame direction of the body `+z` (thrust) axis.
pub fn thrust_direction(q: &Vector4<f64>) -> Vector3<f64> {
    rotate_vector(q, &Vector3::z())
}

/// Jacobian of [`thrust_direction`] with respect to `[w, x, y, z]`.
pub fn thrust_direction_jacobian(q: &Vector4<f64>) -> Matrix3x4<f64> {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    #[rustfmt::skip]
    let m = Matrix3x4::new(
         2.0 * y,  2.0 * z,  2.0 * w, 2.0 * x,
        -2.0 * x, -2.0 * w,  2.0 * z, 2.0 * y,
         0.0,     -4.0 * x, -4.0 * y, 0.0,
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn model() -> QuadrotorModel {
        QuadrotorModel::default()
    }

    #[test]
    fn hover_is_an_equilibrium() {
        let model = model();
        let start = model.hover_state(Vector3::new(1.0, -2.0, 3.0));
        let input = model.hover_input();
        for dt in [0.001, 0.01, 0.02, 0.035, MAX_DT] {
            let next = model.step(&start, &input, dt);
            assert!((position(&next) - position(&start)).norm() < 1e-3);
            assert!((velocity(&next) - velocity(&start)).norm() < 1e-3);
        }
    }

    #[test]
    fn hover_holds_over_many_steps() {
        let model = model();
        let start = model.hover_state(Vector3::new(0.0, 0.0, 1.0));
        let inputs = vec![model.hover_input(); 500];
        let states = model.rollout(&start, &inputs, 0.02);
        let last = states[states.len() - 1];
        assert!((position(&last) - position(&start)).norm() < 1e-3);
        assert!(velocity(&last).norm() < 1e-3);
    }

    #[test]
    fn quaternion_stays_normalized() {
        let model = model();
        let mut x = model.hover_state(Vector3::zeros());
        for k in 0..2000 {
            let t = k as f64 * 0.01;
            let input = Input::new(
                9.81 + 3.0 * (1.3 * t).sin(),
                4.0 * (2.1 * t).sin(),
                -3.0 * (0.7 * t).cos(),
                2.5 * (3.3 * t).sin(),
            );
            x = model.step(&x, &input, 0.01 + 0.04 * (0.5 + 0.5 * (5.0 * t).sin()));
            assert!((quaternion(&x).norm() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn actuators_approach_command() {
        let model = model();
        let x0 = model.hover_state(Vector3::zeros());
        let command = Input::new(12.0, 0.5, -0.5, 0.25);
        let dt = 0.01;
        let x1 = model.step(&x0, &command, dt);
        let (alpha_thrust, alpha_rate) = model.params.lag_factors(dt);
        assert_relative_eq!(x1[ACT], 9.81 + alpha_thrust * (12.0 - 9.81), epsilon = 1e-12);
        assert_relative_eq!(x1[ACT + 1], alpha_rate * 0.5, epsilon = 1e-12);

        let states = model.rollout(&x0, &vec![command; 200], dt);
        let settled = actuators(&states[200]);
        assert_relative_eq!(settled, command, epsilon = 1e-6);
    }

    #[test]
    fn free_fall_accelerates_downward() {
        let model = model();
        let mut x0 = model.hover_state(Vector3::new(0.0, 0.0, 10.0));
        x0[ACT] = 0.0;
        let next = model.step(&x0, &Input::zeros(), 0.02);
        assert_relative_eq!(next[VEL + 2], -9.81 * 0.02, epsilon = 1e-12);
        assert_relative_eq!(next[POS + 2], 10.0 - 0.5 * 9.81 * 0.02 * 0.02, epsilon = 1e-12);
    }

    #[test]
    fn rotation_matches_nalgebra() {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.4, 1.1);
        let raw = Vector4::new(q.w, q.i, q.j, q.k);
        let v = Vector3::new(0.2, -1.0, 0.7);
        assert_relative_eq!(rotate_vector(&raw, &v), q * v, epsilon = 1e-12);

        let roll = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), FRAC_PI_2);
        let raw = Vector4::new(roll.w, roll.i, roll.j, roll.k);
        assert_relative_eq!(thrust_direction(&raw), Vector3::new(0.0, -1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn rate_matrices_agree_with_quaternion_product() {
        let q = UnitQuaternion::from_euler_angles(0.1, 0.2, -0.3);
        let raw = Vector4::new(q.w, q.i, q.j, q.k);
        let omega = Vector3::new(0.4, -1.2, 0.8);
        let product = q.into_inner() * Quaternion::from_imag(omega);
        let expected = Vector4::new(product.w, product.i, product.j, product.k);
        assert_relative_eq!(rate_matrix(&omega) * raw, expected, epsilon = 1e-12);
        assert_relative_eq!(rate_input_matrix(&raw) * omega, expected, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_quaternion_is_not_divided() {
        let (q, norm) = normalize_quaternion(&Vector4::zeros());
        assert_eq!(q, Vector4::zeros());
        assert_eq!(norm, 0.0);

        let mut x = State::zeros();
        let next = model().step(&x, &Input::zeros(), 0.02);
        assert!(next.iter().all(|v| v.is_finite()));

        x[QUAT] = 2.0;
        renormalize_attitude(&mut x);
        assert_relative_eq!(x[QUAT], 1.0);
    }

    #[test]
    fn dt_clamp() {
        assert_eq!(clamp_dt(0.2), MAX_DT);
        assert_eq!(clamp_dt(0.01), 0.01);
        assert_eq!(clamp_dt(-1.0), 0.0);
    }

    #[test]
    fn state_parts_round_trip() {
        let q = UnitQuaternion::from_euler_angles(0.2, 0.1, -0.6);
        let x = state_from_parts(
            &Vector3::new(1.0, 2.0, 3.0),
            &Vector3::new(-1.0, 0.5, 0.0),
            &q,
            &Input::new(9.0, 0.1, 0.2, 0.3),
        );
        assert_relative_eq!(position(&x), Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(velocity(&x), Vector3::new(-1.0, 0.5, 0.0));
        assert_relative_eq!(orientation(&x).angle_to(&q), 0.0, epsilon = 1e-12);
        assert_relative_eq!(actuators(&x), Input::new(9.0, 0.1, 0.2, 0.3));
    }
}
