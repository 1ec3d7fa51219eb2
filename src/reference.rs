//! Reference trajectories and their conversion into horizon nodes.
//!
//! A reference is any `Fn(f64) -> Waypoint`. The controller samples it at the
//! horizon nodes and turns every sample into a full state and feedforward
//! input with [`ReferenceNode::from_waypoint`].

use std::f64::consts::{FRAC_PI_4, TAU};

use nalgebra::{UnitQuaternion, Vector3};

use crate::dynamics::{DynamicsParams, Input, State, state_from_parts};

/// Largest roll or pitch angle a reference attitude may request.
pub const MAX_TILT: f64 = FRAC_PI_4;

/// One sample of a reference trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub jerk: Vector3<f64>,
    /// Yaw angle (rad)
    pub heading: f64,
    /// Yaw rate (rad/s)
    pub heading_rate: f64,
    pub time: f64,
}

impl Waypoint {
    /// Stationary waypoint.
    pub fn hover(position: Vector3<f64>, heading: f64) -> Self {
        Self {
            position,
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            jerk: Vector3::zeros(),
            heading,
            heading_rate: 0.0,
            time: 0.0,
        }
    }

    #[must_use]
    pub fn at_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }
}

/// A waypoint expanded into model coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceNode {
    pub waypoint: Waypoint,
    /// Target state. The actuator block holds the feedforward input.
    pub state: State,
    /// Feedforward input
    pub input: Input,
}

impl ReferenceNode {
    pub fn from_waypoint(waypoint: Waypoint, params: &DynamicsParams) -> Self {
        let specific_force = waypoint.acceleration + Vector3::z() * params.gravity;
        let attitude = reference_attitude(&specific_force, waypoint.heading);
        let input = Input::new(
            params.mass * specific_force.norm(),
            0.0,
            0.0,
            waypoint.heading_rate,
        );
        let state = state_from_parts(&waypoint.position, &waypoint.velocity, &attitude, &input);

        Self {
            waypoint,
            state,
            input,
        }
    }
}

/// Attitude whose body `+z` axis points along `specific_force`, with yaw
/// `heading`. Roll and pitch are clamped to [`MAX_TILT`].
pub fn reference_attitude(specific_force: &Vector3<f64>, heading: f64) -> UnitQuaternion<f64> {
    let (sin_h, cos_h) = heading.sin_cos();

    // Specific force in the heading frame
    let forward = cos_h * specific_force.x + sin_h * specific_force.y;
    let lateral = -sin_h * specific_force.x + cos_h * specific_force.y;
    // Downward demands keep the thrust axis in the upper hemisphere
    let vertical = specific_force.z.max(f64::MIN_POSITIVE);

    let pitch = forward.atan2(vertical).clamp(-MAX_TILT, MAX_TILT);
    let roll = (-lateral)
        .atan2(forward.hypot(vertical))
        .clamp(-MAX_TILT, MAX_TILT);

    UnitQuaternion::from_euler_angles(roll, pitch, heading)
}

/// Evaluate `reference` at `start_time + k * dt` for `k` in `0..count`.
pub fn sample_reference<R>(reference: &R, start_time: f64, dt: f64, count: usize) -> Vec<Waypoint>
where
    R: Fn(f64) -> Waypoint + ?Sized,
{
    (0..count)
        .map(|k| reference(start_time + k as f64 * dt))
        .collect()
}

/// Constant hover at `position`.
pub fn hover_reference(position: Vector3<f64>, heading: f64) -> impl Fn(f64) -> Waypoint {
    move |time| Waypoint::hover(position, heading).at_time(time)
}

/// Counter-clockwise horizontal circle starting at `center + radius·x̂`.
pub fn circle_reference(
    center: Vector3<f64>,
    radius: f64,
    period: f64,
    heading: f64,
) -> impl Fn(f64) -> Waypoint {
    let omega = TAU / period;
    move |time| {
        let (s, c) = (omega * time).sin_cos();
        Waypoint {
            position: center + Vector3::new(c, s, 0.0) * radius,
            velocity: Vector3::new(-s, c, 0.0) * (radius * omega),
            acceleration: Vector3::new(-c, -s, 0.0) * (radius * omega * omega),
            jerk: Vector3::new(s, -c, 0.0) * (radius * omega.powi(3)),
            heading,
            heading_rate: 0.0,
            time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{ACT, actuators, orientation, thrust_direction};
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn hover_node() {
        let params = DynamicsParams::default();
        let node = ReferenceNode::from_waypoint(
            Waypoint::hover(Vector3::new(1.0, 2.0, 3.0), 0.0),
            &params,
        );
        assert_relative_eq!(node.input, Input::new(params.hover_thrust(), 0.0, 0.0, 0.0));
        assert_eq!(actuators(&node.state), node.input);
        assert_relative_eq!(orientation(&node.state).angle(), 0.0, epsilon = 1e-12);
        assert_eq!(node.state[0], 1.0);
        assert_eq!(node.state[ACT], params.hover_thrust());
    }

    #[test]
    fn heading_only_rotates_about_z() {
        let params = DynamicsParams::default();
        let mut waypoint = Waypoint::hover(Vector3::zeros(), FRAC_PI_2);
        waypoint.heading_rate = 0.4;
        let node = ReferenceNode::from_waypoint(waypoint, &params);
        assert_relative_eq!(
            orientation(&node.state),
            UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
            epsilon = 1e-12
        );
        assert_eq!(node.input[3], 0.4);
    }

    #[test]
    fn thrust_axis_follows_specific_force() {
        let params = DynamicsParams::default();
        for heading in [0.0, 0.7, -2.0] {
            let mut waypoint = Waypoint::hover(Vector3::zeros(), heading);
            waypoint.acceleration = Vector3::new(2.0, -1.5, 0.5);
            let node = ReferenceNode::from_waypoint(waypoint, &params);

            let force = waypoint.acceleration + Vector3::z() * params.gravity;
            let q = node.state.fixed_rows::<4>(crate::dynamics::QUAT).into_owned();
            assert_relative_eq!(thrust_direction(&q), force.normalize(), epsilon = 1e-9);
            assert_relative_eq!(node.input[0], params.mass * force.norm(), epsilon = 1e-12);
        }
    }

    #[test]
    fn tilt_is_clamped() {
        let attitude = reference_attitude(&Vector3::new(50.0, 0.0, 9.81), 0.0);
        let (roll, pitch, yaw) = attitude.euler_angles();
        assert_relative_eq!(pitch, MAX_TILT, epsilon = 1e-9);
        assert_relative_eq!(roll, 0.0, epsilon = 1e-12);
        assert_relative_eq!(yaw, 0.0, epsilon = 1e-12);

        let attitude = reference_attitude(&Vector3::new(0.0, 50.0, 9.81), 0.0);
        let (roll, _, _) = attitude.euler_angles();
        assert_relative_eq!(roll, -MAX_TILT, epsilon = 1e-9);
    }

    #[test]
    fn downward_demand_stays_level() {
        for forward in [0.0, -0.0] {
            let attitude = reference_attitude(&Vector3::new(forward, 0.0, -2.0), 0.0);
            assert_relative_eq!(attitude.angle(), 0.0, epsilon = 1e-12);
        }

        // Falling faster than gravity while tracking a heading
        let params = DynamicsParams::default();
        let mut waypoint = Waypoint::hover(Vector3::zeros(), 1.2);
        waypoint.acceleration = Vector3::new(0.0, 0.0, -2.0 * params.gravity);
        let node = ReferenceNode::from_waypoint(waypoint, &params);
        let q = node.state.fixed_rows::<4>(crate::dynamics::QUAT).into_owned();
        assert_relative_eq!(thrust_direction(&q), Vector3::z(), epsilon = 1e-12);

        // A horizontal component still tilts, up to the clamp
        let attitude = reference_attitude(&Vector3::new(1.0, 0.0, -2.0), 0.0);
        let (_, pitch, _) = attitude.euler_angles();
        assert_relative_eq!(pitch, MAX_TILT, epsilon = 1e-9);
    }

    #[test]
    fn sampling_times() {
        let samples = sample_reference(&hover_reference(Vector3::zeros(), 0.0), 0.02, 0.05, 4);
        let times: Vec<f64> = samples.iter().map(|wp| wp.time).collect();
        assert_eq!(times.len(), 4);
        for (k, time) in times.iter().enumerate() {
            assert_relative_eq!(*time, 0.02 + 0.05 * k as f64, epsilon = 1e-15);
        }
    }

    #[test]
    fn circle_derivatives_are_consistent() {
        let reference = circle_reference(Vector3::new(0.0, 0.0, 1.0), 1.5, 4.0, 0.0);
        let h = 1e-6;
        for time in [0.0, 0.3, 1.7, 3.9] {
            let a = reference(time);
            let b = reference(time + h);
            assert_relative_eq!((b.position - a.position) / h, a.velocity, epsilon = 1e-4);
            assert_relative_eq!((b.velocity - a.velocity) / h, a.acceleration, epsilon = 1e-4);
            assert_relative_eq!((b.acceleration - a.acceleration) / h, a.jerk, epsilon = 1e-4);
            assert_relative_eq!((a.position - Vector3::z()).norm(), 1.5, epsilon = 1e-12);
        }
    }
}
