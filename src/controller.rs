use log::debug;
use nalgebra::{UnitQuaternion, Vector3};

use crate::config::{CostWeights, MpcConfig};
use crate::dynamics::{Input, QuadrotorModel, State, state_from_parts};
use crate::error::MpcError;
use crate::linearize::Linearization;
use crate::qp::QpSolver;
use crate::reference::{ReferenceNode, Waypoint};

/// Plant snapshot supplied by the caller once per control tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DroneState {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// Body to world
    pub orientation: UnitQuaternion<f64>,
    pub timestamp: f64,
}

impl DroneState {
    /// Physical part of a model state. Actuator entries are dropped.
    pub fn from_model_state(x: &State, timestamp: f64) -> Self {
        Self {
            position: crate::dynamics::position(x),
            velocity: crate::dynamics::velocity(x),
            orientation: crate::dynamics::orientation(x),
            timestamp,
        }
    }
}

/// Command emitted once per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlCommand {
    /// Collective thrust (m/s²)
    pub thrust: f64,
    /// Body rates (rad/s)
    pub body_rates: Vector3<f64>,
    pub timestamp: f64,
}

impl ControlCommand {
    pub fn from_input(input: &Input, timestamp: f64) -> Self {
        Self {
            thrust: input[0],
            body_rates: Vector3::new(input[1], input[2], input[3]),
            timestamp,
        }
    }

    pub fn as_input(&self) -> Input {
        Input::new(
            self.thrust,
            self.body_rates.x,
            self.body_rates.y,
            self.body_rates.z,
        )
    }
}

/// Diagnostics of the last `compute_control` call
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolveStats {
    /// SQP iterations performed
    pub sqp_iterations: usize,
    /// Last `‖δU‖` fell below the SQP tolerance
    pub sqp_converged: bool,
    /// QP iterations summed over all SQP iterations
    pub qp_iterations: usize,
    /// Every QP met its tolerance
    pub qp_converged: bool,
    /// Residual reported by the last QP
    pub qp_residual: f64,
    /// Last `‖δU‖`
    pub step_norm: f64,
    pub solve_time_us: u64,
}

/// Per-call buffers
#[derive(Debug, Clone, Default)]
pub(crate) struct MpcWorkspace {
    // Current state with the estimated actuators
    pub(crate) x0: State,

    // Nominal trajectory
    pub(crate) states: Vec<State>, // N+1
    pub(crate) inputs: Vec<Input>, // N

    // Sampled reference
    pub(crate) reference: Vec<ReferenceNode>, // N+1

    pub(crate) linearizations: Vec<Linearization>, // N
}

/// Receding-horizon SQP controller.
///
/// Owns its warm-start cache and prediction buffers; everything else is
/// derived from the immutable [`MpcConfig`] at construction. Controllers are
/// independent, one per simulated vehicle.
#[derive(Debug, Clone)]
pub struct MpcController {
    pub(crate) config: MpcConfig,
    pub(crate) model: QuadrotorModel,
    pub(crate) weights: CostWeights,
    pub(crate) solver: QpSolver,
    pub(crate) work: MpcWorkspace,
    pub(crate) stats: SolveStats,
    /// Last command, used as the actuator estimate
    pub(crate) last_input: Option<Input>,
}

impl MpcController {
    /// Validate `config` and derive the cost weights.
    pub fn new(config: MpcConfig) -> Result<Self, MpcError> {
        config.validate()?;

        let weights = CostWeights::from_config(&config);
        debug!("Q = {}", weights.q.transpose());
        debug!("Q_N = {}", weights.q_terminal.transpose());
        debug!("R = {}", weights.r.transpose());
        debug!(
            "N = {}, dt = {} s, linearization = {:?}, warm start = {}",
            config.horizon_steps, config.dt, config.linearization, config.warm_start
        );

        Ok(Self {
            model: QuadrotorModel::new(config.dynamics),
            solver: QpSolver::new(config.qp),
            weights,
            config,
            work: MpcWorkspace::default(),
            stats: SolveStats::default(),
            last_input: None,
        })
    }

    /// # Compute the next control command
    ///
    /// Samples `reference` from `time + command_delay` over the horizon, runs
    /// the SQP loop from `state` and returns the first optimized input.
    ///
    /// Always returns a command. Non-convergence of the QP or the SQP loop is
    /// reported through [`MpcController::last_stats`].
    pub fn compute_control<R>(
        &mut self,
        state: &DroneState,
        reference: &R,
        time: f64,
    ) -> ControlCommand
    where
        R: Fn(f64) -> Waypoint + ?Sized,
    {
        self.set_x0(state);
        self.sample_horizon(reference, time);
        self.initialize_nominal();
        self.sqp_solve();

        let input = self.work.inputs[0];
        self.last_input = Some(input);
        ControlCommand::from_input(&input, time)
    }

    /// Clear the warm-start cache, the prediction and reference buffers, the
    /// statistics and the actuator estimate.
    pub fn reset(&mut self) {
        self.work = MpcWorkspace::default();
        self.stats = SolveStats::default();
        self.last_input = None;
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn model(&self) -> &QuadrotorModel {
        &self.model
    }

    pub fn last_stats(&self) -> &SolveStats {
        &self.stats
    }

    /// Nominal states of the last solve, `x_0..=x_N`. Empty before the first
    /// call and after [`MpcController::reset`].
    pub fn predicted_states(&self) -> &[State] {
        &self.work.states
    }

    /// Nominal inputs of the last solve
    pub fn predicted_inputs(&self) -> &[Input] {
        &self.work.inputs
    }

    pub fn reference_nodes(&self) -> &[ReferenceNode] {
        &self.work.reference
    }

    pub fn reference_waypoints(&self) -> Vec<Waypoint> {
        self.work.reference.iter().map(|node| node.waypoint).collect()
    }

    /// Actuator state assumed for the next call
    pub fn actuator_estimate(&self) -> Input {
        self.last_input.unwrap_or_else(|| self.model.hover_input())
    }

    /// Build `x0` from the caller state and the actuator estimate.
    pub(crate) fn set_x0(&mut self, state: &DroneState) {
        self.work.x0 = state_from_parts(
            &state.position,
            &state.velocity,
            &state.orientation,
            &self.actuator_estimate(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{ACT, quaternion};
    use crate::reference::{circle_reference, hover_reference};
    use approx::assert_relative_eq;

    fn hover_at(position: Vector3<f64>) -> DroneState {
        DroneState {
            position,
            velocity: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            timestamp: 0.0,
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let config = MpcConfig {
            horizon_steps: 0,
            ..Default::default()
        };
        assert!(matches!(
            MpcController::new(config),
            Err(MpcError::Config(_))
        ));
    }

    #[test]
    fn exact_hover_returns_hover_command() {
        let mut mpc = MpcController::new(MpcConfig::default()).unwrap();
        let target = Vector3::new(0.0, 0.0, 1.0);
        let command = mpc.compute_control(&hover_at(target), &hover_reference(target, 0.0), 0.0);

        assert_eq!(command.as_input(), mpc.model().hover_input());
        assert_eq!(command.timestamp, 0.0);
        let stats = mpc.last_stats();
        assert!(stats.sqp_converged);
        assert_eq!(stats.sqp_iterations, 1);
        assert_eq!(stats.step_norm, 0.0);
    }

    #[test]
    fn buffers_cover_the_horizon() {
        let config = MpcConfig::default();
        let n = config.horizon_steps;
        let mut mpc = MpcController::new(config).unwrap();
        assert!(mpc.predicted_states().is_empty());
        assert!(mpc.reference_waypoints().is_empty());

        let reference = circle_reference(Vector3::new(0.0, 0.0, 1.0), 1.0, 6.0, 0.0);
        mpc.compute_control(&hover_at(Vector3::new(1.0, 0.0, 1.0)), &reference, 0.5);

        assert_eq!(mpc.predicted_states().len(), n + 1);
        assert_eq!(mpc.predicted_inputs().len(), n);
        let waypoints = mpc.reference_waypoints();
        assert_eq!(waypoints.len(), n + 1);
        let delay = mpc.config().command_delay;
        assert_relative_eq!(waypoints[0].time, 0.5 + delay, epsilon = 1e-12);
        assert_relative_eq!(
            waypoints[n].time,
            0.5 + delay + n as f64 * mpc.config().dt,
            epsilon = 1e-12
        );

        // The prediction starts at the measured state
        let x0 = mpc.predicted_states()[0];
        assert_eq!(x0[0], 1.0);
        assert_eq!(x0[ACT], mpc.model().params.hover_thrust());
        for x in mpc.predicted_states() {
            assert_relative_eq!(quaternion(x).norm(), 1.0, epsilon = 1e-9);
            assert!(x.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn commands_respect_input_bounds() {
        let config = MpcConfig::default();
        let (lower, upper) = config.input_bounds();
        let mut mpc = MpcController::new(config).unwrap();

        // Far below a fast-moving target
        let reference = circle_reference(Vector3::new(0.0, 0.0, 5.0), 3.0, 2.0, 0.5);
        let mut state = hover_at(Vector3::zeros());
        state.orientation = UnitQuaternion::from_euler_angles(0.4, -0.3, 1.0);

        let command = mpc.compute_control(&state, &reference, 0.0);
        let input = command.as_input();
        for j in 0..4 {
            assert!(input[j] >= lower[j] - 1e-9, "{input}");
            assert!(input[j] <= upper[j] + 1e-9, "{input}");
        }
        for u in mpc.predicted_inputs() {
            assert!(u[0] >= lower[0] - 1e-9 && u[0] <= upper[0] + 1e-9);
        }
        assert_eq!(mpc.actuator_estimate(), input);
    }

    #[test]
    fn feedforward_only_is_clamped_and_unconverged() {
        let config = MpcConfig {
            sqp_iterations: 0,
            ..Default::default()
        };
        let max_thrust = config.max_thrust;
        let mut mpc = MpcController::new(config).unwrap();

        // Climbing at 2 g needs more thrust than the box allows
        let target = Vector3::new(0.0, 0.0, 1.0);
        let reference = move |time: f64| {
            let mut waypoint = Waypoint::hover(target, 0.0).at_time(time);
            waypoint.acceleration = Vector3::new(0.0, 0.0, 20.0);
            waypoint
        };
        let command = mpc.compute_control(&hover_at(target), &reference, 0.0);

        assert_eq!(command.thrust, max_thrust);
        let stats = mpc.last_stats();
        assert_eq!(stats.sqp_iterations, 0);
        assert_eq!(stats.qp_iterations, 0);
        assert!(!stats.qp_converged);
        assert!(!stats.sqp_converged);
    }

    #[test]
    fn reset_matches_a_fresh_controller() {
        let reference = circle_reference(Vector3::new(0.0, 0.0, 1.0), 1.0, 6.0, 0.0);
        let start = hover_at(Vector3::new(0.8, 0.1, 1.2));

        let mut fresh = MpcController::new(MpcConfig::default()).unwrap();
        let expected = fresh.compute_control(&start, &reference, 0.0);

        let mut used = MpcController::new(MpcConfig::default()).unwrap();
        for tick in 0..5 {
            let mut state = start;
            state.position.z += 0.1 * tick as f64;
            used.compute_control(&state, &reference, 0.3 + 0.02 * tick as f64);
        }
        used.reset();
        assert!(used.predicted_states().is_empty());
        assert_eq!(used.last_stats(), &SolveStats::default());

        let command = used.compute_control(&start, &reference, 0.0);
        assert_eq!(command, expected);
        assert_eq!(used.predicted_states(), fresh.predicted_states());
    }

    #[test]
    fn warm_start_shifts_the_previous_solution() {
        let config = MpcConfig {
            warm_start: true,
            sqp_iterations: 1,
            ..Default::default()
        };
        let mut mpc = MpcController::new(config).unwrap();
        let reference = hover_reference(Vector3::new(0.0, 0.0, 1.0), 0.0);
        let state = hover_at(Vector3::new(0.0, 0.0, 1.3));

        mpc.compute_control(&state, &reference, 0.0);
        let previous = mpc.predicted_inputs().to_vec();

        mpc.set_x0(&state);
        mpc.initialize_nominal();
        let n = previous.len();
        assert_eq!(&mpc.work.inputs[..n - 1], &previous[1..]);
        assert_eq!(mpc.work.inputs[n - 1], previous[n - 1]);
        assert_eq!(mpc.work.states[0], mpc.work.x0);
    }

    #[test]
    fn numerical_linearization_gives_the_same_command() {
        let reference = hover_reference(Vector3::new(0.0, 0.0, 1.0), 0.0);
        let state = hover_at(Vector3::new(0.2, -0.1, 1.1));

        let mut analytical = MpcController::new(MpcConfig::default()).unwrap();
        let mut numerical = MpcController::new(MpcConfig {
            linearization: crate::linearize::LinearizationMethod::Numerical,
            ..Default::default()
        })
        .unwrap();

        let a = analytical.compute_control(&state, &reference, 0.0).as_input();
        let b = numerical.compute_control(&state, &reference, 0.0).as_input();
        assert_relative_eq!(a, b, epsilon = 1e-4);
    }
}
