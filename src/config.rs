//! Controller configuration
//!
//! Every field is optional in a TOML document; missing keys take the defaults
//! below. A configuration is checked once by [`MpcConfig::validate`] and is
//! immutable afterwards.

use serde::{Deserialize, Serialize};

use crate::dynamics::{ACT, DynamicsParams, Input, MAX_DT, NU, POS, QUAT, State, VEL};
use crate::error::ConfigError;
use crate::linearize::LinearizationMethod;
use crate::qp::QpSettings;

// Default settings
const MPC_DEFAULT_HORIZON_STEPS: usize = 20;
const MPC_DEFAULT_DT: f64 = 0.05;
const MPC_DEFAULT_WEIGHT_POSITION: f64 = 100.0;
const MPC_DEFAULT_WEIGHT_VELOCITY: f64 = 10.0;
const MPC_DEFAULT_WEIGHT_ATTITUDE: f64 = 10.0;
const MPC_DEFAULT_WEIGHT_YAW: f64 = 10.0;
const MPC_DEFAULT_WEIGHT_THRUST: f64 = 0.1;
const MPC_DEFAULT_WEIGHT_RATE: f64 = 0.5;
const MPC_DEFAULT_TERMINAL_MULTIPLIER: f64 = 10.0;
const MPC_DEFAULT_MIN_THRUST: f64 = 2.0;
const MPC_DEFAULT_MAX_THRUST: f64 = 20.0;
const MPC_DEFAULT_MAX_RATE: f64 = 6.0;
const MPC_DEFAULT_MAX_YAW_RATE: f64 = 3.0;
const MPC_DEFAULT_SQP_ITERATIONS: usize = 3;
const MPC_DEFAULT_SQP_TOLERANCE: f64 = 1e-4;
const MPC_DEFAULT_COMMAND_DELAY: f64 = 0.02;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    /// Number of control intervals N
    pub horizon_steps: usize,
    /// Interval length (s)
    pub dt: f64,

    // Stage cost weights
    pub weight_position: f64,
    pub weight_velocity: f64,
    /// Quaternion w, x and y components
    pub weight_attitude: f64,
    /// Quaternion z component
    pub weight_yaw: f64,
    pub weight_thrust: f64,
    pub weight_rate: f64,
    /// Scales the state weights of the last node
    pub terminal_multiplier: f64,

    // Input bounds
    pub min_thrust: f64,
    pub max_thrust: f64,
    /// Roll and pitch rate limit (rad/s)
    pub max_rate: f64,
    pub max_yaw_rate: f64,

    pub sqp_iterations: usize,
    /// Stop the SQP loop once `‖δU‖` falls below this
    pub sqp_tolerance: f64,

    /// Latency between measurement and actuation (s). The reference is
    /// sampled from `time + command_delay`.
    pub command_delay: f64,

    /// Seed the nominal inputs with the shifted previous solution instead of
    /// the reference feedforward
    pub warm_start: bool,
    pub linearization: LinearizationMethod,

    pub dynamics: DynamicsParams,
    pub qp: QpSettings,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            horizon_steps: MPC_DEFAULT_HORIZON_STEPS,
            dt: MPC_DEFAULT_DT,
            weight_position: MPC_DEFAULT_WEIGHT_POSITION,
            weight_velocity: MPC_DEFAULT_WEIGHT_VELOCITY,
            weight_attitude: MPC_DEFAULT_WEIGHT_ATTITUDE,
            weight_yaw: MPC_DEFAULT_WEIGHT_YAW,
            weight_thrust: MPC_DEFAULT_WEIGHT_THRUST,
            weight_rate: MPC_DEFAULT_WEIGHT_RATE,
            terminal_multiplier: MPC_DEFAULT_TERMINAL_MULTIPLIER,
            min_thrust: MPC_DEFAULT_MIN_THRUST,
            max_thrust: MPC_DEFAULT_MAX_THRUST,
            max_rate: MPC_DEFAULT_MAX_RATE,
            max_yaw_rate: MPC_DEFAULT_MAX_YAW_RATE,
            sqp_iterations: MPC_DEFAULT_SQP_ITERATIONS,
            sqp_tolerance: MPC_DEFAULT_SQP_TOLERANCE,
            command_delay: MPC_DEFAULT_COMMAND_DELAY,
            warm_start: false,
            linearization: LinearizationMethod::default(),
            dynamics: DynamicsParams::default(),
            qp: QpSettings::default(),
        }
    }
}

impl MpcConfig {
    /// Parse a TOML document and validate the result.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon_steps == 0 {
            return Err(ConfigError::EmptyHorizon);
        }
        if !(self.dt.is_finite() && self.dt > 0.0 && self.dt <= MAX_DT) {
            return Err(ConfigError::InvalidTimeStep(self.dt, MAX_DT));
        }

        for (name, value) in [
            ("weight_position", self.weight_position),
            ("weight_velocity", self.weight_velocity),
            ("weight_attitude", self.weight_attitude),
            ("weight_yaw", self.weight_yaw),
            ("weight_thrust", self.weight_thrust),
            ("weight_rate", self.weight_rate),
            ("terminal_multiplier", self.terminal_multiplier),
            ("sqp_tolerance", self.sqp_tolerance),
            ("command_delay", self.command_delay),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidWeight { name, value });
            }
        }

        for (name, value) in [
            ("min_thrust", self.min_thrust),
            ("max_thrust", self.max_thrust),
            ("max_rate", self.max_rate),
            ("max_yaw_rate", self.max_yaw_rate),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidBound {
                    name,
                    reason: "not finite",
                });
            }
        }
        if self.min_thrust > self.max_thrust {
            return Err(ConfigError::InvalidBound {
                name: "min_thrust",
                reason: "exceeds max_thrust",
            });
        }
        if self.max_rate < 0.0 {
            return Err(ConfigError::InvalidBound {
                name: "max_rate",
                reason: "negative",
            });
        }
        if self.max_yaw_rate < 0.0 {
            return Err(ConfigError::InvalidBound {
                name: "max_yaw_rate",
                reason: "negative",
            });
        }

        let params = &self.dynamics;
        for (name, value) in [
            ("dynamics.mass", params.mass),
            ("dynamics.thrust_time_constant", params.thrust_time_constant),
            ("dynamics.rate_time_constant", params.rate_time_constant),
            ("qp.tolerance", self.qp.tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidParameter { name, value });
            }
        }
        for (name, value) in [
            ("dynamics.gravity", params.gravity),
            ("dynamics.linear_drag", params.linear_drag),
            ("qp.regularization", self.qp.regularization),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidParameter { name, value });
            }
        }

        Ok(())
    }

    /// Lower and upper input bounds as absolute values.
    pub fn input_bounds(&self) -> (Input, Input) {
        (
            Input::new(
                self.min_thrust,
                -self.max_rate,
                -self.max_rate,
                -self.max_yaw_rate,
            ),
            Input::new(
                self.max_thrust,
                self.max_rate,
                self.max_rate,
                self.max_yaw_rate,
            ),
        )
    }

    /// Time covered by the prediction horizon (s)
    pub fn horizon_duration(&self) -> f64 {
        self.horizon_steps as f64 * self.dt
    }
}

/// Diagonal cost weights, derived once from [`MpcConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct CostWeights {
    /// Stage state weights
    pub q: State,
    /// Terminal state weights
    pub q_terminal: State,
    /// Input weights
    pub r: Input,
}

impl CostWeights {
    pub fn from_config(config: &MpcConfig) -> Self {
        let mut q = State::zeros();
        q.fixed_rows_mut::<3>(POS).fill(config.weight_position);
        q.fixed_rows_mut::<3>(VEL).fill(config.weight_velocity);
        q.fixed_rows_mut::<3>(QUAT).fill(config.weight_attitude);
        q[QUAT + 3] = config.weight_yaw;
        // Lagged actuators are steered through the input weights only
        q.fixed_rows_mut::<NU>(ACT).fill(0.0);

        let r = Input::new(
            config.weight_thrust,
            config.weight_rate,
            config.weight_rate,
            config.weight_rate,
        );

        Self {
            q,
            q_terminal: q * config.terminal_multiplier,
            r,
        }
    }

    /// State weights of node `k` (1-based along the predicted trajectory).
    pub fn state_weights(&self, k: usize, horizon_steps: usize) -> &State {
        if k == horizon_steps {
            &self.q_terminal
        } else {
            &self.q
        }
    }
}
