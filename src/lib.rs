//! Sequential-quadratic-programming model predictive control for a
//! quaternion quadrotor model.
//!
//! ```no_run
//! use nalgebra::Vector3;
//! use quadmpc::{DroneState, MpcConfig, MpcController, hover_reference};
//!
//! let mut mpc = MpcController::new(MpcConfig::default()).unwrap();
//! let target = hover_reference(Vector3::new(0.0, 0.0, 1.0), 0.0);
//! let state = DroneState {
//!     position: Vector3::new(0.0, 0.0, 1.5),
//!     velocity: Vector3::zeros(),
//!     orientation: nalgebra::UnitQuaternion::identity(),
//!     timestamp: 0.0,
//! };
//! let command = mpc.compute_control(&state, &target, 0.0);
//! println!("thrust = {}", command.thrust);
//! ```

pub mod condense;
pub mod config;
pub mod controller;
pub mod dynamics;
pub mod error;
pub mod linearize;
pub mod qp;
pub mod reference;
mod sqp;

pub use config::{CostWeights, MpcConfig};
pub use controller::{ControlCommand, DroneState, MpcController, SolveStats};
pub use dynamics::{DynamicsParams, Input, QuadrotorModel, State};
pub use error::{ConfigError, MpcError};
pub use linearize::{
    AnalyticalLinearizer, Linearization, LinearizationMethod, Linearizer, NumericalLinearizer,
};
pub use qp::{QpProblem, QpSettings, QpSolution, QpSolver};
pub use reference::{ReferenceNode, Waypoint, circle_reference, hover_reference, sample_reference};
