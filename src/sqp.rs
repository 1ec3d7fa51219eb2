use std::time::Instant;

use log::{debug, trace};
use nalgebra::DVector;

use crate::condense::{CondensedHorizon, stack_inputs, state_residual};
use crate::controller::{MpcController, SolveStats};
use crate::dynamics::NU;
use crate::linearize::Linearizer;
use crate::reference::{ReferenceNode, Waypoint, sample_reference};

impl MpcController {
    /// Sample N+1 reference nodes starting at `time + command_delay`.
    pub(crate) fn sample_horizon<R>(&mut self, reference: &R, time: f64)
    where
        R: Fn(f64) -> Waypoint + ?Sized,
    {
        let params = self.model.params;
        self.work.reference = sample_reference(
            reference,
            time + self.config.command_delay,
            self.config.dt,
            self.config.horizon_steps + 1,
        )
        .into_iter()
        .map(|waypoint| ReferenceNode::from_waypoint(waypoint, &params))
        .collect();
    }

    /// Nominal inputs from the reference feedforward clamped to the input box,
    /// or from the shifted previous solution when warm starting. States are
    /// rolled out from `x0`.
    pub(crate) fn initialize_nominal(&mut self) {
        let n = self.config.horizon_steps;
        let warm = self.config.warm_start && self.work.inputs.len() == n;

        if warm {
            // Hold the last input
            self.work.inputs.rotate_left(1);
            if n > 1 {
                self.work.inputs[n - 1] = self.work.inputs[n - 2];
            }
        } else {
            // Feedforward of an aggressive reference may leave the box
            let (lower, upper) = self.config.input_bounds();
            self.work.inputs = self.work.reference[..n]
                .iter()
                .map(|node| node.input.zip_zip_map(&lower, &upper, |v, lo, hi| v.clamp(lo, hi)))
                .collect();
        }
        self.rollout_nominal();
    }

    /// Propagate the nonlinear model along the nominal inputs.
    pub(crate) fn rollout_nominal(&mut self) {
        self.work.states = self
            .model
            .rollout(&self.work.x0, &self.work.inputs, self.config.dt);
    }

    /// Linearize the model at every node of the nominal trajectory.
    pub(crate) fn linearize_horizon(&mut self) {
        let dt = self.config.dt;
        let method = self.config.linearization;
        self.work.linearizations = self
            .work
            .states
            .iter()
            .zip(&self.work.inputs)
            .map(|(x, u)| method.linearize(&self.model, x, u, dt))
            .collect();
    }

    /// Bounds on `δU` such that `U_nom + δU` stays inside the input box.
    pub(crate) fn perturbation_bounds(&self) -> (DVector<f64>, DVector<f64>) {
        let (lower, upper) = self.config.input_bounds();
        let n_inputs = self.work.inputs.len() * NU;
        let nominal = stack_inputs(&self.work.inputs);
        let lb = DVector::from_fn(n_inputs, |i, _| lower[i % NU] - nominal[i]);
        let ub = DVector::from_fn(n_inputs, |i, _| upper[i % NU] - nominal[i]);
        (lb, ub)
    }

    /// Run the SQP loop on the current nominal trajectory.
    pub(crate) fn sqp_solve(&mut self) {
        let start = Instant::now();
        // No QP has run until the loop does
        let mut stats = SolveStats {
            qp_converged: self.config.sqp_iterations > 0,
            ..Default::default()
        };

        let n = self.config.horizon_steps;
        let reference_inputs: Vec<_> = self.work.reference[..n]
            .iter()
            .map(|node| node.input)
            .collect();
        let reference_inputs = stack_inputs(&reference_inputs);

        for iter in 0..self.config.sqp_iterations {
            self.linearize_horizon();
            let condensed = CondensedHorizon::build(&self.work.linearizations);

            let residuals: Vec<_> = self.work.states[1..]
                .iter()
                .zip(&self.work.reference[1..])
                .map(|(nominal, node)| state_residual(nominal, &node.state))
                .collect();
            let input_deviation = stack_inputs(&self.work.inputs) - &reference_inputs;
            let (lb, ub) = self.perturbation_bounds();

            let problem =
                condensed.build_qp(&residuals, &self.weights, &input_deviation, lb, ub);
            let solution = self.solver.solve(&problem, None);

            // Apply the step even when the QP stopped early
            for (k, input) in self.work.inputs.iter_mut().enumerate() {
                *input += solution.x.fixed_rows::<NU>(k * NU);
            }
            self.rollout_nominal();

            stats.sqp_iterations = iter + 1;
            stats.qp_iterations += solution.iterations;
            stats.qp_converged &= solution.converged;
            stats.qp_residual = solution.residual;
            stats.step_norm = solution.x.norm();

            trace!(
                "SQP iteration {}: |dU| = {:.3e}, QP iterations = {}, converged = {}",
                iter + 1,
                stats.step_norm,
                solution.iterations,
                solution.converged
            );

            if stats.step_norm < self.config.sqp_tolerance {
                stats.sqp_converged = true;
                break;
            }
        }

        stats.solve_time_us = start.elapsed().as_micros() as u64;
        debug!(
            "SQP finished after {} iterations ({} QP iterations, |dU| = {:.3e}, {} us)",
            stats.sqp_iterations, stats.qp_iterations, stats.step_norm, stats.solve_time_us
        );
        self.stats = stats;
    }
}
