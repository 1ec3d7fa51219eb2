/// Circle tracking example
///
/// A simulated quadrotor starts on a horizontal circle of radius 1 m at 1 m
/// altitude and follows it for two laps. The plant is the same model the
/// controller predicts with, stepped at 50 Hz.
///
/// Run with `RUST_LOG=debug` to see the per-tick solver statistics.
///
use log::debug;
use nalgebra::Vector3;
use quadmpc::dynamics::{clamp_dt, position, state_from_parts};
use quadmpc::{DroneState, MpcConfig, MpcController, QuadrotorModel, circle_reference};

const CONTROL_DT: f64 = 0.02;
const RADIUS: f64 = 1.0;
const PERIOD: f64 = 6.0;
const LAPS: usize = 2;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = MpcConfig::default();
    let plant = QuadrotorModel::new(config.dynamics);
    let mut mpc = MpcController::new(config)?;

    let center = Vector3::new(0.0, 0.0, 1.0);
    let reference = circle_reference(center, RADIUS, PERIOD, 0.0);

    let start = reference(0.0);
    let mut x = state_from_parts(
        &start.position,
        &start.velocity,
        &nalgebra::UnitQuaternion::identity(),
        &plant.hover_input(),
    );

    let ticks = (LAPS as f64 * PERIOD / CONTROL_DT).round() as usize;
    let mut time = 0.0;
    let mut worst = 0.0f64;
    let mut total_error = 0.0;
    let mut total_qp_iters = 0;
    let mut total_time_us = 0;

    for k in 0..ticks {
        let measured = DroneState::from_model_state(&x, time);
        let command = mpc.compute_control(&measured, &reference, time);

        x = plant.step(&x, &command.as_input(), clamp_dt(CONTROL_DT));
        time += CONTROL_DT;

        let error = (position(&x) - reference(time).position).norm();
        let stats = mpc.last_stats();
        debug!(
            "At step {k:4} in {:2} SQP / {:4} QP iterations, got tracking error : {:05.4}",
            stats.sqp_iterations, stats.qp_iterations, error,
        );

        worst = worst.max(error);
        total_error += error;
        total_qp_iters += stats.qp_iterations;
        total_time_us += stats.solve_time_us;
    }

    println!("Ticks: {ticks}");
    println!("Mean tracking error: {:.4} m", total_error / ticks as f64);
    println!("Worst tracking error: {worst:.4} m");
    println!("Total QP iterations: {total_qp_iters}");
    println!("Mean solve time: {} us", total_time_us / ticks as u64);
    Ok(())
}
