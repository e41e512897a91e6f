// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Predicts apogee from coast-phase acceleration data, per SPEC_FULL.md
//! section 4.3.
//!
//! Runs on its own background thread (the reference implementation uses
//! a separate OS process; a thread is this core's standing substitute
//! for a Python `multiprocessing.Process`, since Rust has no GIL to
//! route around). Fits `a(t) = A(1 - Bt)^4` to the observed vertical
//! acceleration with `levenberg-marquardt`, builds a velocity ->
//! delta-height lookup table by integrating the fitted curve forward,
//! and once the fit converges, predicts apogee by interpolating the
//! current velocity into that table. This mirrors
//! `ApogeePredictor._curve_fit` / `_update_prediction_lookup_table` /
//! `_predict_apogee` one for one.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::warn;
use nalgebra::{DVector, Dyn, Matrix, Owned, Vector2, U2};

use crate::bounded_queue::BoundedQueue;
use crate::constants::{
    APOGEE_PREDICTION_MIN_PACKETS, CURVE_FIT_INITIAL, FLIGHT_LENGTH_SECONDS,
    GRAVITY_METERS_PER_SECOND_SQUARED, INTEGRATION_TIME_STEP_SECONDS, JOIN_TIMEOUT,
    MAX_QUEUE_SIZE, UNCERTAINTY_THRESHOLD, WORKER_POLL_TIMEOUT,
};
use crate::error::{internal_error, CanonicalResult};
use crate::packets::{ApogeePredictorDataPacket, ProcessorDataPacket};

fn curve_fit_model(t: f64, a: f64, b: f64) -> f64 {
    a * (1.0 - b * t).powi(4)
}

struct CurveFitProblem {
    params: Vector2<f64>,
    t: DVector<f64>,
    accel: DVector<f64>,
}

impl LeastSquaresProblem<f64, Dyn, U2> for CurveFitProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U2>;
    type ParameterStorage = Owned<f64, U2>;

    fn set_params(&mut self, params: &Vector2<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> Vector2<f64> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let a = self.params[0];
        let b = self.params[1];
        Some(self.t.map(|t| curve_fit_model(t, a, b)) - &self.accel)
    }

    fn jacobian(&self) -> Option<Matrix<f64, Dyn, U2, Owned<f64, Dyn, U2>>> {
        let a = self.params[0];
        let b = self.params[1];
        let n = self.t.len();
        let mut jac = Matrix::<f64, Dyn, U2, Owned<f64, Dyn, U2>>::zeros(n);
        for i in 0..n {
            let t = self.t[i];
            let base = 1.0 - b * t;
            jac[(i, 0)] = base.powi(4);
            jac[(i, 1)] = -4.0 * a * t * base.powi(3);
        }
        Some(jac)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CurveCoefficients {
    a: f64,
    b: f64,
    uncertainties: [f64; 2],
}

/// Velocity -> remaining-delta-height table, ascending by velocity so
/// linear interpolation can run directly against it.
struct LookupTable {
    velocities: Vec<f64>,
    delta_heights: Vec<f64>,
}

impl Default for LookupTable {
    fn default() -> Self {
        LookupTable { velocities: vec![0.0, 0.1], delta_heights: vec![0.1, 0.1] }
    }
}

impl LookupTable {
    /// Linear interpolation matching `numpy.interp`'s clamp-at-the-ends
    /// behavior: velocities outside the table's range return the
    /// nearest endpoint's delta height.
    fn interpolate(&self, velocity: f64) -> f64 {
        let v = &self.velocities;
        let h = &self.delta_heights;
        if velocity <= v[0] {
            return h[0];
        }
        if velocity >= v[v.len() - 1] {
            return h[h.len() - 1];
        }
        let idx = match v.binary_search_by(|probe| probe.partial_cmp(&velocity).unwrap()) {
            Ok(i) => return h[i],
            Err(i) => i,
        };
        let (v0, v1) = (v[idx - 1], v[idx]);
        let (h0, h1) = (h[idx - 1], h[idx]);
        h0 + (h1 - h0) * (velocity - v0) / (v1 - v0)
    }
}

/// Fits the curve, fits the lookup table, and predicts apogee once
/// converged. Owns all the state that, in the reference implementation,
/// only ever lives inside the prediction process.
struct Predictor {
    accelerations: Vec<f64>,
    time_differences: Vec<f64>,
    current_altitude: f64,
    current_velocity: f64,
    has_converged: bool,
    initial_velocity: Option<f64>,
    freeze_initial_velocity: bool,
    lookup_table: LookupTable,
    coefficients: CurveCoefficients,
    predicted_apogee: f64,
}

impl Predictor {
    fn new(freeze_initial_velocity: bool) -> Self {
        Predictor {
            accelerations: Vec::new(),
            time_differences: Vec::new(),
            current_altitude: 0.0,
            current_velocity: 0.0,
            has_converged: false,
            initial_velocity: None,
            freeze_initial_velocity,
            lookup_table: LookupTable::default(),
            coefficients: CurveCoefficients::default(),
            predicted_apogee: 0.0,
        }
    }

    fn extract(&mut self, packets: &[ProcessorDataPacket]) {
        for packet in packets {
            self.accelerations.push(packet.vertical_acceleration);
            self.time_differences.push(packet.time_since_last_data_packet);
        }
        let last = packets.last().unwrap();
        self.current_altitude = last.current_altitude;
        self.current_velocity = last.vertical_velocity;
    }

    fn cumulative_time_differences(&self) -> Vec<f64> {
        let mut sum = 0.0;
        self.time_differences
            .iter()
            .map(|dt| {
                sum += dt;
                sum
            })
            .collect()
    }

    /// Runs `levenberg-marquardt` against the accumulated acceleration
    /// samples and reports both the fitted coefficients and an estimate
    /// of their uncertainty, analogous to `scipy.optimize.curve_fit`'s
    /// `(popt, pcov)` pair.
    fn curve_fit(&mut self, cumulative_time_differences: &[f64]) -> CurveCoefficients {
        let problem = CurveFitProblem {
            params: Vector2::new(CURVE_FIT_INITIAL.0, CURVE_FIT_INITIAL.1),
            t: DVector::from_row_slice(cumulative_time_differences),
            accel: DVector::from_row_slice(&self.accelerations),
        };
        let (solved, report) = LevenbergMarquardt::new().minimize(problem);
        let a = solved.params[0];
        let b = solved.params[1];

        let uncertainties = estimate_uncertainties(&solved, report.objective_function);

        if uncertainties.iter().all(|u| *u < UNCERTAINTY_THRESHOLD) {
            self.has_converged = true;
        }
        let coefficients = CurveCoefficients { a, b, uncertainties };
        self.coefficients = coefficients;
        coefficients
    }

    fn update_lookup_table(&mut self, coefficients: CurveCoefficients) {
        if self.initial_velocity.is_none() || !self.freeze_initial_velocity {
            self.initial_velocity = Some(self.current_velocity);
        }
        let initial_velocity = self.initial_velocity.unwrap();

        let steps = (FLIGHT_LENGTH_SECONDS / INTEGRATION_TIME_STEP_SECONDS) as usize;
        let mut velocity_sum = initial_velocity;
        let mut altitude_sum = 0.0;

        let mut velocities = Vec::with_capacity(steps);
        let mut altitudes = Vec::with_capacity(steps);
        for i in 0..steps {
            let t = i as f64 * INTEGRATION_TIME_STEP_SECONDS;
            let accel = curve_fit_model(t, coefficients.a, coefficients.b)
                - GRAVITY_METERS_PER_SECOND_SQUARED;
            velocity_sum += accel * INTEGRATION_TIME_STEP_SECONDS;
            if velocity_sum < 0.0 {
                continue;
            }
            velocities.push(velocity_sum);
            altitude_sum += velocity_sum * INTEGRATION_TIME_STEP_SECONDS;
            altitudes.push(altitude_sum);
        }

        let predicted_apogee =
            altitudes.iter().cloned().fold(f64::NEG_INFINITY, f64::max).max(0.0);
        let delta_heights: Vec<f64> =
            altitudes.iter().map(|alt| predicted_apogee - alt).collect();

        // The integration runs forward in time, so velocity descends monotonically;
        // flip both series so they ascend by velocity for interpolation.
        velocities.reverse();
        let mut delta_heights = delta_heights;
        delta_heights.reverse();

        self.lookup_table = LookupTable { velocities, delta_heights };
        self.predicted_apogee = predicted_apogee;
    }

    fn predict_apogee(&self) -> f64 {
        self.lookup_table.interpolate(self.current_velocity) + self.current_altitude
    }
}

/// Approximates `scipy.optimize.curve_fit`'s parameter covariance: the
/// diagonal of `(J^T J)^-1`, scaled by the residual variance (reduced
/// chi-square), evaluated at the converged parameters.
fn estimate_uncertainties(problem: &CurveFitProblem, objective_function: f64) -> [f64; 2] {
    let Some(jacobian) = problem.jacobian() else {
        return [f64::INFINITY, f64::INFINITY];
    };
    let n = jacobian.nrows();
    let p = 2;
    if n <= p {
        return [f64::INFINITY, f64::INFINITY];
    }
    let jtj = jacobian.transpose() * &jacobian;
    let Some(inv) = jtj.try_inverse() else {
        return [f64::INFINITY, f64::INFINITY];
    };
    // `objective_function` is half the sum of squared residuals.
    let residual_variance = (2.0 * objective_function) / (n - p) as f64;
    [
        (inv[(0, 0)] * residual_variance).max(0.0).sqrt(),
        (inv[(1, 1)] * residual_variance).max(0.0).sqrt(),
    ]
}

/// Owns the background prediction thread and the two queues that carry
/// input batches and output predictions across it.
pub struct ApogeePredictor {
    input: Arc<BoundedQueue<ProcessorDataPacket>>,
    output: Arc<BoundedQueue<ApogeePredictorDataPacket>>,
    handle: Option<JoinHandle<()>>,
}

impl ApogeePredictor {
    pub fn start(freeze_initial_velocity: bool) -> Self {
        let input = Arc::new(BoundedQueue::new(MAX_QUEUE_SIZE));
        let output = Arc::new(BoundedQueue::new(MAX_QUEUE_SIZE));

        let worker_input = input.clone();
        let worker_output = output.clone();
        let handle = std::thread::spawn(move || {
            let mut predictor = Predictor::new(freeze_initial_velocity);
            let mut last_run_length = 0usize;
            loop {
                let (batches, poisoned) =
                    worker_input.get_many(usize::MAX, WORKER_POLL_TIMEOUT);
                if poisoned {
                    break;
                }
                if batches.is_empty() {
                    continue;
                }
                predictor.extract(&batches);

                if predictor.accelerations.len() - last_run_length >= APOGEE_PREDICTION_MIN_PACKETS
                {
                    let cumulative = predictor.cumulative_time_differences();
                    if !predictor.has_converged {
                        let coefficients = predictor.curve_fit(&cumulative);
                        predictor.update_lookup_table(coefficients);
                    }
                    let apogee = if predictor.has_converged {
                        predictor.predict_apogee()
                    } else {
                        0.0
                    };
                    last_run_length = predictor.accelerations.len();

                    let coefficients = predictor.coefficients;
                    worker_output.push(
                        ApogeePredictorDataPacket {
                            predicted_apogee: apogee,
                            a_coefficient: coefficients.a,
                            b_coefficient: coefficients.b,
                            uncertainty_threshold_1: coefficients.uncertainties[0],
                            uncertainty_threshold_2: coefficients.uncertainties[1],
                        },
                        WORKER_POLL_TIMEOUT,
                    );
                }
            }
        });

        ApogeePredictor { input, output, handle: Some(handle) }
    }

    pub fn processor_data_packet_queue_size(&self) -> usize {
        self.input.len()
    }

    /// Enqueues a batch of Processor Data Packets. Should only be called
    /// during the coast phase, matching the reference implementation.
    pub fn update(&self, packets: Vec<ProcessorDataPacket>) {
        self.input.push_many_unbounded(packets);
    }

    /// Drains every prediction packet produced so far, non-blocking.
    pub fn get_prediction_data_packets(&self) -> Vec<ApogeePredictorDataPacket> {
        let mut all = Vec::new();
        loop {
            let (batch, _poisoned) = self.output.get_many(usize::MAX, Duration::ZERO);
            if batch.is_empty() {
                break;
            }
            all.extend(batch);
        }
        all
    }

    pub fn stop(&mut self) -> CanonicalResult<()> {
        self.input.push_poison();
        if let Some(handle) = self.handle.take() {
            let (tx, rx) = std::sync::mpsc::channel();
            let joined = std::thread::spawn(move || {
                let _ = tx.send(handle.join());
            });
            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(internal_error("apogee prediction thread panicked")),
                Err(_) => warn!(
                    "apogee prediction thread did not terminate within {:?}; continuing shutdown",
                    JOIN_TIMEOUT
                ),
            }
            let _ = joined.join();
        }
        Ok(())
    }
}

impl Drop for ApogeePredictor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn lookup_table_interpolates_linearly() {
        let table = LookupTable { velocities: vec![0.0, 10.0], delta_heights: vec![0.0, 100.0] };
        assert_eq!(table.interpolate(5.0), 50.0);
        assert_eq!(table.interpolate(-5.0), 0.0);
        assert_eq!(table.interpolate(50.0), 100.0);
    }

    #[test]
    fn curve_fit_recovers_known_coefficients() {
        let a_true = 30.0;
        let b_true = 0.02;
        let t: Vec<f64> = (0..200).map(|i| i as f64 * 0.05).collect();
        let accel: Vec<f64> = t.iter().map(|&t| curve_fit_model(t, a_true, b_true)).collect();

        let problem = CurveFitProblem {
            params: Vector2::new(CURVE_FIT_INITIAL.0, CURVE_FIT_INITIAL.1),
            t: DVector::from_row_slice(&t),
            accel: DVector::from_row_slice(&accel),
        };
        let (solved, report) = LevenbergMarquardt::new().minimize(problem);
        assert_relative_eq!(solved.params[0], a_true, epsilon = 0.5);
        assert_relative_eq!(solved.params[1], b_true, epsilon = 0.01);
        assert!(report.objective_function < 1e-6);
    }

    #[test]
    fn predictor_converges_and_predicts_apogee_on_synthetic_descent() {
        let mut predictor = Predictor::new(true);
        let a_true = 40.0;
        let b_true = 0.05;

        let mut packets = Vec::new();
        for i in 0..(APOGEE_PREDICTION_MIN_PACKETS * 3) {
            let t = i as f64 * INTEGRATION_TIME_STEP_SECONDS;
            packets.push(ProcessorDataPacket {
                current_altitude: 500.0 + t * 10.0,
                vertical_velocity: 50.0 - t * 5.0,
                vertical_acceleration: curve_fit_model(t, a_true, b_true),
                time_since_last_data_packet: INTEGRATION_TIME_STEP_SECONDS,
            });
        }

        predictor.extract(&packets);
        let cumulative = predictor.cumulative_time_differences();
        let coefficients = predictor.curve_fit(&cumulative);
        predictor.update_lookup_table(coefficients);

        assert!(predictor.lookup_table.velocities.len() > 1);
        let apogee = predictor.predict_apogee();
        assert!(apogee.is_finite());
    }
}
