// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The flight-phase state machine: Standby -> MotorBurn -> Coast ->
//! FreeFall -> Landed, per SPEC_FULL.md section 4.5.
//!
//! Each state borrows the Context for the duration of a single `update`
//! call rather than holding a back-reference to it, per section 4.5.2:
//! `update` returns `Some(next_state)` to advance, `None` to stay. This
//! sidesteps the cyclic-reference problem the reference implementation's
//! `state.context` back-pointer has no need to solve in a
//! garbage-collected language.

use log::info;

use crate::constants::{
    DISTANCE_FROM_APOGEE, GROUND_ALTITUDE_METERS, LANDED_ACCELERATION_METERS_PER_SECOND_SQUARED,
    MAX_FREE_FALL_SECONDS, MAX_VELOCITY_THRESHOLD, MOTOR_BURN_TIME, TAKEOFF_HEIGHT,
    TAKEOFF_VELOCITY,
};
use crate::context::Context;

/// A single flight phase. `update` runs once per Context iteration and
/// may hand back a new state to transition into.
pub trait State: Send {
    fn name(&self) -> char;
    fn update(&mut self, ctx: &mut Context) -> Option<Box<dyn State>>;
}

/// On the pad. Waits for liftoff.
#[derive(Default)]
pub struct StandbyState;

impl State for StandbyState {
    fn name(&self) -> char {
        'S'
    }

    fn update(&mut self, ctx: &mut Context) -> Option<Box<dyn State>> {
        let dp = ctx.data_processor();
        if dp.vertical_velocity() > TAKEOFF_VELOCITY || dp.current_altitude() > TAKEOFF_HEIGHT {
            info!("liftoff detected, transitioning to MotorBurn");
            ctx.start_camera_recording();
            return Some(Box::new(MotorBurnState::new(ctx)));
        }
        None
    }
}

/// Powered ascent. Waits for the motor to stop accelerating the rocket.
pub struct MotorBurnState {
    start_time_ns: i64,
}

impl MotorBurnState {
    /// Records the IMU-packet timestamp at entry, per SPEC_FULL.md section
    /// 4.5's `start_time_ns`. Timing the burn off flight-data time rather
    /// than host wall-clock time keeps the fallback correct under
    /// `--fast-replay`, where replayed flight time runs far faster (or
    /// slower) than real time.
    pub fn new(ctx: &Context) -> Self {
        MotorBurnState { start_time_ns: ctx.data_processor().current_timestamp_ns() }
    }
}

impl State for MotorBurnState {
    fn name(&self) -> char {
        'M'
    }

    fn update(&mut self, ctx: &mut Context) -> Option<Box<dyn State>> {
        let dp = ctx.data_processor();
        let stopped_accelerating =
            dp.vertical_velocity() < dp.max_vertical_velocity() * (1.0 - MAX_VELOCITY_THRESHOLD);
        let elapsed_ns = dp.current_timestamp_ns() - self.start_time_ns;
        let burn_timed_out = elapsed_ns > MOTOR_BURN_TIME.as_nanos() as i64;
        if stopped_accelerating || burn_timed_out {
            info!("motor burnout detected, transitioning to Coast");
            return Some(Box::new(CoastState::new()));
        }
        None
    }
}

/// Unpowered ascent toward apogee. The only state that runs the air-brake
/// control law.
pub struct CoastState {
    airbrakes_extended: bool,
}

impl CoastState {
    pub fn new() -> Self {
        CoastState { airbrakes_extended: false }
    }
}

impl State for CoastState {
    fn name(&self) -> char {
        'C'
    }

    fn update(&mut self, ctx: &mut Context) -> Option<Box<dyn State>> {
        let predicted = ctx.last_apogee_predictor_packet().predicted_apogee;
        if predicted > 0.0 {
            if predicted > ctx.target_altitude_meters() && !self.airbrakes_extended {
                ctx.extend_airbrakes();
                self.airbrakes_extended = true;
            } else if predicted <= ctx.target_altitude_meters() && self.airbrakes_extended {
                ctx.retract_airbrakes();
                self.airbrakes_extended = false;
            }
        }

        let dp = ctx.data_processor();
        let past_apogee_distance = dp.max_altitude() - dp.current_altitude() > DISTANCE_FROM_APOGEE;
        let already_descending = dp.vertical_velocity() <= 0.0;
        if past_apogee_distance || already_descending {
            info!("apogee detected, transitioning to FreeFall");
            return Some(Box::new(FreeFallState::new(ctx)));
        }
        None
    }
}

/// Unpowered descent. Waits for ground contact.
pub struct FreeFallState {
    start_time_ns: i64,
}

impl FreeFallState {
    /// Records the IMU-packet timestamp at entry, so the dead-man fallback
    /// below is timed off flight-data time rather than host wall-clock time
    /// (see `MotorBurnState::new`).
    pub fn new(ctx: &Context) -> Self {
        FreeFallState { start_time_ns: ctx.data_processor().current_timestamp_ns() }
    }
}

impl State for FreeFallState {
    fn name(&self) -> char {
        'F'
    }

    fn update(&mut self, ctx: &mut Context) -> Option<Box<dyn State>> {
        let dp = ctx.data_processor();
        // A ground-impact deceleration spike, not the near-zero proper
        // acceleration of true free fall, is what actually signals landing.
        let landed_signature = dp.current_altitude() <= GROUND_ALTITUDE_METERS
            && dp.current_vertical_acceleration().abs() >= LANDED_ACCELERATION_METERS_PER_SECOND_SQUARED;
        let elapsed_ns = dp.current_timestamp_ns() - self.start_time_ns;
        let dead_man = elapsed_ns > MAX_FREE_FALL_SECONDS.as_nanos() as i64;
        if landed_signature || dead_man {
            info!("landing detected, transitioning to Landed");
            return Some(Box::new(LandedState));
        }
        None
    }
}

/// Terminal state. Requests Context shutdown once the Logger's idle
/// ring buffer fills, per SPEC_FULL.md section 4.5.1's resolution of the
/// discrepancy between spec.md's prose and the reference test suite.
#[derive(Default)]
pub struct LandedState;

impl State for LandedState {
    fn name(&self) -> char {
        'L'
    }

    fn update(&mut self, ctx: &mut Context) -> Option<Box<dyn State>> {
        if ctx.logger().is_log_buffer_full() {
            info!("log buffer full in Landed, requesting shutdown");
            ctx.request_shutdown();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apogee_predictor::ApogeePredictor;
    use crate::imu_source::{ImuSource, MockImuBackend};
    use crate::logger::Logger;
    use crate::servo::{MockServoBackend, Servo};

    fn test_context() -> Context {
        let tempdir = std::env::temp_dir()
            .join(format!("airbrakes-state-test-{:?}", std::thread::current().id()));
        Context::new(
            ImuSource::start(Box::new(MockImuBackend::new(vec![]))),
            Servo::new(Box::new(MockServoBackend::default())),
            Logger::start(&tempdir).unwrap(),
            ApogeePredictor::start(true),
            1100.0,
        )
    }

    #[test]
    fn standby_stays_standby_below_thresholds() {
        let mut ctx = test_context();
        let mut state: Box<dyn State> = Box::new(StandbyState);
        assert!(state.update(&mut ctx).is_none());
        assert_eq!(state.name(), 'S');
    }

    #[test]
    fn landed_is_terminal() {
        let mut ctx = test_context();
        let mut state: Box<dyn State> = Box::new(LandedState);
        assert!(state.update(&mut ctx).is_none());
        assert_eq!(state.name(), 'L');
    }

    #[test]
    fn coast_extends_once_when_prediction_exceeds_target() {
        let mut ctx = test_context();
        let mut state = CoastState::new();
        ctx.set_last_apogee_predictor_packet_for_test(crate::packets::ApogeePredictorDataPacket {
            predicted_apogee: 1200.0,
            ..Default::default()
        });
        state.update(&mut ctx);
        assert_eq!(ctx.servo().current_extension(), crate::packets::ServoExtension::MaxExtension);
        assert!(state.airbrakes_extended);

        // A second call with the same prediction must not re-extend (idempotent).
        state.update(&mut ctx);
        assert!(state.airbrakes_extended);
    }

    #[test]
    fn coast_retracts_when_prediction_drops_below_target() {
        let mut ctx = test_context();
        let mut state = CoastState::new();
        state.airbrakes_extended = true;
        ctx.set_last_apogee_predictor_packet_for_test(crate::packets::ApogeePredictorDataPacket {
            predicted_apogee: 1000.0,
            ..Default::default()
        });
        state.update(&mut ctx);
        assert_eq!(ctx.servo().current_extension(), crate::packets::ServoExtension::MinExtension);
        assert!(!state.airbrakes_extended);
    }

    #[test]
    fn coast_transitions_to_freefall_on_descending_velocity_alone() {
        let mut ctx = test_context();
        // Nowhere near the distance-from-apogee threshold, but velocity has
        // already gone non-positive: this alone must trigger the transition.
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            1000.0, 990.0, -0.5, -9.8, 0,
        ));
        let mut state = CoastState::new();
        let next = state.update(&mut ctx);
        assert_eq!(next.expect("should transition to FreeFall").name(), 'F');
    }

    #[test]
    fn coast_stays_coast_while_still_ascending_and_near_apogee() {
        let mut ctx = test_context();
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            1000.0, 990.0, 5.0, -9.8, 0,
        ));
        let mut state = CoastState::new();
        assert!(state.update(&mut ctx).is_none());
    }

    #[test]
    fn freefall_stays_freefall_near_ground_with_small_acceleration() {
        let mut ctx = test_context();
        // Below ground altitude but still in near-zero-g free fall: must
        // NOT be mistaken for the ground-impact spike that signals landing.
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            1000.0, 10.0, -20.0, -0.1, 0,
        ));
        let mut state = FreeFallState::new(&ctx);
        assert!(state.update(&mut ctx).is_none());
    }

    #[test]
    fn freefall_transitions_to_landed_on_impact_spike() {
        let mut ctx = test_context();
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            1000.0, 10.0, -20.0, 15.0, 0,
        ));
        let mut state = FreeFallState::new(&ctx);
        let next = state.update(&mut ctx);
        assert_eq!(next.expect("should transition to Landed").name(), 'L');
    }

    #[test]
    fn motor_burn_times_out_off_flight_data_time_not_wall_clock() {
        let mut ctx = test_context();
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            0.0, 0.0, 50.0, 20.0, 0,
        ));
        let mut state = MotorBurnState::new(&ctx);

        // Still accelerating and well within MOTOR_BURN_TIME: no transition,
        // even though a real `Instant`-based timer would never have fired
        // here since no wall-clock time has actually elapsed.
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            0.0, 0.0, 50.0, 20.0, 1,
        ));
        assert!(state.update(&mut ctx).is_none());

        // Flight-data time has now advanced past MOTOR_BURN_TIME, entirely
        // via synthetic timestamps with no real sleep: the dead-man fallback
        // must fire.
        let timed_out_ns = MOTOR_BURN_TIME.as_nanos() as i64 + 1;
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            0.0, 0.0, 50.0, 20.0, timed_out_ns,
        ));
        let next = state.update(&mut ctx);
        assert_eq!(next.expect("burn should time out").name(), 'C');
    }

    #[test]
    fn freefall_dead_man_fires_off_flight_data_time_not_wall_clock() {
        let mut ctx = test_context();
        // Above ground and low acceleration: no landed signature, so only
        // the dead-man fallback can produce a transition here.
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            1000.0, 500.0, -20.0, -0.1, 0,
        ));
        let mut state = FreeFallState::new(&ctx);
        assert!(state.update(&mut ctx).is_none());

        let timed_out_ns = MAX_FREE_FALL_SECONDS.as_nanos() as i64 + 1;
        ctx.set_data_processor_for_test(crate::data_processor::DataProcessor::for_test(
            1000.0, 500.0, -20.0, -0.1, timed_out_ns,
        ));
        let next = state.update(&mut ctx);
        assert_eq!(next.expect("free fall should time out").name(), 'L');
    }
}
