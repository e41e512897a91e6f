// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Tunable constants for the flight-control core.
//!
//! Values carried from the reference implementation's own `constants.py`
//! are noted as such; everything else is a default sized for a ~1 kHz,
//! multi-minute high-power-rocket flight and documented in `DESIGN.md`
//! under "Missing canonical numeric constants".

use std::time::Duration;

// -------------------------------------------------------
// Servo configuration (reference `constants.py`)
// -------------------------------------------------------

pub const MIN_EXTENSION: f64 = -0.2;
pub const MIN_NO_BUZZ: f64 = -0.12;
pub const MAX_EXTENSION: f64 = 0.2605;
pub const MAX_NO_BUZZ: f64 = 0.2;

/// How long the servo holds the full-travel position before backing off
/// to the silent holding position.
pub const SERVO_DELAY: Duration = Duration::from_millis(2000);

// -------------------------------------------------------
// IMU / queue configuration
// -------------------------------------------------------

/// Per-poll sensor read timeout; the IMU worker must never block the
/// sensor read loop longer than this.
pub const IMU_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Bounded wait the main task tolerates on `ImuSource::get_many`.
pub const IMU_TIMEOUT: Duration = Duration::from_millis(200);

/// Bound on how many packets `get_many` returns per call.
pub const IMU_GET_MANY_MAX: usize = 2000;

/// Capacity, in items, of every `BoundedQueue` in the system. The
/// reference implementation bounds its queues in bytes
/// (`BUFFER_SIZE_IN_BYTES`); an item-count bound is the natural
/// translation for a queue of fixed-shape Rust structs.
pub const MAX_QUEUE_SIZE: usize = 100_000;

/// Bounded wait a background worker tolerates on its own input queue
/// before re-checking its shutdown flag.
pub const WORKER_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound on how long any `stop()` is allowed to block the caller.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// -------------------------------------------------------
// Orientation / kinematics
// -------------------------------------------------------

pub const GRAVITY_METERS_PER_SECOND_SQUARED: f64 = 9.798;

/// Accelerations within this neighborhood of zero (after subtracting
/// gravity) are treated as exactly zero before integration, to suppress
/// sensor-noise integration drift.
pub const ACCEL_DEADBAND_METERS_PER_SECOND_SQUARED: f64 = 0.1;

// -------------------------------------------------------
// State machine configuration
// -------------------------------------------------------

/// Standby -> MotorBurn trigger (reference `constants.py`: `TAKEOFF_SPEED`).
pub const TAKEOFF_VELOCITY: f64 = 10.0;
/// Standby -> MotorBurn trigger (reference `constants.py`: `TAKEOFF_HEIGHT`).
pub const TAKEOFF_HEIGHT: f64 = 10.0;

/// MotorBurn -> Coast trigger: fraction below the running max velocity
/// that counts as "stopped accelerating".
pub const MAX_VELOCITY_THRESHOLD: f64 = 0.05;
/// MotorBurn -> Coast fallback trigger (reference `constants.py`:
/// `MOTOR_BURN_TIME`).
pub const MOTOR_BURN_TIME: Duration = Duration::from_millis(2300);

/// Coast -> FreeFall trigger (reference `constants.py`:
/// `DISTANCE_FROM_APOGEE`).
pub const DISTANCE_FROM_APOGEE: f64 = 250.0;

/// FreeFall -> Landed altitude trigger (reference `constants.py`:
/// `GROUND_ALTITIUDE`).
pub const GROUND_ALTITUDE_METERS: f64 = 15.0;
/// FreeFall -> Landed acceleration-signature trigger: the magnitude of
/// vertical acceleration (with gravity already subtracted) must fall
/// below this to count as "landed", not just "in free fall".
pub const LANDED_ACCELERATION_METERS_PER_SECOND_SQUARED: f64 = 1.0;
/// FreeFall dead-man fallback: force a Landed transition regardless of
/// altitude/acceleration if free fall runs this long.
pub const MAX_FREE_FALL_SECONDS: Duration = Duration::from_secs(120);

// -------------------------------------------------------
// Apogee prediction configuration
// -------------------------------------------------------

/// Default target apogee (reference `constants.py` uses 1554 m; this
/// default matches the altitude used by this spec's own worked scenario
/// and is overridable via the launch configuration / CLI per SPEC_FULL.md
/// section 6).
pub const TARGET_ALTITUDE_METERS: f64 = 1100.0;

/// Minimum number of new samples since the last fit before the worker
/// re-fits the drag model.
pub const APOGEE_PREDICTION_MIN_PACKETS: usize = 50;

/// Initial (A0, B0) seed for the Levenberg-Marquardt curve fit.
pub const CURVE_FIT_INITIAL: (f64, f64) = (30.0, 0.01);

/// Both covariance-diagonal uncertainties must fall below this for the
/// fit to be considered converged.
pub const UNCERTAINTY_THRESHOLD: f64 = 0.01;

/// Step size, in seconds, of the lookup-table integration grid.
pub const INTEGRATION_TIME_STEP_SECONDS: f64 = 0.01;

/// Length, in seconds, of the lookup-table integration grid.
pub const FLIGHT_LENGTH_SECONDS: f64 = 60.0;

// -------------------------------------------------------
// Logging configuration
// -------------------------------------------------------

/// Rows written to disk per run of Standby/Landed before the Logger
/// switches to ring-buffering.
pub const IDLE_LOG_CAPACITY: usize = 2_000;

/// Capacity of the idle-phase ring buffer.
pub const LOG_BUFFER_SIZE: usize = 5_000;

/// Flush + fsync the log file after this many rows written.
pub const NUMBER_OF_LINES_TO_LOG_BEFORE_FLUSHING: usize = 1_000;

// -------------------------------------------------------
// Process configuration
// -------------------------------------------------------

/// `nice` value `Context::start()` attempts to apply to the process.
/// Negative values raise scheduling priority; this is best-effort and
/// failure (e.g. unprivileged process) is logged, not fatal.
pub const MAIN_PROCESS_NICE: i32 = -10;
