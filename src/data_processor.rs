// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Turns a batch of Estimated IMU Packets into kinematic state: zeroed
//! altitude, vertical velocity (by integrating rotated acceleration),
//! and running maxima, per SPEC_FULL.md section 4.2.
//!
//! This is a direct port of the reference implementation's
//! `DataProcessor`, substituting `nalgebra::UnitQuaternion` for
//! `scipy.spatial.transform.Rotation`: `Rotation.from_rotvec` becomes
//! `UnitQuaternion::from_scaled_axis`, and `Rotation.apply` becomes
//! `UnitQuaternion::transform_vector`. Quaternion component order
//! (w, x, y, z) matches the reference's `scalar_first=True` construction.

use log::warn;
use nalgebra::{UnitQuaternion, Vector3};

use crate::constants::{ACCEL_DEADBAND_METERS_PER_SECOND_SQUARED, GRAVITY_METERS_PER_SECOND_SQUARED};
use crate::packets::{EstimatedImuPacket, ProcessorDataPacket};

fn field(opt: Option<f64>, name: &str) -> f64 {
    opt.unwrap_or_else(|| {
        warn!("Estimated IMU packet missing {name}; treating as 0.0");
        0.0
    })
}

/// Clamps `value` to zero if its magnitude is within `width` of zero.
fn deadband(value: f64, width: f64) -> f64 {
    if value.abs() < width {
        0.0
    } else {
        value
    }
}

/// Computes kinematic state by integrating a rotating acceleration
/// vector. Holds running state (orientation, max altitude/velocity, the
/// previous batch's final packet) across calls to `update`.
pub struct DataProcessor {
    max_altitude: f64,
    current_altitude: f64,
    vertical_velocity: f64,
    max_vertical_velocity: f64,
    previous_vertical_velocity: f64,
    initial_altitude: Option<f64>,
    last_timestamp_ns: Option<i64>,
    orientation: Option<UnitQuaternion<f64>>,
    last_processor_packets: Vec<ProcessorDataPacket>,
}

impl Default for DataProcessor {
    fn default() -> Self {
        DataProcessor {
            max_altitude: 0.0,
            current_altitude: 0.0,
            vertical_velocity: 0.0,
            max_vertical_velocity: 0.0,
            previous_vertical_velocity: 0.0,
            initial_altitude: None,
            last_timestamp_ns: None,
            orientation: None,
            last_processor_packets: Vec::new(),
        }
    }
}

impl DataProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_altitude(&self) -> f64 {
        self.max_altitude
    }

    pub fn current_altitude(&self) -> f64 {
        self.current_altitude
    }

    pub fn vertical_velocity(&self) -> f64 {
        self.vertical_velocity
    }

    pub fn max_vertical_velocity(&self) -> f64 {
        self.max_vertical_velocity
    }

    /// The most recently computed vertical acceleration (gravity
    /// included), or 0.0 before the first batch has been processed.
    pub fn current_vertical_acceleration(&self) -> f64 {
        self.last_processor_packets
            .last()
            .map(|p| p.vertical_acceleration)
            .unwrap_or(0.0)
    }

    /// Mean vertical acceleration over the most recent `update` batch.
    pub fn average_vertical_acceleration(&self) -> f64 {
        if self.last_processor_packets.is_empty() {
            return 0.0;
        }
        self.last_processor_packets.iter().map(|p| p.vertical_acceleration).sum::<f64>()
            / self.last_processor_packets.len() as f64
    }

    /// Angle, in degrees, between the current orientation's world-vertical
    /// axis and the fixed world-vertical axis.
    pub fn average_pitch(&self) -> f64 {
        match self.orientation {
            Some(orientation) => {
                let rotated = orientation.transform_vector(&Vector3::z());
                let dot = rotated.dot(&Vector3::z()).clamp(-1.0, 1.0);
                dot.acos().to_degrees()
            }
            None => 0.0,
        }
    }

    /// Timestamp, in nanoseconds, of the last Estimated IMU Packet seen.
    pub fn current_timestamp_ns(&self) -> i64 {
        self.last_timestamp_ns.unwrap_or(0)
    }

    /// Builds a `DataProcessor` with specific kinematic readings, bypassing
    /// `update`'s IMU-packet integration. Used by the state machine's tests
    /// to exercise transition thresholds (including timestamp-driven ones
    /// like `MotorBurnState`'s burn timeout and `FreeFallState`'s dead-man
    /// switch) directly.
    #[cfg(test)]
    pub(crate) fn for_test(
        max_altitude: f64,
        current_altitude: f64,
        vertical_velocity: f64,
        vertical_acceleration: f64,
        timestamp_ns: i64,
    ) -> Self {
        let mut dp = Self::default();
        dp.max_altitude = max_altitude;
        dp.current_altitude = current_altitude;
        dp.vertical_velocity = vertical_velocity;
        dp.max_vertical_velocity = vertical_velocity.max(0.0);
        dp.last_timestamp_ns = Some(timestamp_ns);
        dp.last_processor_packets = vec![ProcessorDataPacket {
            current_altitude,
            vertical_velocity,
            vertical_acceleration,
            ..Default::default()
        }];
        dp
    }

    /// Recomputes kinematic state from a batch of Estimated IMU Packets.
    /// A no-op on an empty batch, matching the reference implementation.
    pub fn update(&mut self, packets: &[EstimatedImuPacket]) {
        if packets.is_empty() {
            return;
        }

        if self.last_timestamp_ns.is_none() {
            self.first_update(packets);
        }
        let last_timestamp_ns = self.last_timestamp_ns.unwrap();
        let initial_altitude = self.initial_altitude.unwrap();
        let mut orientation = self.orientation.unwrap();

        let time_differences = time_differences_seconds(last_timestamp_ns, packets);

        let mut rotated_accelerations = Vec::with_capacity(packets.len());
        for (i, packet) in packets.iter().enumerate() {
            let dt = time_differences[i];
            let accel = Vector3::new(
                field(packet.est_compensated_accel_x, "estCompensatedAccelX"),
                field(packet.est_compensated_accel_y, "estCompensatedAccelY"),
                field(packet.est_compensated_accel_z, "estCompensatedAccelZ"),
            );
            let gyro = Vector3::new(
                field(packet.est_angular_rate_x, "estAngularRateX"),
                field(packet.est_angular_rate_y, "estAngularRateY"),
                field(packet.est_angular_rate_z, "estAngularRateZ"),
            );
            let delta_rotation = UnitQuaternion::from_scaled_axis(gyro * dt);
            orientation *= delta_rotation;
            let rotated_accel = orientation.transform_vector(&accel);
            rotated_accelerations.push(-rotated_accel.z);
        }

        let mut vertical_velocities = Vec::with_capacity(packets.len());
        let mut running = self.previous_vertical_velocity;
        for i in 0..packets.len() {
            let deadbanded = deadband(
                rotated_accelerations[i] - GRAVITY_METERS_PER_SECOND_SQUARED,
                ACCEL_DEADBAND_METERS_PER_SECOND_SQUARED,
            );
            running += deadbanded * time_differences[i];
            vertical_velocities.push(running);
        }
        self.previous_vertical_velocity = running;

        let current_altitudes: Vec<f64> = packets
            .iter()
            .map(|p| field(p.est_pressure_alt, "estPressureAlt") - initial_altitude)
            .collect();

        self.max_vertical_velocity = vertical_velocities
            .iter()
            .cloned()
            .fold(self.max_vertical_velocity, f64::max);
        self.max_altitude =
            current_altitudes.iter().cloned().fold(self.max_altitude, f64::max);

        self.vertical_velocity = *vertical_velocities.last().unwrap();
        self.current_altitude = *current_altitudes.last().unwrap();
        self.orientation = Some(orientation);
        self.last_timestamp_ns = Some(packets.last().unwrap().timestamp_ns);

        self.last_processor_packets = (0..packets.len())
            .map(|i| ProcessorDataPacket {
                current_altitude: current_altitudes[i],
                vertical_velocity: vertical_velocities[i],
                vertical_acceleration: rotated_accelerations[i],
                time_since_last_data_packet: time_differences[i],
            })
            .collect();
    }

    /// One `ProcessorDataPacket` per Estimated IMU Packet in the most
    /// recent call to `update`.
    pub fn get_processor_data_packets(&self) -> &[ProcessorDataPacket] {
        &self.last_processor_packets
    }

    fn first_update(&mut self, packets: &[EstimatedImuPacket]) {
        self.last_timestamp_ns = Some(packets[0].timestamp_ns);

        let mean_altitude = packets
            .iter()
            .map(|p| field(p.est_pressure_alt, "estPressureAlt"))
            .sum::<f64>()
            / packets.len() as f64;
        self.initial_altitude = Some(mean_altitude);

        let first = &packets[0];
        let quaternion = nalgebra::Quaternion::new(
            field(first.est_orient_quaternion_w, "estOrientQuaternionW"),
            field(first.est_orient_quaternion_x, "estOrientQuaternionX"),
            field(first.est_orient_quaternion_y, "estOrientQuaternionY"),
            field(first.est_orient_quaternion_z, "estOrientQuaternionZ"),
        );
        self.orientation = Some(UnitQuaternion::from_quaternion(quaternion));
    }
}

fn time_differences_seconds(last_timestamp_ns: i64, packets: &[EstimatedImuPacket]) -> Vec<f64> {
    let mut timestamps_ns = Vec::with_capacity(packets.len() + 1);
    timestamps_ns.push(last_timestamp_ns);
    timestamps_ns.extend(packets.iter().map(|p| p.timestamp_ns));
    timestamps_ns
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64 / 1_000_000_000.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::Rng;

    use super::*;

    fn level_packet(timestamp_ns: i64, alt: f64, accel_z: f64) -> EstimatedImuPacket {
        EstimatedImuPacket {
            timestamp_ns,
            est_pressure_alt: Some(alt),
            est_orient_quaternion_w: Some(1.0),
            est_orient_quaternion_x: Some(0.0),
            est_orient_quaternion_y: Some(0.0),
            est_orient_quaternion_z: Some(0.0),
            est_angular_rate_x: Some(0.0),
            est_angular_rate_y: Some(0.0),
            est_angular_rate_z: Some(0.0),
            est_compensated_accel_x: Some(0.0),
            est_compensated_accel_y: Some(0.0),
            est_compensated_accel_z: Some(accel_z),
            ..Default::default()
        }
    }

    #[test]
    fn first_update_zeroes_altitude_and_velocity() {
        let mut dp = DataProcessor::new();
        dp.update(&[level_packet(0, 100.0, GRAVITY_METERS_PER_SECOND_SQUARED)]);
        assert_eq!(dp.current_altitude(), 0.0);
        assert_eq!(dp.vertical_velocity(), 0.0);
    }

    #[test]
    fn level_unaccelerated_flight_holds_zero_velocity() {
        let mut dp = DataProcessor::new();
        dp.update(&[level_packet(0, 100.0, GRAVITY_METERS_PER_SECOND_SQUARED)]);
        dp.update(&[level_packet(
            100_000_000,
            105.0,
            GRAVITY_METERS_PER_SECOND_SQUARED,
        )]);
        assert_relative_eq!(dp.vertical_velocity(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(dp.current_altitude(), 5.0, epsilon = 1e-9);
        assert_relative_eq!(dp.max_altitude(), 5.0, epsilon = 1e-9);
    }

    /// Scenario A (SPEC_FULL.md section 8): a pad-bound rocket reports a
    /// jittery but un-accelerating IMU. The dead band must absorb sensor
    /// noise on every packet, not just a clean constant reading, so
    /// velocity never drifts beyond the hover tolerance.
    #[test]
    fn standby_hover_with_sensor_noise_stays_within_tolerance() {
        let mut rng = rand::thread_rng();
        let mut dp = DataProcessor::new();
        let mut timestamp_ns = 0i64;
        for _ in 0..1000 {
            let noisy_accel_z = GRAVITY_METERS_PER_SECOND_SQUARED + rng.gen_range(-0.05..0.05);
            dp.update(&[level_packet(timestamp_ns, 100.0, noisy_accel_z)]);
            timestamp_ns += 1_000_000;
        }
        assert!(dp.vertical_velocity().abs() < 2.0, "velocity drifted to {}", dp.vertical_velocity());
    }

    #[test]
    fn sustained_upward_thrust_integrates_to_positive_velocity() {
        let mut dp = DataProcessor::new();
        dp.update(&[level_packet(0, 0.0, GRAVITY_METERS_PER_SECOND_SQUARED)]);
        dp.update(&[level_packet(
            100_000_000,
            0.0,
            GRAVITY_METERS_PER_SECOND_SQUARED + 20.0,
        )]);
        assert!(dp.vertical_velocity() > 0.0);
        assert!(dp.max_vertical_velocity() >= dp.vertical_velocity());
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut dp = DataProcessor::new();
        dp.update(&[level_packet(0, 100.0, GRAVITY_METERS_PER_SECOND_SQUARED)]);
        dp.update(&[]);
        assert_eq!(dp.current_altitude(), 0.0);
        assert!(dp.get_processor_data_packets().len() == 1);
    }
}
