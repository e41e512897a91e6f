// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The data packets exchanged between the core's components (SPEC_FULL.md
//! section 3). Field names and optionality mirror the reference
//! implementation's packet definitions one for one; the reference's
//! `msgspec.Struct` subclassing of a shared `IMUDataPacket` base is
//! expressed here as an `ImuPacket` enum over two plain structs, since a
//! sum type is the idiomatic Rust substitute for "exactly one of these
//! variants, sharing a common header".

/// A data point the sensor flagged invalid on a given packet. Recorded
/// by channel name rather than dropping the field entirely, matching
/// `invalid_fields` in the reference implementation.
pub type InvalidFields = Vec<String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawImuPacket {
    pub timestamp_ns: i64,
    pub invalid_fields: InvalidFields,

    // Units are "g" (9.81 m/s^2).
    pub scaled_accel_x: Option<f64>,
    pub scaled_accel_y: Option<f64>,
    pub scaled_accel_z: Option<f64>,
    pub scaled_gyro_x: Option<f64>,
    pub scaled_gyro_y: Option<f64>,
    pub scaled_gyro_z: Option<f64>,
    // Units are g*seconds.
    pub delta_vel_x: Option<f64>,
    pub delta_vel_y: Option<f64>,
    pub delta_vel_z: Option<f64>,
    // Units are radians.
    pub delta_theta_x: Option<f64>,
    pub delta_theta_y: Option<f64>,
    pub delta_theta_z: Option<f64>,
    // Units are mbar.
    pub scaled_ambient_pressure: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimatedImuPacket {
    pub timestamp_ns: i64,
    pub invalid_fields: InvalidFields,

    pub est_pressure_alt: Option<f64>,
    pub est_orient_quaternion_w: Option<f64>,
    pub est_orient_quaternion_x: Option<f64>,
    pub est_orient_quaternion_y: Option<f64>,
    pub est_orient_quaternion_z: Option<f64>,
    pub est_attitude_uncert_quaternion_w: Option<f64>,
    pub est_attitude_uncert_quaternion_x: Option<f64>,
    pub est_attitude_uncert_quaternion_y: Option<f64>,
    pub est_attitude_uncert_quaternion_z: Option<f64>,
    pub est_angular_rate_x: Option<f64>,
    pub est_angular_rate_y: Option<f64>,
    pub est_angular_rate_z: Option<f64>,
    // Units are m/s^2, including gravity.
    pub est_compensated_accel_x: Option<f64>,
    pub est_compensated_accel_y: Option<f64>,
    pub est_compensated_accel_z: Option<f64>,
    // Units are m/s^2, excluding gravity.
    pub est_linear_accel_x: Option<f64>,
    pub est_linear_accel_y: Option<f64>,
    pub est_linear_accel_z: Option<f64>,
    pub est_gravity_vector_x: Option<f64>,
    pub est_gravity_vector_y: Option<f64>,
    pub est_gravity_vector_z: Option<f64>,
}

/// Either variant the IMU Source can produce, sharing a monotonic
/// timestamp space.
#[derive(Debug, Clone, PartialEq)]
pub enum ImuPacket {
    Raw(RawImuPacket),
    Estimated(EstimatedImuPacket),
}

impl ImuPacket {
    pub fn timestamp_ns(&self) -> i64 {
        match self {
            ImuPacket::Raw(p) => p.timestamp_ns,
            ImuPacket::Estimated(p) => p.timestamp_ns,
        }
    }

    pub fn as_estimated(&self) -> Option<&EstimatedImuPacket> {
        match self {
            ImuPacket::Estimated(p) => Some(p),
            ImuPacket::Raw(_) => None,
        }
    }
}

/// One produced per Estimated IMU Packet fed to the Data Processor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessorDataPacket {
    pub current_altitude: f64,
    pub vertical_velocity: f64,
    pub vertical_acceleration: f64,
    pub time_since_last_data_packet: f64,
}

/// Produced by the Apogee Predictor once per prediction cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ApogeePredictorDataPacket {
    pub predicted_apogee: f64,
    pub a_coefficient: f64,
    pub b_coefficient: f64,
    pub uncertainty_threshold_1: f64,
    pub uncertainty_threshold_2: f64,
}

/// Built by the Context once per `update()` iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextDataPacket {
    /// S, M, C, F, or L.
    pub state_letter: char,
    /// Number of IMU packets retrieved this iteration, in the main task.
    pub fetched_packets_in_main: usize,
    /// Depth of the IMU queue at the time of this iteration.
    pub imu_queue_size: usize,
    /// Depth of the Apogee Predictor's input queue at this iteration.
    pub apogee_predictor_queue_size: usize,
    /// Number of packets the IMU Source produced on its most recent
    /// sensor read (`ImuSource::packets_per_cycle`).
    pub fetched_imu_packets: usize,
    /// Monotonic nanosecond timestamp for this iteration.
    pub update_timestamp_ns: i64,
}

/// The four discrete positions the Servo Actuator can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoExtension {
    MinExtension,
    MinNoBuzz,
    MaxExtension,
    MaxNoBuzz,
}

impl ServoExtension {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServoExtension::MinExtension => "MIN_EXTENSION",
            ServoExtension::MinNoBuzz => "MIN_NO_BUZZ",
            ServoExtension::MaxExtension => "MAX_EXTENSION",
            ServoExtension::MaxNoBuzz => "MAX_NO_BUZZ",
        }
    }
}

/// Built by the Context once per `update()` iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoDataPacket {
    pub set_extension: ServoExtension,
    pub encoder_position: i64,
}

/// One row of the CSV log; carries one IMU packet's worth of fields
/// together with the Context, Servo, and (when available) Processor and
/// Apogee fields that applied to the same iteration. Field order here is
/// the declared CSV column order (SPEC_FULL.md section 4.6/6).
#[derive(Debug, Clone, PartialEq)]
pub struct LoggerDataPacket {
    pub state_letter: char,
    pub set_extension: ServoExtension,
    pub encoder_position: i64,
    pub timestamp_ns: i64,
    pub invalid_fields: InvalidFields,
    pub fetched_packets_in_main: usize,
    pub imu_queue_size: usize,
    pub apogee_predictor_queue_size: usize,
    pub fetched_imu_packets: usize,
    pub update_timestamp_ns: i64,

    // Populated only for Estimated IMU packets.
    pub est_orient_quaternion_w: Option<f64>,
    pub est_orient_quaternion_x: Option<f64>,
    pub est_orient_quaternion_y: Option<f64>,
    pub est_orient_quaternion_z: Option<f64>,
    pub est_pressure_alt: Option<f64>,
    pub est_attitude_uncert_quaternion_w: Option<f64>,
    pub est_attitude_uncert_quaternion_x: Option<f64>,
    pub est_attitude_uncert_quaternion_y: Option<f64>,
    pub est_attitude_uncert_quaternion_z: Option<f64>,
    pub est_angular_rate_x: Option<f64>,
    pub est_angular_rate_y: Option<f64>,
    pub est_angular_rate_z: Option<f64>,
    pub est_compensated_accel_x: Option<f64>,
    pub est_compensated_accel_y: Option<f64>,
    pub est_compensated_accel_z: Option<f64>,
    pub est_linear_accel_x: Option<f64>,
    pub est_linear_accel_y: Option<f64>,
    pub est_linear_accel_z: Option<f64>,
    pub est_gravity_vector_x: Option<f64>,
    pub est_gravity_vector_y: Option<f64>,
    pub est_gravity_vector_z: Option<f64>,

    // Populated only for Raw IMU packets.
    pub scaled_accel_x: Option<f64>,
    pub scaled_accel_y: Option<f64>,
    pub scaled_accel_z: Option<f64>,
    pub scaled_gyro_x: Option<f64>,
    pub scaled_gyro_y: Option<f64>,
    pub scaled_gyro_z: Option<f64>,
    pub delta_vel_x: Option<f64>,
    pub delta_vel_y: Option<f64>,
    pub delta_vel_z: Option<f64>,
    pub delta_theta_x: Option<f64>,
    pub delta_theta_y: Option<f64>,
    pub delta_theta_z: Option<f64>,
    pub scaled_ambient_pressure: Option<f64>,

    // Populated only alongside an Estimated packet, from the matching
    // ProcessorDataPacket.
    pub current_altitude: Option<f64>,
    pub vertical_velocity: Option<f64>,
    pub vertical_acceleration: Option<f64>,

    // Populated only when an apogee prediction was available to pop for
    // this row.
    pub predicted_apogee: Option<f64>,
    pub a_coefficient: Option<f64>,
    pub b_coefficient: Option<f64>,
    pub uncertainty_threshold_1: Option<f64>,
    pub uncertainty_threshold_2: Option<f64>,
}

impl LoggerDataPacket {
    /// The CSV header row, in the exact order `to_row` writes fields.
    pub const FIELD_NAMES: &'static [&'static str] = &[
        "state_letter",
        "set_extension",
        "encoder_position",
        "timestamp_ns",
        "invalid_fields",
        "fetched_packets_in_main",
        "imu_queue_size",
        "apogee_predictor_queue_size",
        "fetched_imu_packets",
        "update_timestamp_ns",
        "est_orient_quaternion_w",
        "est_orient_quaternion_x",
        "est_orient_quaternion_y",
        "est_orient_quaternion_z",
        "est_pressure_alt",
        "est_attitude_uncert_quaternion_w",
        "est_attitude_uncert_quaternion_x",
        "est_attitude_uncert_quaternion_y",
        "est_attitude_uncert_quaternion_z",
        "est_angular_rate_x",
        "est_angular_rate_y",
        "est_angular_rate_z",
        "est_compensated_accel_x",
        "est_compensated_accel_y",
        "est_compensated_accel_z",
        "est_linear_accel_x",
        "est_linear_accel_y",
        "est_linear_accel_z",
        "est_gravity_vector_x",
        "est_gravity_vector_y",
        "est_gravity_vector_z",
        "scaled_accel_x",
        "scaled_accel_y",
        "scaled_accel_z",
        "scaled_gyro_x",
        "scaled_gyro_y",
        "scaled_gyro_z",
        "delta_vel_x",
        "delta_vel_y",
        "delta_vel_z",
        "delta_theta_x",
        "delta_theta_y",
        "delta_theta_z",
        "scaled_ambient_pressure",
        "current_altitude",
        "vertical_velocity",
        "vertical_acceleration",
        "predicted_apogee",
        "a_coefficient",
        "b_coefficient",
        "uncertainty_threshold_1",
        "uncertainty_threshold_2",
    ];

    /// Serializes this row to CSV cells, truncating floats to 8 decimal
    /// places and leaving absent fields as empty cells, per SPEC_FULL.md
    /// section 4.6.
    pub fn to_row(&self) -> Vec<String> {
        fn f(v: Option<f64>) -> String {
            v.map(|v| format!("{:.8}", v)).unwrap_or_default()
        }
        vec![
            self.state_letter.to_string(),
            self.set_extension.as_str().to_string(),
            self.encoder_position.to_string(),
            self.timestamp_ns.to_string(),
            self.invalid_fields.join(";"),
            self.fetched_packets_in_main.to_string(),
            self.imu_queue_size.to_string(),
            self.apogee_predictor_queue_size.to_string(),
            self.fetched_imu_packets.to_string(),
            self.update_timestamp_ns.to_string(),
            f(self.est_orient_quaternion_w),
            f(self.est_orient_quaternion_x),
            f(self.est_orient_quaternion_y),
            f(self.est_orient_quaternion_z),
            f(self.est_pressure_alt),
            f(self.est_attitude_uncert_quaternion_w),
            f(self.est_attitude_uncert_quaternion_x),
            f(self.est_attitude_uncert_quaternion_y),
            f(self.est_attitude_uncert_quaternion_z),
            f(self.est_angular_rate_x),
            f(self.est_angular_rate_y),
            f(self.est_angular_rate_z),
            f(self.est_compensated_accel_x),
            f(self.est_compensated_accel_y),
            f(self.est_compensated_accel_z),
            f(self.est_linear_accel_x),
            f(self.est_linear_accel_y),
            f(self.est_linear_accel_z),
            f(self.est_gravity_vector_x),
            f(self.est_gravity_vector_y),
            f(self.est_gravity_vector_z),
            f(self.scaled_accel_x),
            f(self.scaled_accel_y),
            f(self.scaled_accel_z),
            f(self.scaled_gyro_x),
            f(self.scaled_gyro_y),
            f(self.scaled_gyro_z),
            f(self.delta_vel_x),
            f(self.delta_vel_y),
            f(self.delta_vel_z),
            f(self.delta_theta_x),
            f(self.delta_theta_y),
            f(self.delta_theta_z),
            f(self.scaled_ambient_pressure),
            f(self.current_altitude),
            f(self.vertical_velocity),
            f(self.vertical_acceleration),
            f(self.predicted_apogee),
            f(self.a_coefficient),
            f(self.b_coefficient),
            f(self.uncertainty_threshold_1),
            f(self.uncertainty_threshold_2),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_row_truncates_floats_and_leaves_missing_fields_empty() {
        let mut packet = LoggerDataPacket {
            state_letter: 'S',
            set_extension: ServoExtension::MinNoBuzz,
            encoder_position: 0,
            timestamp_ns: 0,
            invalid_fields: vec![],
            fetched_packets_in_main: 1,
            imu_queue_size: 0,
            apogee_predictor_queue_size: 0,
            fetched_imu_packets: 1,
            update_timestamp_ns: 0,
            est_orient_quaternion_w: None,
            est_orient_quaternion_x: None,
            est_orient_quaternion_y: None,
            est_orient_quaternion_z: None,
            est_pressure_alt: Some(100.123456789),
            est_attitude_uncert_quaternion_w: None,
            est_attitude_uncert_quaternion_x: None,
            est_attitude_uncert_quaternion_y: None,
            est_attitude_uncert_quaternion_z: None,
            est_angular_rate_x: None,
            est_angular_rate_y: None,
            est_angular_rate_z: None,
            est_compensated_accel_x: None,
            est_compensated_accel_y: None,
            est_compensated_accel_z: None,
            est_linear_accel_x: None,
            est_linear_accel_y: None,
            est_linear_accel_z: None,
            est_gravity_vector_x: None,
            est_gravity_vector_y: None,
            est_gravity_vector_z: None,
            scaled_accel_x: None,
            scaled_accel_y: None,
            scaled_accel_z: None,
            scaled_gyro_x: None,
            scaled_gyro_y: None,
            scaled_gyro_z: None,
            delta_vel_x: None,
            delta_vel_y: None,
            delta_vel_z: None,
            delta_theta_x: None,
            delta_theta_y: None,
            delta_theta_z: None,
            scaled_ambient_pressure: None,
            current_altitude: None,
            vertical_velocity: None,
            vertical_acceleration: None,
            predicted_apogee: None,
            a_coefficient: None,
            b_coefficient: None,
            uncertainty_threshold_1: None,
            uncertainty_threshold_2: None,
        };
        let row = packet.to_row();
        assert_eq!(row.len(), LoggerDataPacket::FIELD_NAMES.len());
        assert_eq!(row[14], "100.12345679");
        assert_eq!(row[15], "");

        packet.invalid_fields = vec!["estPressureAlt".to_string()];
        let row = packet.to_row();
        assert_eq!(row[4], "estPressureAlt");
    }
}
