// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The Logger: a background task that serializes per-iteration packet
//! bundles into a single CSV file, with idle-phase ring buffering and
//! periodic durability flushes, per SPEC_FULL.md section 4.6.
//!
//! The CSV writer takes `Vec<String>` records rather than `csv::Writer`'s
//! `serde` path: field presence is too irregular across Raw/Estimated/
//! missing-apogee rows for a single `Serialize` derive to express
//! cleanly, matching the reference implementation's own
//! `_prepare_logger_packets`/`_truncate_floats` special-casing.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::bounded_queue::BoundedQueue;
use crate::constants::{
    IDLE_LOG_CAPACITY, JOIN_TIMEOUT, LOG_BUFFER_SIZE, MAX_QUEUE_SIZE,
    NUMBER_OF_LINES_TO_LOG_BEFORE_FLUSHING, WORKER_POLL_TIMEOUT,
};
use crate::error::{internal_error, CanonicalResult};
use crate::packets::{
    ApogeePredictorDataPacket, ContextDataPacket, ImuPacket, LoggerDataPacket, ProcessorDataPacket,
    ServoDataPacket,
};

const LOG_BUFFER_STATES: [char; 2] = ['S', 'L'];

fn is_idle_state(state_letter: char) -> bool {
    LOG_BUFFER_STATES.contains(&state_letter)
}

/// Builds one `LoggerDataPacket` per IMU packet in the batch, matching
/// Processor fields to Estimated packets in order and popping Apogee
/// packets off the front of the list as they're available.
fn prepare_logger_packets(
    context: &ContextDataPacket,
    servo: &ServoDataPacket,
    imu_packets: &[ImuPacket],
    processor_packets: &[ProcessorDataPacket],
    mut apogee_packets: VecDeque<ApogeePredictorDataPacket>,
) -> Vec<LoggerDataPacket> {
    let mut rows = Vec::with_capacity(imu_packets.len());
    let mut processor_index = 0usize;

    for imu_packet in imu_packets {
        let apogee = apogee_packets.pop_front();

        let mut row = LoggerDataPacket {
            state_letter: context.state_letter,
            set_extension: servo.set_extension,
            encoder_position: servo.encoder_position,
            timestamp_ns: imu_packet.timestamp_ns(),
            invalid_fields: Vec::new(),
            fetched_packets_in_main: context.fetched_packets_in_main,
            imu_queue_size: context.imu_queue_size,
            apogee_predictor_queue_size: context.apogee_predictor_queue_size,
            fetched_imu_packets: context.fetched_imu_packets,
            update_timestamp_ns: context.update_timestamp_ns,
            est_orient_quaternion_w: None,
            est_orient_quaternion_x: None,
            est_orient_quaternion_y: None,
            est_orient_quaternion_z: None,
            est_pressure_alt: None,
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
            predicted_apogee: apogee.map(|p| p.predicted_apogee),
            a_coefficient: apogee.map(|p| p.a_coefficient),
            b_coefficient: apogee.map(|p| p.b_coefficient),
            uncertainty_threshold_1: apogee.map(|p| p.uncertainty_threshold_1),
            uncertainty_threshold_2: apogee.map(|p| p.uncertainty_threshold_2),
        };

        match imu_packet {
            ImuPacket::Raw(p) => {
                row.invalid_fields = p.invalid_fields.clone();
                row.scaled_accel_x = p.scaled_accel_x;
                row.scaled_accel_y = p.scaled_accel_y;
                row.scaled_accel_z = p.scaled_accel_z;
                row.scaled_gyro_x = p.scaled_gyro_x;
                row.scaled_gyro_y = p.scaled_gyro_y;
                row.scaled_gyro_z = p.scaled_gyro_z;
                row.delta_vel_x = p.delta_vel_x;
                row.delta_vel_y = p.delta_vel_y;
                row.delta_vel_z = p.delta_vel_z;
                row.delta_theta_x = p.delta_theta_x;
                row.delta_theta_y = p.delta_theta_y;
                row.delta_theta_z = p.delta_theta_z;
                row.scaled_ambient_pressure = p.scaled_ambient_pressure;
            }
            ImuPacket::Estimated(p) => {
                row.invalid_fields = p.invalid_fields.clone();
                row.est_orient_quaternion_w = p.est_orient_quaternion_w;
                row.est_orient_quaternion_x = p.est_orient_quaternion_x;
                row.est_orient_quaternion_y = p.est_orient_quaternion_y;
                row.est_orient_quaternion_z = p.est_orient_quaternion_z;
                row.est_pressure_alt = p.est_pressure_alt;
                row.est_attitude_uncert_quaternion_w = p.est_attitude_uncert_quaternion_w;
                row.est_attitude_uncert_quaternion_x = p.est_attitude_uncert_quaternion_x;
                row.est_attitude_uncert_quaternion_y = p.est_attitude_uncert_quaternion_y;
                row.est_attitude_uncert_quaternion_z = p.est_attitude_uncert_quaternion_z;
                row.est_angular_rate_x = p.est_angular_rate_x;
                row.est_angular_rate_y = p.est_angular_rate_y;
                row.est_angular_rate_z = p.est_angular_rate_z;
                row.est_compensated_accel_x = p.est_compensated_accel_x;
                row.est_compensated_accel_y = p.est_compensated_accel_y;
                row.est_compensated_accel_z = p.est_compensated_accel_z;
                row.est_linear_accel_x = p.est_linear_accel_x;
                row.est_linear_accel_y = p.est_linear_accel_y;
                row.est_linear_accel_z = p.est_linear_accel_z;
                row.est_gravity_vector_x = p.est_gravity_vector_x;
                row.est_gravity_vector_y = p.est_gravity_vector_y;
                row.est_gravity_vector_z = p.est_gravity_vector_z;

                if let Some(processor) = processor_packets.get(processor_index) {
                    row.current_altitude = Some(processor.current_altitude);
                    row.vertical_velocity = Some(processor.vertical_velocity);
                    row.vertical_acceleration = Some(processor.vertical_acceleration);
                }
                processor_index += 1;
            }
        }

        rows.push(row);
    }

    rows
}

/// Scans `log_dir` for existing `log_{N}.csv` files and returns the path
/// for the next one in sequence, creating the directory if absent.
fn next_log_path(log_dir: &Path) -> CanonicalResult<PathBuf> {
    fs::create_dir_all(log_dir)
        .map_err(|e| internal_error(format!("failed to create log directory: {e}")))?;

    let mut max_n = 0u64;
    let entries = fs::read_dir(log_dir)
        .map_err(|e| internal_error(format!("failed to read log directory: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| internal_error(format!("failed to read log directory entry: {e}")))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix("log_").and_then(|r| r.strip_suffix(".csv")) else {
            continue;
        };
        if let Ok(n) = rest.parse::<u64>() {
            max_n = max_n.max(n);
        }
    }
    Ok(log_dir.join(format!("log_{}.csv", max_n + 1)))
}

struct IdleBuffer {
    last_was_idle: bool,
    idle_log_counter: usize,
    ring_buffer: VecDeque<LoggerDataPacket>,
}

impl IdleBuffer {
    fn new() -> Self {
        IdleBuffer { last_was_idle: false, idle_log_counter: 0, ring_buffer: VecDeque::new() }
    }
}

/// Owns the background CSV-writing thread and the idle-phase ring
/// buffer's bookkeeping.
pub struct Logger {
    path: PathBuf,
    queue: Arc<BoundedQueue<LoggerDataPacket>>,
    running: Arc<AtomicBool>,
    idle: Mutex<IdleBuffer>,
    handle: Option<JoinHandle<()>>,
}

impl Logger {
    /// Creates `log_{N+1}.csv` in `log_dir` and spawns the writer thread.
    pub fn start(log_dir: &Path) -> CanonicalResult<Self> {
        let path = next_log_path(log_dir)?;
        let file = File::create(&path)
            .map_err(|e| internal_error(format!("failed to create log file {path:?}: {e}")))?;
        let mut writer = csv::Writer::from_writer(BufWriter::new(file));
        writer
            .write_record(LoggerDataPacket::FIELD_NAMES.iter().copied())
            .map_err(|e| internal_error(format!("failed to write log header: {e}")))?;
        writer.flush().map_err(|e| internal_error(format!("failed to flush log header: {e}")))?;

        let queue = Arc::new(BoundedQueue::new(MAX_QUEUE_SIZE));
        let running = Arc::new(AtomicBool::new(true));

        let worker_queue = queue.clone();
        let worker_running = running.clone();
        let handle = std::thread::spawn(move || {
            let mut writer = writer;
            let mut rows_since_flush = 0usize;
            loop {
                let (packets, poisoned) =
                    worker_queue.get_many(MAX_QUEUE_SIZE, WORKER_POLL_TIMEOUT);
                for packet in &packets {
                    if let Err(e) = writer.write_record(packet.to_row()) {
                        warn!("failed to write log row: {e}");
                        continue;
                    }
                    rows_since_flush += 1;
                    if rows_since_flush >= NUMBER_OF_LINES_TO_LOG_BEFORE_FLUSHING {
                        if let Err(e) = writer.flush() {
                            warn!("failed to flush log writer: {e}");
                        } else if let Err(e) = writer.get_ref().get_ref().sync_all() {
                            warn!("failed to fsync log file: {e}");
                        }
                        rows_since_flush = 0;
                    }
                }
                if poisoned {
                    break;
                }
            }
            if let Err(e) = writer.flush() {
                warn!("failed to flush log writer on shutdown: {e}");
            } else if let Err(e) = writer.get_ref().get_ref().sync_all() {
                warn!("failed to fsync log file on shutdown: {e}");
            }
            worker_running.store(false, Ordering::Release);
            debug!("Logger worker thread exiting");
        });

        Ok(Logger { path, queue, running, idle: Mutex::new(IdleBuffer::new()), handle: Some(handle) })
    }

    /// Path of this run's CSV log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the idle-phase ring buffer has filled to `LOG_BUFFER_SIZE`.
    pub fn is_log_buffer_full(&self) -> bool {
        self.idle.lock().unwrap().ring_buffer.len() >= LOG_BUFFER_SIZE
    }

    /// Builds one row per IMU packet and enqueues it, applying
    /// idle-phase ring buffering when the state letter is Standby or
    /// Landed. Never blocks on a full queue: `push_many_unbounded`
    /// bypasses the capacity check, matching the "never stall the main
    /// loop" contract.
    pub fn log(
        &self,
        context: ContextDataPacket,
        servo: ServoDataPacket,
        imu_packets: &[ImuPacket],
        processor_packets: &[ProcessorDataPacket],
        apogee_packets: Vec<ApogeePredictorDataPacket>,
    ) {
        if imu_packets.is_empty() {
            return;
        }
        let rows = prepare_logger_packets(
            &context,
            &servo,
            imu_packets,
            processor_packets,
            apogee_packets.into(),
        );

        let mut idle = self.idle.lock().unwrap();
        let is_idle = is_idle_state(context.state_letter);

        if !is_idle && idle.last_was_idle {
            self.flush_buffer_locked(&mut idle);
        }
        idle.last_was_idle = is_idle;

        if !is_idle {
            drop(idle);
            self.queue.push_many_unbounded(rows);
            return;
        }

        let capacity = IDLE_LOG_CAPACITY.saturating_sub(idle.idle_log_counter);
        let to_log_count = capacity.min(rows.len());
        let (to_log, to_buffer) = rows.split_at(to_log_count);

        idle.idle_log_counter += to_log.len();
        if !to_log.is_empty() {
            self.queue.push_many_unbounded(to_log.iter().cloned());
        }
        for row in to_buffer {
            if idle.ring_buffer.len() >= LOG_BUFFER_SIZE {
                idle.ring_buffer.pop_front();
            }
            idle.ring_buffer.push_back(row.clone());
        }
    }

    fn flush_buffer_locked(&self, idle: &mut IdleBuffer) {
        if !idle.ring_buffer.is_empty() {
            self.queue.push_many_unbounded(idle.ring_buffer.drain(..));
        }
        idle.idle_log_counter = 0;
    }

    /// Flushes any buffered rows, signals shutdown, and joins within a
    /// bounded timeout. A timeout is logged, not fatal, matching every
    /// other background worker's `stop()` in this core.
    pub fn stop(&mut self) -> CanonicalResult<()> {
        {
            let mut idle = self.idle.lock().unwrap();
            self.flush_buffer_locked(&mut idle);
        }
        self.queue.push_poison();

        if let Some(handle) = self.handle.take() {
            let (tx, rx) = std::sync::mpsc::channel();
            let joined = std::thread::spawn(move || {
                let _ = tx.send(handle.join());
            });
            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(internal_error("Logger worker thread panicked")),
                Err(_) => {
                    warn!(
                        "Logger worker thread did not terminate within {:?}; continuing shutdown",
                        JOIN_TIMEOUT
                    );
                }
            }
            let _ = joined.join();
        }
        Ok(())
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{RawImuPacket, ServoExtension};

    fn tempdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("airbrakes-logger-test-{name}"));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn context_packet(state_letter: char) -> ContextDataPacket {
        ContextDataPacket {
            state_letter,
            fetched_packets_in_main: 1,
            imu_queue_size: 0,
            apogee_predictor_queue_size: 0,
            fetched_imu_packets: 1,
            update_timestamp_ns: 0,
        }
    }

    fn servo_packet() -> ServoDataPacket {
        ServoDataPacket { set_extension: ServoExtension::MinNoBuzz, encoder_position: 0 }
    }

    #[test]
    fn file_naming_increments_across_loggers() {
        let dir = tempdir("naming");
        let mut first = Logger::start(&dir).unwrap();
        first.stop().unwrap();
        let mut second = Logger::start(&dir).unwrap();
        second.stop().unwrap();

        assert!(dir.join("log_1.csv").exists());
        assert!(dir.join("log_2.csv").exists());
    }

    #[test]
    fn log_writes_one_row_per_imu_packet() {
        let dir = tempdir("rows");
        let mut logger = Logger::start(&dir).unwrap();
        let packets = vec![
            ImuPacket::Raw(RawImuPacket { timestamp_ns: 0, ..Default::default() }),
            ImuPacket::Raw(RawImuPacket { timestamp_ns: 1, ..Default::default() }),
        ];
        logger.log(context_packet('M'), servo_packet(), &packets, &[], vec![]);
        logger.stop().unwrap();

        let contents = fs::read_to_string(dir.join("log_1.csv")).unwrap();
        // header + 2 rows
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn idle_state_buffers_rows_beyond_capacity() {
        let dir = tempdir("idle");
        let logger = Logger::start(&dir).unwrap();
        let packets: Vec<ImuPacket> = (0..10)
            .map(|i| ImuPacket::Raw(RawImuPacket { timestamp_ns: i, ..Default::default() }))
            .collect();

        // Artificially push the idle counter near capacity so the next
        // batch straddles the buffering boundary.
        {
            let mut idle = logger.idle.lock().unwrap();
            idle.idle_log_counter = IDLE_LOG_CAPACITY - 5;
        }
        logger.log(context_packet('S'), servo_packet(), &packets, &[], vec![]);

        assert_eq!(logger.idle.lock().unwrap().ring_buffer.len(), 5);
    }

    #[test]
    fn transition_out_of_idle_flushes_the_buffer() {
        let dir = tempdir("flush");
        let logger = Logger::start(&dir).unwrap();
        {
            let mut idle = logger.idle.lock().unwrap();
            idle.last_was_idle = true;
            idle.idle_log_counter = IDLE_LOG_CAPACITY;
            idle.ring_buffer.push_back(LoggerDataPacket {
                state_letter: 'S',
                set_extension: ServoExtension::MinNoBuzz,
                encoder_position: 0,
                timestamp_ns: 0,
                invalid_fields: vec![],
                fetched_packets_in_main: 0,
                imu_queue_size: 0,
                apogee_predictor_queue_size: 0,
                fetched_imu_packets: 0,
                update_timestamp_ns: 0,
                est_orient_quaternion_w: None,
                est_orient_quaternion_x: None,
                est_orient_quaternion_y: None,
                est_orient_quaternion_z: None,
                est_pressure_alt: None,
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
            });
        }

        let packets = vec![ImuPacket::Raw(RawImuPacket { timestamp_ns: 0, ..Default::default() })];
        logger.log(context_packet('M'), servo_packet(), &packets, &[], vec![]);

        let idle = logger.idle.lock().unwrap();
        assert!(idle.ring_buffer.is_empty());
        assert_eq!(idle.idle_log_counter, 0);
    }
}
