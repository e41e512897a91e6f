// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The Context: the main task's control loop, per SPEC_FULL.md section
//! 4.5. Owns the State, Data Processor, and the producer/consumer
//! endpoints of every background worker, and drives one iteration of
//! the flight-control pipeline per call to `update()`.
//!
//! Grounded on the reference implementation's `AirbrakesContext`: the
//! same `update()` step order (drain IMU batch, partition, feed
//! processor, drain predictions, run state, forward to predictor during
//! Coast, build packets, log), and the same `start()`/`stop()`
//! subsystem ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use nix::sys::resource::{setpriority, Which};
use nix::unistd::Pid;

use crate::apogee_predictor::ApogeePredictor;
use crate::constants::MAIN_PROCESS_NICE;
use crate::data_processor::DataProcessor;
use crate::error::CanonicalResult;
use crate::imu_source::ImuSource;
use crate::logger::Logger;
use crate::packets::{ApogeePredictorDataPacket, ContextDataPacket, ImuPacket, ServoDataPacket};
use crate::servo::Servo;
use crate::state::{State, StandbyState};

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Owns every component's producer/consumer endpoint and the single
/// control loop that ties them together. Background workers (IMU
/// Source, Apogee Predictor, Logger) are already running by the time
/// they're handed to `Context::new`, mirroring the lifecycle established
/// by their own `start()` constructors.
pub struct Context {
    state: Option<Box<dyn State>>,
    imu: ImuSource,
    servo: Servo,
    logger: Logger,
    data_processor: DataProcessor,
    apogee_predictor: ApogeePredictor,
    camera_recording: Arc<AtomicBool>,
    shutdown_requested: bool,
    stopped: bool,
    last_apogee_predictor_packet: ApogeePredictorDataPacket,
    target_altitude_meters: f64,
}

impl Context {
    pub fn new(
        imu: ImuSource,
        servo: Servo,
        logger: Logger,
        apogee_predictor: ApogeePredictor,
        target_altitude_meters: f64,
    ) -> Self {
        // Entering Standby, like any other state, retracts the airbrakes
        // as a safety default.
        servo.set_retracted();
        Context {
            state: Some(Box::new(StandbyState)),
            imu,
            servo,
            logger,
            data_processor: DataProcessor::new(),
            apogee_predictor,
            camera_recording: Arc::new(AtomicBool::new(false)),
            shutdown_requested: false,
            stopped: false,
            last_apogee_predictor_packet: ApogeePredictorDataPacket::default(),
            target_altitude_meters,
        }
    }

    /// Raises the process's scheduling priority. Best-effort: failure
    /// (e.g. running unprivileged) is logged and does not abort startup,
    /// since IMU Source, Logger, and Apogee Predictor are already
    /// running by the time `Context` owns them.
    pub fn start(&self) {
        match setpriority(Which::Process(Pid::this()), MAIN_PROCESS_NICE) {
            Ok(()) => info!("raised process scheduling priority (nice {MAIN_PROCESS_NICE})"),
            Err(e) => warn!("failed to raise process scheduling priority: {e}"),
        }
        info!("flight-control core starting at {}", chrono::Local::now().to_rfc3339());
    }

    /// Retracts the airbrakes and stops every background subsystem. A
    /// second call is a no-op.
    pub fn stop(&mut self) -> CanonicalResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.servo.set_retracted();
        self.imu.stop()?;
        self.logger.stop()?;
        self.apogee_predictor.stop()?;
        Ok(())
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Called by `LandedState` once the Logger's idle buffer fills.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn data_processor(&self) -> &DataProcessor {
        &self.data_processor
    }

    pub fn servo(&self) -> &Servo {
        &self.servo
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn imu(&self) -> &ImuSource {
        &self.imu
    }

    pub fn last_apogee_predictor_packet(&self) -> ApogeePredictorDataPacket {
        self.last_apogee_predictor_packet
    }

    pub fn target_altitude_meters(&self) -> f64 {
        self.target_altitude_meters
    }

    pub fn extend_airbrakes(&self) {
        self.servo.set_extended();
    }

    pub fn retract_airbrakes(&self) {
        self.servo.set_retracted();
    }

    pub fn start_camera_recording(&self) {
        self.camera_recording.store(true, Ordering::Release);
    }

    pub fn stop_camera_recording(&self) {
        self.camera_recording.store(false, Ordering::Release);
    }

    pub fn is_camera_recording(&self) -> bool {
        self.camera_recording.load(Ordering::Acquire)
    }

    /// The current flight-phase letter (S, M, C, F, or L).
    pub fn state_letter(&self) -> char {
        self.state.as_ref().map(|s| s.name()).unwrap_or('S')
    }

    /// Runs one iteration of the control loop, per SPEC_FULL.md section
    /// 4.5's eight-step `update()` contract.
    pub fn update(&mut self) {
        // 1. Drain a batch of IMU packets; an empty batch is a no-op.
        let imu_packets = self.imu.get_many();
        if imu_packets.is_empty() {
            return;
        }

        // 2. Partition into Estimated and Raw, preserving order.
        let estimated_packets: Vec<_> =
            imu_packets.iter().filter_map(|p| p.as_estimated().cloned()).collect();

        // 3. Feed Estimated packets to the Data Processor.
        self.data_processor.update(&estimated_packets);
        let processor_packets: Vec<_> = if estimated_packets.is_empty() {
            Vec::new()
        } else {
            self.data_processor.get_processor_data_packets().to_vec()
        };

        // 4. Drain Apogee Predictor Data Packets; cache the most recent.
        let apogee_packets = self.apogee_predictor.get_prediction_data_packets();
        if let Some(latest) = apogee_packets.last() {
            self.last_apogee_predictor_packet = *latest;
        }

        // 5. Run the current state; entering a new state retracts the
        // airbrakes as a safety default.
        let mut state = self.state.take().expect("Context always holds a state");
        if let Some(next_state) = state.update(self) {
            self.servo.set_retracted();
            self.state = Some(next_state);
        } else {
            self.state = Some(state);
        }

        // 6. Forward Processor Data Packets to the Apogee Predictor
        // while coasting, only for batches that actually contained
        // Estimated packets (to avoid duplicating inputs).
        if self.state_letter() == 'C' && !estimated_packets.is_empty() {
            self.apogee_predictor.update(processor_packets.clone());
        }

        // 7. Build Context and Servo Data Packets.
        let context_packet = ContextDataPacket {
            state_letter: self.state_letter(),
            fetched_packets_in_main: imu_packets.len(),
            imu_queue_size: self.imu.queue_size(),
            apogee_predictor_queue_size: self.apogee_predictor.processor_data_packet_queue_size(),
            fetched_imu_packets: self.imu.packets_per_cycle(),
            update_timestamp_ns: now_ns(),
        };
        let servo_packet = ServoDataPacket {
            set_extension: self.servo.current_extension(),
            encoder_position: self.servo.encoder_position(),
        };

        // 8. Submit everything to the Logger in a single call.
        self.logger.log(
            context_packet,
            servo_packet,
            &imu_packets,
            &processor_packets,
            apogee_packets,
        );
    }

    #[cfg(test)]
    pub(crate) fn set_last_apogee_predictor_packet_for_test(
        &mut self,
        packet: ApogeePredictorDataPacket,
    ) {
        self.last_apogee_predictor_packet = packet;
    }

    #[cfg(test)]
    pub(crate) fn set_data_processor_for_test(&mut self, data_processor: DataProcessor) {
        self.data_processor = data_processor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu_source::MockImuBackend;
    use crate::packets::{EstimatedImuPacket, RawImuPacket};
    use crate::servo::MockServoBackend;

    fn make_context(packets: Vec<ImuPacket>) -> Context {
        let dir = std::env::temp_dir().join(format!(
            "airbrakes-context-test-{:?}",
            std::thread::current().id()
        ));
        Context::new(
            ImuSource::start(Box::new(MockImuBackend::new(packets))),
            Servo::new(Box::new(MockServoBackend::default())),
            Logger::start(&dir).unwrap(),
            ApogeePredictor::start(true),
            1100.0,
        )
    }

    #[test]
    fn update_on_empty_batch_does_not_advance_state() {
        let mut ctx = make_context(vec![]);
        ctx.update();
        assert_eq!(ctx.state_letter(), 'S');
    }

    #[test]
    fn update_processes_a_batch_and_stays_in_standby_below_thresholds() {
        let packets = vec![ImuPacket::Estimated(EstimatedImuPacket {
            timestamp_ns: 0,
            est_pressure_alt: Some(100.0),
            est_orient_quaternion_w: Some(1.0),
            est_compensated_accel_z: Some(9.798),
            ..Default::default()
        })];
        let mut ctx = make_context(packets);
        std::thread::sleep(std::time::Duration::from_millis(50));
        ctx.update();
        assert_eq!(ctx.state_letter(), 'S');
    }

    #[test]
    fn stop_is_idempotent() {
        let mut ctx = make_context(vec![ImuPacket::Raw(RawImuPacket::default())]);
        ctx.stop().unwrap();
        ctx.stop().unwrap();
    }
}
