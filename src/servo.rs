// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The Servo Actuator: drives the airbrakes' physical extension and
//! reads back the rotary encoder, per SPEC_FULL.md section 4.4.
//!
//! `set_extended`/`set_retracted` push the servo to its full-travel
//! position immediately, then after `SERVO_DELAY` back off to the
//! "no buzz" holding position so the motor doesn't sit stalled against
//! its mechanical limit. The reference implementation fires this
//! second phase from an unconditional `threading.Timer`/`time.sleep`
//! that a rapid retract-then-extend can't cancel; this uses a
//! generation counter instead, so a newer command always wins and stale
//! timers become no-ops rather than clobbering a more recent extension.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;

use crate::constants::SERVO_DELAY;
use crate::error::CanonicalResult;
use crate::packets::ServoExtension;

/// Hardware- or simulation-specific actuation. `set_position` takes the
/// raw PWM-style extension value (see `constants::MIN_EXTENSION` etc.);
/// `read_encoder_steps` returns the rotary encoder's current step count.
pub trait ServoBackend: Send {
    fn set_position(&mut self, value: f64) -> CanonicalResult<()>;
    fn read_encoder_steps(&self) -> CanonicalResult<i64>;
}

/// A backend that records commands without driving any hardware, for
/// the `mock` CLI subcommand and for tests.
#[derive(Default)]
pub struct MockServoBackend {
    pub last_value: f64,
    pub encoder_steps: i64,
}

impl ServoBackend for MockServoBackend {
    fn set_position(&mut self, value: f64) -> CanonicalResult<()> {
        self.last_value = value;
        Ok(())
    }

    fn read_encoder_steps(&self) -> CanonicalResult<i64> {
        Ok(self.encoder_steps)
    }
}

struct Inner {
    backend: Box<dyn ServoBackend>,
    generation: u64,
}

/// Owns the hardware backend and the generation counter that makes a
/// newer `set_extended`/`set_retracted` call supersede an
/// already-scheduled no-buzz backoff from an older one.
pub struct Servo {
    inner: Arc<Mutex<Inner>>,
    current_extension: Arc<Mutex<ServoExtension>>,
}

impl Servo {
    pub fn new(backend: Box<dyn ServoBackend>) -> Self {
        Servo {
            inner: Arc::new(Mutex::new(Inner { backend, generation: 0 })),
            current_extension: Arc::new(Mutex::new(ServoExtension::MinNoBuzz)),
        }
    }

    pub fn current_extension(&self) -> ServoExtension {
        *self.current_extension.lock().unwrap()
    }

    pub fn encoder_position(&self) -> i64 {
        match self.inner.lock().unwrap().backend.read_encoder_steps() {
            Ok(steps) => steps,
            Err(e) => {
                warn!("failed to read servo encoder: {e}");
                0
            }
        }
    }

    pub fn set_extended(&self) {
        self.go_to(ServoExtension::MaxExtension, ServoExtension::MaxNoBuzz);
    }

    pub fn set_retracted(&self) {
        self.go_to(ServoExtension::MinExtension, ServoExtension::MinNoBuzz);
    }

    fn go_to(&self, immediate: ServoExtension, settled: ServoExtension) {
        let my_generation = {
            let mut locked = self.inner.lock().unwrap();
            locked.generation += 1;
            let generation = locked.generation;
            self.set_position(&mut locked, immediate);
            generation
        };

        let inner = self.inner.clone();
        let current_extension = self.current_extension.clone();
        std::thread::spawn(move || {
            std::thread::sleep(SERVO_DELAY);
            let mut locked = inner.lock().unwrap();
            if locked.generation != my_generation {
                // A newer command superseded this one; leave its result alone.
                return;
            }
            if let Err(e) = locked.backend.set_position(extension_value(settled)) {
                warn!("failed to set servo to {:?}: {e}", settled);
                return;
            }
            *current_extension.lock().unwrap() = settled;
        });
    }

    fn set_position(&self, locked: &mut Inner, extension: ServoExtension) {
        if let Err(e) = locked.backend.set_position(extension_value(extension)) {
            warn!("failed to set servo to {:?}: {e}", extension);
            return;
        }
        *self.current_extension.lock().unwrap() = extension;
    }
}

fn extension_value(extension: ServoExtension) -> f64 {
    use crate::constants::{MAX_EXTENSION, MAX_NO_BUZZ, MIN_EXTENSION, MIN_NO_BUZZ};
    match extension {
        ServoExtension::MinExtension => MIN_EXTENSION,
        ServoExtension::MinNoBuzz => MIN_NO_BUZZ,
        ServoExtension::MaxExtension => MAX_EXTENSION,
        ServoExtension::MaxNoBuzz => MAX_NO_BUZZ,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_extended_moves_immediately_to_max_extension() {
        let servo = Servo::new(Box::new(MockServoBackend::default()));
        servo.set_extended();
        assert_eq!(servo.current_extension(), ServoExtension::MaxExtension);
    }

    #[test]
    fn set_extended_settles_to_no_buzz_after_delay() {
        let servo = Servo::new(Box::new(MockServoBackend::default()));
        servo.set_extended();
        std::thread::sleep(SERVO_DELAY + Duration::from_millis(200));
        assert_eq!(servo.current_extension(), ServoExtension::MaxNoBuzz);
    }

    #[test]
    fn rapid_retract_after_extend_supersedes_the_stale_backoff() {
        let servo = Servo::new(Box::new(MockServoBackend::default()));
        servo.set_extended();
        servo.set_retracted();
        std::thread::sleep(SERVO_DELAY + Duration::from_millis(200));
        // The extend command's backoff-to-MaxNoBuzz must not fire after
        // a newer retract command has taken over.
        assert_eq!(servo.current_extension(), ServoExtension::MinNoBuzz);
    }

    #[test]
    fn encoder_position_reads_through_to_backend() {
        let mut backend = MockServoBackend::default();
        backend.encoder_steps = 42;
        let servo = Servo::new(Box::new(backend));
        assert_eq!(servo.encoder_position(), 42);
    }
}
