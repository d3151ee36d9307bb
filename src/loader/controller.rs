//! PI regulator turning measured CPU load into an actuation sleep time.
//!
//! All quantities are fractions: a load of 0.5 is 50% of one logical CPU.

use crate::loader::Role;
use log::trace;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Period the sleep time refers to, in seconds.
pub const REFERENCE_PERIOD: f64 = 0.1;
pub const KP: f64 = 0.02;
pub const KI: f64 = 0.2;
/// Filter coefficient applied to load samples on the regulation side.
pub const ALPHA: f64 = 0.2;

/// First-order low-pass filter, `value = alpha * sample + (1 - alpha) * value`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LoadFilter {
    alpha: f64,
    value: f64,
}

impl LoadFilter {
    #[must_use]
    pub fn new(alpha: f64, initial: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: initial,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        self.value
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Settings {
    pub kp: f64,
    pub ki: f64,
    pub reference_period: f64,
    pub alpha: f64,
    /// Upper bound of the target; 1.0 is one full logical CPU.
    pub max_target: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kp: KP,
            ki: KI,
            reference_period: REFERENCE_PERIOD,
            alpha: ALPHA,
            max_target: 1.0,
        }
    }
}

#[derive(Debug)]
struct Regulator {
    cpu_target: f64,
    load: LoadFilter,
    cpu_period: f64,
    sleep_time: f64,
    integral_error: f64,
    last_sample: Instant,
}

/// Shared between the regulation role and the actuator of one worker.
#[derive(Debug)]
pub struct Controller {
    settings: Settings,
    state: Mutex<Regulator>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Controller {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            state: Mutex::new(Regulator {
                cpu_target: 0.2,
                load: LoadFilter::new(settings.alpha, 0.0),
                cpu_period: 0.03,
                sleep_time: 0.02,
                integral_error: 0.0,
                last_sample: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Regulator> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_cpu_target(&self, cpu_target: f64) {
        self.state().cpu_target = cpu_target.clamp(0.0, self.settings.max_target);
    }

    #[must_use]
    pub fn cpu_target(&self) -> f64 {
        self.state().cpu_target
    }

    /// Feed one load sample through the filter.
    pub fn set_cpu_load(&self, sample: f64) {
        self.state().load.update(sample);
    }

    #[must_use]
    pub fn cpu_load(&self) -> f64 {
        self.state().load.value()
    }

    #[must_use]
    pub fn sleep_time(&self) -> f64 {
        self.state().sleep_time
    }

    /// Busy part of the reference period.
    #[must_use]
    pub fn cpu_period(&self) -> f64 {
        self.state().cpu_period
    }

    #[must_use]
    pub fn integral_error(&self) -> f64 {
        self.state().integral_error
    }

    /// Regulate using the wall-clock time since the previous tick.
    pub fn tick(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state();
        let elapsed = now.duration_since(state.last_sample).as_secs_f64();
        state.last_sample = now;
        self.step(&mut state, elapsed)
    }

    /// One regulation step over `elapsed` seconds; returns the new sleep time.
    pub fn regulate(&self, elapsed: f64) -> f64 {
        let mut state = self.state();
        state.last_sample = Instant::now();
        self.step(&mut state, elapsed)
    }

    fn step(&self, state: &mut Regulator, elapsed: f64) -> f64 {
        let reference_period = self.settings.reference_period;
        // A load above target gives a negative error, shrinking the busy
        // period and growing the sleep time.
        let err = state.cpu_target - state.load.value();
        state.integral_error += err * elapsed;
        let mut cpu_period = self.settings.kp * err + self.settings.ki * state.integral_error;

        // Anti-windup: while saturated, this tick's integration is undone.
        if cpu_period < 0.0 {
            cpu_period = 0.0;
            state.integral_error -= err * elapsed;
        }
        if cpu_period > reference_period {
            cpu_period = reference_period;
            state.integral_error -= err * elapsed;
        }

        state.cpu_period = cpu_period;
        state.sleep_time = reference_period - cpu_period;
        trace!(
            "err {err:.3} integral {:.3} sleep {:.4}",
            state.integral_error,
            state.sleep_time
        );
        state.sleep_time
    }

    /// Regulate every `sampling_interval` on a background thread until the
    /// returned role is stopped.
    pub fn start(self: &Arc<Self>, sampling_interval: Duration) -> std::io::Result<Role> {
        let (tx, rx) = mpsc::channel::<()>();
        let controller = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("controller".to_owned())
            .spawn(move || loop {
                match rx.recv_timeout(sampling_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        controller.tick();
                    }
                    _ => break,
                }
            })?;
        Ok(Role::new("controller", tx, handle))
    }
}
