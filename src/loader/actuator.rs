use crate::loader::controller::Controller;
use crate::loader::monitor::Monitor;
use log::debug;
use serde::Serialize;
use std::collections::VecDeque;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Length of one busy-then-sleep cycle. Kept below the controller's
/// reference period so actuation is finer than regulation.
pub const ACTUATION_PERIOD: Duration = Duration::from_millis(50);

/// Window over which the reported load is averaged.
const TAIL: Duration = Duration::from_secs(1);

/// What a worker achieved, printed by `worker --report`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ActuationReport {
    pub cpu: usize,
    pub target: f64,
    pub ticks: u64,
    pub elapsed_secs: f64,
    /// Controller's filtered load at the end of the run.
    pub cpu_load: f64,
    pub sleep_time: f64,
    /// Mean of the monitor's samples over the last second.
    pub tail_load: Option<f64>,
}

/// Realises the controller's sleep time on the current (pinned) thread by
/// alternately spinning and sleeping.
pub struct Actuator<'a> {
    controller: &'a Controller,
    monitor: &'a Monitor,
    duration: Option<Duration>,
    actuation_period: Duration,
    stop: Arc<AtomicBool>,
}

impl<'a> Actuator<'a> {
    /// `duration` of `None` runs until `stop` is raised.
    pub fn new(
        controller: &'a Controller,
        monitor: &'a Monitor,
        duration: Option<Duration>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        // Start regulating from a measurement rather than the defaults
        controller.set_cpu_load(monitor.cpu_load());
        Self {
            controller,
            monitor,
            duration,
            actuation_period: ACTUATION_PERIOD,
            stop,
        }
    }

    #[must_use]
    pub fn with_actuation_period(mut self, actuation_period: Duration) -> Self {
        self.actuation_period = actuation_period;
        self
    }

    pub fn run(&mut self) -> ActuationReport {
        let start = Instant::now();
        let mut ticks = 0;
        let mut tail: VecDeque<(Instant, f64)> = VecDeque::new();
        while self.duration.map_or(true, |duration| start.elapsed() <= duration) {
            if self.stop.load(Ordering::Relaxed) {
                debug!("cpu{}: actuator stopped early", self.monitor.cpu());
                break;
            }
            let sample = self.monitor.cpu_load();
            self.controller.set_cpu_load(sample);
            let sleep_time = self.controller.sleep_time();
            self.generate_load(Duration::from_secs_f64(sleep_time.max(0.0)));
            ticks += 1;

            let now = Instant::now();
            tail.push_back((now, sample));
            while tail
                .front()
                .is_some_and(|(at, _)| now.duration_since(*at) > TAIL)
            {
                tail.pop_front();
            }
        }

        let tail_load = match tail.len() {
            0 => None,
            n => Some(tail.iter().map(|(_, load)| load).sum::<f64>() / n as f64),
        };
        ActuationReport {
            cpu: self.monitor.cpu(),
            target: self.controller.cpu_target(),
            ticks,
            elapsed_secs: start.elapsed().as_secs_f64(),
            cpu_load: self.controller.cpu_load(),
            sleep_time: self.controller.sleep_time(),
            tail_load,
        }
    }

    /// Spin until `actuation_period - sleep_time` has passed, then sleep.
    fn generate_load(&self, sleep_time: Duration) {
        let busy_until = Instant::now() + self.actuation_period.saturating_sub(sleep_time);
        let mut dummy: u64 = 213_123;
        while Instant::now() < busy_until {
            dummy = compute(dummy);
        }
        black_box(dummy);
        thread::sleep(sleep_time);
    }
}

#[inline(never)]
fn compute(dummy: u64) -> u64 {
    let _ = black_box(dummy.wrapping_mul(dummy));
    dummy.wrapping_add(1)
}
