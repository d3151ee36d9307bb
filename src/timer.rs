use crate::instrument::{Core, Instrument, State};
use crate::message::{Body, Command};
use anyhow::Result;
use log::info;
use std::time::{Duration, Instant};

/// Ends a run after a fixed time when nothing else would.
///
/// The countdown starts with the first `run`. While counting the timer
/// listens with the remaining time as timeout, so a `close` is seen at once.
pub struct Timer {
    core: Core,
    duration: Duration,
    stop_time: Option<Instant>,
}

impl Timer {
    #[must_use]
    pub fn new(name: &str, duration: Duration) -> Self {
        Self {
            core: Core::new(name),
            duration,
            stop_time: None,
        }
    }
}

impl Instrument for Timer {
    fn core(&self) -> &Core {
        &self.core
    }

    fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    fn run(&mut self) -> Result<()> {
        let stop_time = match self.stop_time {
            Some(stop_time) => stop_time,
            None => {
                info!("Starting timer for {:.1} seconds", self.duration.as_secs_f64());
                let stop_time = Instant::now() + self.duration;
                self.stop_time = Some(stop_time);
                stop_time
            }
        };
        let remaining = stop_time.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            self.listen(Some(remaining));
        }
        if Instant::now() >= stop_time && self.core.state() == State::Running {
            self.send_event(Command::Finish, Body::new());
            self.core.set_state(State::Waiting);
        }
        Ok(())
    }
}
