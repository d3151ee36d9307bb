use crate::loader::controller::LoadFilter;
use crate::loader::Role;
use anyhow::{bail, Result};
use log::{trace, warn};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// CPU time consumed so far by every thread of this process.
pub fn process_cpu_time() -> Result<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, exclusively borrowed timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        bail!(
            "clock_gettime(CLOCK_PROCESS_CPUTIME_ID) failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// Samples the utilisation of the hosting process, which the worker has
/// pinned to a single logical CPU.
#[derive(Debug)]
pub struct Monitor {
    cpu: usize,
    sampling_interval: Duration,
    load: Mutex<LoadFilter>,
}

impl Monitor {
    #[must_use]
    pub fn new(cpu: usize, sampling_interval: Duration) -> Self {
        Self {
            cpu,
            sampling_interval,
            // Samples are published unfiltered; the controller smooths them.
            load: Mutex::new(LoadFilter::new(1.0, 0.5)),
        }
    }

    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    #[must_use]
    pub fn cpu_load(&self) -> f64 {
        self.load
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .value()
    }

    pub fn set_cpu_load(&self, sample: f64) {
        self.load
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(sample);
    }

    /// Sample continuously on a background thread. The wait for a stop signal
    /// doubles as the sampling window, so a sample covers exactly one
    /// `sampling_interval`.
    pub fn start(self: &Arc<Self>) -> std::io::Result<Role> {
        let (tx, rx) = mpsc::channel::<()>();
        let monitor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("monitor-{}", self.cpu))
            .spawn(move || loop {
                let window = Window::open();
                match rx.recv_timeout(monitor.sampling_interval) {
                    Err(RecvTimeoutError::Timeout) => match window.and_then(Window::close) {
                        Ok(sample) => {
                            trace!("cpu{}: load sample {sample:.3}", monitor.cpu);
                            monitor.set_cpu_load(sample);
                        }
                        Err(e) => warn!("cpu{}: failed to sample load: {e:#}", monitor.cpu),
                    },
                    _ => break,
                }
            })?;
        Ok(Role::new("monitor", tx, handle))
    }
}

/// A measurement window: process CPU time over wall time.
struct Window {
    cpu_time: Duration,
    wall: Instant,
}

impl Window {
    fn open() -> Result<Self> {
        Ok(Self {
            cpu_time: process_cpu_time()?,
            wall: Instant::now(),
        })
    }

    fn close(self) -> Result<f64> {
        let cpu_time = process_cpu_time()?.saturating_sub(self.cpu_time);
        let wall = self.wall.elapsed();
        if wall.is_zero() {
            bail!("empty sampling window");
        }
        Ok(cpu_time.as_secs_f64() / wall.as_secs_f64())
    }
}
