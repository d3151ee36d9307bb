mod manager;

pub use manager::Manager;

use crate::instrument::{self, Core, Disconnected, Instrument, Link, State};
use crate::message::{Body, Command, Message};
use anyhow::{bail, Context, Result};
use log::{debug, error, info, trace, warn};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cadence at which a director checks its inbox and the interrupt flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The master subordinate reported `finish`.
    Finished,
    /// A subordinate escalated an unrecoverable failure.
    Critical { sender: String, reason: String },
    /// The operator asked to stop.
    Interrupted,
    /// Every subordinate went away without a verdict.
    Abandoned,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Outcome::Finished => write!(f, "finished"),
            Outcome::Critical { sender, reason } => write!(f, "critical from {sender}: {reason}"),
            Outcome::Interrupted => write!(f, "interrupted"),
            Outcome::Abandoned => write!(f, "abandoned"),
        }
    }
}

struct Subordinate {
    handle: JoinHandle<()>,
    tx: Sender<Message>,
    ready: bool,
}

/// Appends every routed message to a JSON-lines file.
struct EventLog {
    file: File,
}

impl EventLog {
    fn create(path: &Path) -> Result<Self> {
        if let Some(directory) = path.parent() {
            if !directory.as_os_str().is_empty() {
                fs::create_dir_all(directory)
                    .with_context(|| format!("Failed to create {}", directory.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        Ok(Self { file })
    }

    fn record(&mut self, message: &Message) -> Result<()> {
        writeln!(self.file, "{}", message.to_json()?)?;
        Ok(())
    }
}

/// Supervises a set of instruments, each on its own thread.
///
/// Subordinates are spawned in `open`. Each one announces `ready` once
/// through its own `open`; when all have, the director broadcasts `start`.
/// A `critical` event from anyone closes everything.
pub struct Director {
    core: Core,
    pending: Vec<Box<dyn Instrument>>,
    subordinates: BTreeMap<String, Subordinate>,
    inbound: Option<Receiver<Message>>,
    poll_interval: Duration,
    event_log: Option<EventLog>,
    started: bool,
    outcome: Option<Outcome>,
}

impl Director {
    pub fn new(name: &str, subordinates: Vec<Box<dyn Instrument>>) -> Self {
        Self {
            core: Core::new(name),
            pending: subordinates,
            subordinates: BTreeMap::new(),
            inbound: None,
            poll_interval: POLL_INTERVAL,
            event_log: None,
            started: false,
            outcome: None,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_event_log(mut self, path: &Path) -> Result<Self> {
        self.event_log = Some(EventLog::create(path)?);
        Ok(self)
    }

    /// Names of the instruments this director was built with or still tracks.
    pub fn subordinate_names(&self) -> Vec<String> {
        self.pending
            .iter()
            .map(|instrument| instrument.name().to_owned())
            .chain(self.subordinates.keys().cloned())
            .collect()
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.subordinates.len()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    fn record_outcome(&mut self, outcome: Outcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    fn spawn_all(&mut self) -> Result<()> {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        self.inbound = Some(inbound_rx);
        for mut instrument in self.pending.drain(..) {
            let name = instrument.name().to_owned();
            if self.subordinates.contains_key(&name) {
                bail!("Two subordinates are named {name}");
            }
            let (tx, rx) = mpsc::channel();
            instrument
                .core_mut()
                .attach(Link::new(inbound_tx.clone(), rx));
            instrument.core_mut().set_interrupt(self.core.interrupt());
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || instrument.main())
                .with_context(|| format!("Failed to spawn thread for {name}"))?;
            trace!("{}: spawned {name}", self.core.name());
            self.subordinates.insert(
                name,
                Subordinate {
                    handle,
                    tx,
                    ready: false,
                },
            );
        }
        Ok(())
    }

    fn broadcast(&mut self, command: Command) {
        self.send_event(command, Body::new());
    }

    /// Collect incoming messages, handling operator interrupts and the loss
    /// of every subordinate along the way.
    pub(crate) fn receive(&mut self, timeout: Option<Duration>) -> Vec<Message> {
        if self.core.interrupted() {
            self.on_interrupt();
            return Vec::new();
        }
        let received = match &self.inbound {
            Some(inbound) => instrument::drain(inbound, timeout),
            None => {
                if let Some(timeout) = timeout {
                    thread::sleep(timeout);
                }
                return Vec::new();
            }
        };
        match received {
            Ok(messages) => {
                for message in &messages {
                    if let Some(event_log) = self.event_log.as_mut() {
                        if let Err(e) = event_log.record(message) {
                            warn!("Failed to record event: {e:#}");
                        }
                    }
                }
                messages
            }
            Err(Disconnected) if self.core.interrupted() => {
                self.on_interrupt();
                Vec::new()
            }
            Err(Disconnected) => {
                if !self.subordinates.is_empty() {
                    debug!("{}: all subordinates hung up", self.core.name());
                    self.wait_for_closure();
                }
                Vec::new()
            }
        }
    }

    /// Routing shared by every director flavour.
    pub(crate) fn route(&mut self, message: Message) {
        match message.command() {
            Some(Command::Critical) => {
                let reason = message.text("message").unwrap_or("unspecified").to_owned();
                error!("Critical event from {}: {reason}", message.sender);
                self.record_outcome(Outcome::Critical {
                    sender: message.sender,
                    reason,
                });
                self.broadcast(Command::Close);
                self.wait_for_closure();
            }
            Some(Command::Ready) => {
                match self.subordinates.get_mut(&message.sender) {
                    Some(subordinate) => subordinate.ready = true,
                    None => warn!("Ready from unknown subordinate {}", message.sender),
                }
                if !self.started && self.all_ready() {
                    info!("All instruments ready, starting");
                    self.started = true;
                    self.broadcast(Command::Start);
                }
            }
            Some(Command::Finish) => info!("{} finished", message.sender),
            _ => trace!("{}: {message}", self.core.name()),
        }
    }

    fn all_ready(&self) -> bool {
        self.subordinates.values().all(|subordinate| subordinate.ready)
    }

    /// Join every tracked subordinate and drop its channel. Safe to call
    /// repeatedly.
    pub fn wait_for_closure(&mut self) {
        let names: Vec<String> = self.subordinates.keys().cloned().collect();
        for name in names {
            if let Some(subordinate) = self.subordinates.remove(&name) {
                trace!("{}: joining {name}", self.core.name());
                if subordinate.handle.join().is_err() {
                    error!("{name} panicked");
                }
                drop(subordinate.tx);
            }
        }
    }
}

impl Instrument for Director {
    fn core(&self) -> &Core {
        &self.core
    }

    fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    fn open(&mut self) -> Result<()> {
        self.spawn_all()?;
        info!("Program starts - Press CTRL+C to exit gracefully");
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        if self.subordinates.is_empty() {
            self.core.set_state(State::Closing);
        } else {
            self.listen(Some(self.poll_interval));
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        // Directors only ever wait
        self.core.set_state(State::Waiting);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.broadcast(Command::Close);
        self.wait_for_closure();
        self.record_outcome(Outcome::Abandoned);
        info!("Program ends gracefully");
        Ok(())
    }

    fn can_listen(&self) -> bool {
        self.inbound.is_some() && !self.subordinates.is_empty()
    }

    fn listen(&mut self, timeout: Option<Duration>) {
        for message in self.receive(timeout) {
            self.process_message(message);
        }
    }

    fn process_message(&mut self, message: Message) {
        self.route(message);
    }

    fn fail(&mut self, reason: &str) {
        error!("{}: {reason}", self.core.name());
        let sender = self.core.name().to_owned();
        self.record_outcome(Outcome::Critical {
            sender,
            reason: reason.to_owned(),
        });
        self.core.set_state(State::Closing);
    }

    fn on_interrupt(&mut self) {
        info!("Interrupted, closing all instruments");
        self.record_outcome(Outcome::Interrupted);
        self.broadcast(Command::Close);
        self.wait_for_closure();
    }

    fn send_message(&mut self, message: Message) {
        for (name, subordinate) in &self.subordinates {
            if subordinate.tx.send(message.clone()).is_err() {
                debug!("{name} already gone, {} not delivered", message.header);
            }
        }
    }

    fn release(&mut self) {
        self.inbound = None;
        self.core.release();
    }
}
