//! Lifecycle shared by every component of a benchmarking run.
//!
//! An instrument moves through `opening -> waiting <-> running -> closing`.
//! The state is only written from the instrument's own thread but may be
//! read from anywhere through a [`StateCell`]. Supervisors talk to an
//! instrument over a [`Link`]: one mpsc sender towards the supervisor and one
//! receiver for the supervisor's commands.

use crate::message::{Body, Command, Message};
use anyhow::Result;
use log::{debug, error, trace, warn};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Opening = 0,
    Waiting = 1,
    Running = 2,
    Closing = 3,
}

impl State {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => State::Opening,
            1 => State::Waiting,
            2 => State::Running,
            3 => State::Closing,
            _ => panic!("Unknown state: {raw}"),
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            State::Opening => "opening",
            State::Waiting => "waiting",
            State::Running => "running",
            State::Closing => "closing",
        };
        write!(f, "{name}")
    }
}

/// Shared, lock-free view of an instrument's state.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(State::Opening as u8)))
    }

    #[must_use]
    pub fn get(&self) -> State {
        State::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The receiving side of a channel went away.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Disconnected;

/// An instrument's connection to its supervisor.
#[derive(Debug)]
pub struct Link {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// The supervisor's end of a [`Link`].
#[derive(Debug)]
pub struct Peer {
    pub tx: Sender<Message>,
    pub rx: Receiver<Message>,
}

impl Link {
    #[must_use]
    pub fn new(tx: Sender<Message>, rx: Receiver<Message>) -> Self {
        Self { tx, rx }
    }

    /// Both ends of a dedicated link, for supervisors that don't multiplex.
    #[must_use]
    pub fn pair() -> (Link, Peer) {
        let (up_tx, up_rx) = mpsc::channel();
        let (down_tx, down_rx) = mpsc::channel();
        (
            Link::new(up_tx, down_rx),
            Peer {
                tx: down_tx,
                rx: up_rx,
            },
        )
    }

    pub fn send(&self, message: Message) -> Result<(), Disconnected> {
        self.tx.send(message).map_err(|_| Disconnected)
    }

    /// Receive whatever is available, blocking for at most `timeout`
    /// (forever when `None`) for the first message. Anything queued behind
    /// it is drained without blocking.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Vec<Message>, Disconnected> {
        drain(&self.rx, timeout)
    }
}

/// Shared by [`Link`] and by directors reading their multiplexed inbox.
pub fn drain(
    rx: &Receiver<Message>,
    timeout: Option<Duration>,
) -> Result<Vec<Message>, Disconnected> {
    let mut messages = Vec::new();
    match timeout {
        Some(timeout) if timeout.is_zero() => {}
        Some(timeout) => match rx.recv_timeout(timeout) {
            Ok(message) => messages.push(message),
            Err(RecvTimeoutError::Timeout) => return Ok(messages),
            Err(RecvTimeoutError::Disconnected) => return Err(Disconnected),
        },
        None => match rx.recv() {
            Ok(message) => messages.push(message),
            Err(_) => return Err(Disconnected),
        },
    }
    loop {
        match rx.try_recv() {
            Ok(message) => messages.push(message),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) if messages.is_empty() => return Err(Disconnected),
            Err(TryRecvError::Disconnected) => break,
        }
    }
    Ok(messages)
}

/// Per-instrument bookkeeping every [`Instrument`] carries.
#[derive(Debug)]
pub struct Core {
    name: String,
    state: StateCell,
    link: Option<Link>,
    interrupt: Arc<AtomicBool>,
}

impl Core {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: StateCell::new(),
            link: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn set_state(&self, state: State) {
        let previous = self.state.get();
        if previous != state {
            trace!("{}: {previous} -> {state}", self.name);
        }
        self.state.set(state);
    }

    /// A handle other threads can use to observe this instrument's state.
    #[must_use]
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub fn attach(&mut self, link: Link) {
        self.link = Some(link);
    }

    #[must_use]
    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn set_interrupt(&mut self, interrupt: Arc<AtomicBool>) {
        self.interrupt = interrupt;
    }

    #[must_use]
    pub fn interrupt(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub fn send(&self, message: Message) {
        match &self.link {
            Some(link) => {
                if link.send(message).is_err() {
                    debug!("{}: supervisor gone, message dropped", self.name);
                }
            }
            None => trace!("{}: unlinked, message dropped: {message}", self.name),
        }
    }

    /// `None` when unlinked; otherwise the outcome of [`Link::receive`].
    pub fn receive(
        &self,
        timeout: Option<Duration>,
    ) -> Option<Result<Vec<Message>, Disconnected>> {
        self.link.as_ref().map(|link| link.receive(timeout))
    }

    pub fn release(&mut self) {
        self.link = None;
    }
}

/// A component with a uniform lifecycle and a message channel.
///
/// Concrete instruments provide [`Instrument::run`] (one bounded unit of work
/// per call) and optionally the other hooks; [`Instrument::main`] drives the
/// whole lifecycle on the calling thread.
pub trait Instrument: Send {
    fn core(&self) -> &Core;

    fn core_mut(&mut self) -> &mut Core;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        self.listen(None);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Default command handling; commands outside the lifecycle vocabulary
    /// are ignored.
    fn process_message(&mut self, message: Message) {
        match message.command() {
            Some(Command::Close) => self.core().set_state(State::Closing),
            Some(Command::Start) => self.core().set_state(State::Running),
            Some(Command::Stop) => self.core().set_state(State::Waiting),
            _ => trace!("{}: ignoring {message}", self.name()),
        }
    }

    /// Whether the run loop should drain messages before each step.
    fn can_listen(&self) -> bool {
        self.core().has_link()
    }

    /// Wait up to `timeout` for messages and process them.
    fn listen(&mut self, timeout: Option<Duration>) {
        if self.core().interrupted() {
            self.on_interrupt();
            return;
        }
        match self.core().receive(timeout) {
            Some(Ok(messages)) => {
                for message in messages {
                    self.process_message(message);
                }
            }
            Some(Err(Disconnected)) => {
                warn!("{}: supervisor disconnected, closing", self.name());
                self.core().set_state(State::Closing);
            }
            None => match timeout {
                Some(timeout) => thread::sleep(timeout),
                // Nothing could ever wake us up
                None => self.core().set_state(State::Closing),
            },
        }
    }

    /// An operator interrupt is handled as a `close`.
    fn on_interrupt(&mut self) {
        debug!("{}: interrupted", self.name());
        self.core().set_state(State::Closing);
    }

    fn send_message(&mut self, message: Message) {
        self.core().send(message);
    }

    fn send_event(&mut self, command: Command, payload: Body) {
        let message = Message::event(self.name(), command, payload);
        self.send_message(message);
    }

    /// Escalate an unrecoverable failure: log it, tell the supervisor with a
    /// `critical` event and start closing.
    fn fail(&mut self, reason: &str) {
        error!("{}: {reason}", self.name());
        let mut payload = Body::new();
        payload.insert("message".to_owned(), Value::from(reason));
        self.send_event(Command::Critical, payload);
        self.core().set_state(State::Closing);
    }

    fn release(&mut self) {
        self.core_mut().release();
    }

    /// Run the full lifecycle to completion on the calling thread.
    fn main(&mut self) {
        loop {
            if self.can_listen() {
                self.listen(Some(Duration::ZERO));
            }
            match self.core().state() {
                State::Opening => match self.open() {
                    Ok(()) => {
                        if self.core().state() == State::Opening {
                            self.core().set_state(State::Waiting);
                            if self.core().has_link() {
                                self.send_event(Command::Ready, Body::new());
                            }
                        }
                    }
                    Err(e) => self.fail(&format!("{e:#}")),
                },
                State::Waiting => {
                    if let Err(e) = self.wait() {
                        self.fail(&format!("{e:#}"));
                    }
                }
                State::Running => {
                    if let Err(e) = self.run() {
                        self.fail(&format!("{e:#}"));
                    }
                }
                State::Closing => {
                    if let Err(e) = self.close() {
                        error!("{}: failed to close: {e:#}", self.name());
                    }
                    break;
                }
            }
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Counter {
        core: Core,
        runs: usize,
        limit: usize,
        fail_open: bool,
    }

    impl Counter {
        fn new(limit: usize) -> Self {
            Self {
                core: Core::new("counter"),
                runs: 0,
                limit,
                fail_open: false,
            }
        }
    }

    impl Instrument for Counter {
        fn core(&self) -> &Core {
            &self.core
        }

        fn core_mut(&mut self) -> &mut Core {
            &mut self.core
        }

        fn open(&mut self) -> Result<()> {
            if self.fail_open {
                bail!("cannot open");
            }
            Ok(())
        }

        fn run(&mut self) -> Result<()> {
            self.runs += 1;
            if self.runs == self.limit {
                self.send_event(Command::Finish, Body::new());
                self.core.set_state(State::Waiting);
            }
            Ok(())
        }
    }

    fn command(command: Command) -> Message {
        Message::event("manager", command, Body::new())
    }

    #[test]
    fn test_state_cell_shared() {
        let cell = StateCell::new();
        let other = cell.clone();
        assert_eq!(cell.get(), State::Opening);
        other.set(State::Running);
        assert_eq!(cell.get(), State::Running);
    }

    #[test]
    #[should_panic(expected = "Unknown state")]
    fn test_unknown_state_is_fatal() {
        let _ = State::from_raw(7);
    }

    #[test]
    fn test_lifecycle_over_link() {
        let (link, peer) = Link::pair();
        let mut counter = Counter::new(3);
        counter.core_mut().attach(link);
        let state = counter.core().state_cell();
        let handle = thread::spawn(move || {
            counter.main();
            counter.runs
        });

        let ready = peer.rx.recv().unwrap();
        assert_eq!(ready.command(), Some(Command::Ready));
        assert_eq!(ready.header, "counter-event");

        peer.tx.send(command(Command::Start)).unwrap();
        let finish = peer.rx.recv().unwrap();
        assert_eq!(finish.command(), Some(Command::Finish));

        peer.tx.send(command(Command::Close)).unwrap();
        assert_eq!(handle.join().unwrap(), 3);
        assert_eq!(state.get(), State::Closing);
    }

    #[test]
    fn test_failed_open_escalates_critical() {
        let (link, peer) = Link::pair();
        let mut counter = Counter::new(1);
        counter.fail_open = true;
        counter.core_mut().attach(link);
        let handle = thread::spawn(move || counter.main());

        let critical = peer.rx.recv().unwrap();
        assert_eq!(critical.command(), Some(Command::Critical));
        assert_eq!(critical.text("message"), Some("cannot open"));
        handle.join().unwrap();
        // No ready was ever sent
        assert!(peer.rx.try_recv().is_err());
    }

    #[test]
    fn test_supervisor_gone_closes() {
        let (link, peer) = Link::pair();
        let mut counter = Counter::new(10);
        counter.core_mut().attach(link);
        drop(peer);
        counter.main();
        assert_eq!(counter.core().state(), State::Closing);
        assert_eq!(counter.runs, 0);
    }

    #[test]
    fn test_interrupt_is_close() {
        let (link, _peer) = Link::pair();
        let mut counter = Counter::new(usize::MAX);
        counter.core_mut().attach(link);
        counter
            .core_mut()
            .set_interrupt(Arc::new(AtomicBool::new(true)));
        counter.main();
        assert_eq!(counter.core().state(), State::Closing);
    }

    #[test]
    fn test_stop_returns_to_waiting() {
        let mut counter = Counter::new(usize::MAX);
        counter.core().set_state(State::Running);
        counter.process_message(command(Command::Stop));
        assert_eq!(counter.core().state(), State::Waiting);
        counter.process_message(command(Command::Ready));
        assert_eq!(counter.core().state(), State::Waiting);
    }
}
