use crate::director::{Director, Outcome};
use crate::instrument::{Core, Instrument};
use crate::message::{Command, Message};
use anyhow::{bail, Result};
use log::{debug, info};
use std::path::Path;
use std::time::Duration;

/// A [`Director`] whose run ends when its master subordinate reports `finish`.
///
/// Other subordinates (a sensor, say) keep going until they are told to
/// close. A `finish` from anyone else is noted and otherwise ignored.
pub struct Manager {
    director: Director,
    master: String,
}

impl Manager {
    pub fn new(name: &str, subordinates: Vec<Box<dyn Instrument>>, master: &str) -> Result<Self> {
        let director = Director::new(name, subordinates);
        if !director.subordinate_names().iter().any(|n| n == master) {
            bail!("Master {master} is not among the instruments");
        }
        Ok(Self {
            director,
            master: master.to_owned(),
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.director = self.director.with_poll_interval(poll_interval);
        self
    }

    pub fn with_event_log(mut self, path: &Path) -> Result<Self> {
        self.director = self.director.with_event_log(path)?;
        Ok(self)
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.director.outcome()
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.director.tracked()
    }

    /// Close every subordinate and join them all. Safe to repeat.
    pub fn shutdown(&mut self) {
        self.director.broadcast(Command::Close);
        self.director.wait_for_closure();
    }
}

impl Instrument for Manager {
    fn core(&self) -> &Core {
        self.director.core()
    }

    fn core_mut(&mut self) -> &mut Core {
        self.director.core_mut()
    }

    fn open(&mut self) -> Result<()> {
        self.director.open()
    }

    fn wait(&mut self) -> Result<()> {
        if self.director.tracked() == 0 {
            self.director.wait()
        } else {
            self.listen(Some(self.director.poll_interval));
            Ok(())
        }
    }

    fn run(&mut self) -> Result<()> {
        self.director.run()
    }

    fn close(&mut self) -> Result<()> {
        self.director.close()
    }

    fn can_listen(&self) -> bool {
        self.director.can_listen()
    }

    fn listen(&mut self, timeout: Option<Duration>) {
        for message in self.director.receive(timeout) {
            self.process_message(message);
        }
    }

    fn process_message(&mut self, message: Message) {
        if message.is_event() && message.command() == Some(Command::Finish) {
            if message.sender == self.master {
                info!("Master {} finished, closing", self.master);
                self.director.record_outcome(Outcome::Finished);
                self.shutdown();
            } else {
                debug!("{} finished, waiting for {}", message.sender, self.master);
            }
        } else {
            self.director.route(message);
        }
    }

    fn on_interrupt(&mut self) {
        self.director.on_interrupt();
    }

    fn fail(&mut self, reason: &str) {
        self.director.fail(reason);
    }

    fn send_message(&mut self, message: Message) {
        self.director.send_message(message);
    }

    fn release(&mut self) {
        self.director.release();
    }
}
