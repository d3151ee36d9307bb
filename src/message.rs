use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Free-form message payload. Key order is kept as inserted.
pub type Body = Map<String, Value>;

/// Control and lifecycle vocabulary shared by every instrument.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Close,
    Finish,
    Critical,
    Ready,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Close => "close",
            Command::Finish => "finish",
            Command::Critical => "critical",
            Command::Ready => "ready",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "close" => Ok(Command::Close),
            "finish" => Ok(Command::Finish),
            "critical" => Ok(Command::Critical),
            "ready" => Ok(Command::Ready),
            other => Err(format!("Unknown command: {other}")),
        }
    }
}

/// The unit of communication between instruments and their director.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: String,
    pub header: String,
    pub time: DateTime<Local>,
    pub body: Body,
}

impl Message {
    /// A lifecycle event: header `<sender>-event`, `command` first in the body,
    /// followed by the payload keys in their original order.
    pub fn event(sender: &str, command: Command, payload: Body) -> Self {
        let mut body = Body::new();
        body.insert("command".to_owned(), Value::from(command.as_str()));
        for (key, value) in payload {
            if key != "command" {
                body.insert(key, value);
            }
        }
        Self {
            sender: sender.to_owned(),
            header: format!("{sender}-event"),
            time: Local::now(),
            body,
        }
    }

    /// A measurement message, header `<sender>-data`.
    pub fn data(sender: &str, body: Body) -> Self {
        Self {
            sender: sender.to_owned(),
            header: format!("{sender}-data"),
            time: Local::now(),
            body,
        }
    }

    /// The command carried by the body, `None` when absent or not part of
    /// the vocabulary.
    #[must_use]
    pub fn command(&self) -> Option<Command> {
        self.body
            .get("command")
            .and_then(Value::as_str)
            .and_then(|command| command.parse().ok())
    }

    #[must_use]
    pub fn is_event(&self) -> bool {
        self.header.ends_with("-event")
    }

    /// Convenience accessor for string payload fields such as `message`.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.header,
            self.sender,
            Value::Object(self.body.clone())
        )
    }
}
