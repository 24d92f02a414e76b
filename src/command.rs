//! Console commands.
//!
//! One command per line. The first word picks the command; the rest are its
//! arguments.

use std::str::FromStr;

use nixon_core::{Branch, RecordingId};
use thiserror::Error;

pub const HELP: &str = "\
commands:
  level <db>                 post a VAD level measurement
  error <message>            post a fatal engine error
  warn <message>             post an engine warning
  eos                        post end of stream
  toggle <branch> on|off     open or close a branch gate
  record start|stop          start or stop recording
  status                     print the status snapshot
  recordings                 list recordings, newest first
  annotate <id> <genre> <notes...>
  delete <id>                delete a finished recording
  start | stop | restart     pipeline lifecycle
  reload                     reread the config file and restart
  graph                      print the live graph description
  alerts                     print recent warnings and errors
  help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Level(f64),
    Error(String),
    Warn(String),
    EndOfStream,
    Toggle(Branch, bool),
    Record(bool),
    Status,
    Recordings,
    Annotate {
        id: RecordingId,
        genre: String,
        notes: String,
    },
    Delete(RecordingId),
    Start,
    Stop,
    Restart,
    Reload,
    Graph,
    Alerts,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),

    #[error("`{command}` needs {what}")]
    Missing {
        command: &'static str,
        what: &'static str,
    },

    #[error("invalid {what}: {value}")]
    Invalid { what: &'static str, value: String },
}

fn on_off(value: &str) -> Result<bool, CommandError> {
    match value {
        "on" | "start" | "true" | "1" => Ok(true),
        "off" | "stop" | "false" | "0" => Ok(false),
        other => Err(CommandError::Invalid {
            what: "switch",
            value: other.to_string(),
        }),
    }
}

fn recording_id(command: &'static str, value: Option<&str>) -> Result<RecordingId, CommandError> {
    let value = value.ok_or(CommandError::Missing {
        command,
        what: "a recording id",
    })?;
    value
        .parse()
        .map(RecordingId)
        .map_err(|_| CommandError::Invalid {
            what: "recording id",
            value: value.to_string(),
        })
}

/// Everything after the first `skip` words, as typed.
fn rest(line: &str, skip: usize) -> String {
    let mut rest = line.trim_start();
    for _ in 0..skip {
        rest = rest
            .split_once(char::is_whitespace)
            .map_or("", |(_, tail)| tail.trim_start());
    }
    rest.trim_end().to_string()
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(CommandError::Empty);
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "level" => {
                let value = words.next().ok_or(CommandError::Missing {
                    command: "level",
                    what: "a level in dB",
                })?;
                let db = value.parse().map_err(|_| CommandError::Invalid {
                    what: "level",
                    value: value.to_string(),
                })?;
                Command::Level(db)
            }
            "error" => Command::Error(rest(line, 1)),
            "warn" | "warning" => Command::Warn(rest(line, 1)),
            "eos" => Command::EndOfStream,
            "toggle" => {
                let branch = words.next().ok_or(CommandError::Missing {
                    command: "toggle",
                    what: "a branch",
                })?;
                let branch = branch.parse().map_err(|_| CommandError::Invalid {
                    what: "branch",
                    value: branch.to_string(),
                })?;
                let enable = words.next().ok_or(CommandError::Missing {
                    command: "toggle",
                    what: "on or off",
                })?;
                Command::Toggle(branch, on_off(enable)?)
            }
            "record" => {
                let enable = words.next().ok_or(CommandError::Missing {
                    command: "record",
                    what: "start or stop",
                })?;
                Command::Record(on_off(enable)?)
            }
            "status" => Command::Status,
            "recordings" | "ls" => Command::Recordings,
            "annotate" => {
                let id = recording_id("annotate", words.next())?;
                let genre = words.next().ok_or(CommandError::Missing {
                    command: "annotate",
                    what: "a genre",
                })?;
                Command::Annotate {
                    id,
                    genre: genre.to_string(),
                    notes: rest(line, 3),
                }
            }
            "delete" | "rm" => Command::Delete(recording_id("delete", words.next())?),
            "start" => Command::Start,
            "stop" => Command::Stop,
            "restart" => Command::Restart,
            "reload" => Command::Reload,
            "graph" => Command::Graph,
            "alerts" => Command::Alerts,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => return Err(CommandError::Unknown(name.to_string())),
        };

        Ok(command)
    }
}
