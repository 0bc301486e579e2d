//! Job-instance state machine.
//!
//! States move strictly forward; the four terminal states are sinks and
//! trigger archival. The only edge not going through `Running` into a
//! terminal state is `Submitted -> Crashed`, taken when an instance waited
//! past its queue's time-to-live and is expired without ever being
//! attributed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Submitted,
    Attributed,
    Running,
    Done,
    Crashed,
    Killed,
    Cancelled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Done | State::Crashed | State::Killed | State::Cancelled
        )
    }

    /// Whether `self -> to` is a legal mutation of a job instance's state.
    pub fn can_transition(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Submitted, Attributed)
                | (Attributed, Running)
                | (Running, Done)
                | (Running, Crashed)
                | (Running, Killed)
                | (Submitted, Cancelled)
                | (Attributed, Cancelled)
                | (Submitted, Crashed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Submitted => "SUBMITTED",
            State::Attributed => "ATTRIBUTED",
            State::Running => "RUNNING",
            State::Done => "DONE",
            State::Crashed => "CRASHED",
            State::Killed => "KILLED",
            State::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(State::Submitted),
            "ATTRIBUTED" => Ok(State::Attributed),
            "RUNNING" => Ok(State::Running),
            "DONE" => Ok(State::Done),
            "CRASHED" => Ok(State::Crashed),
            "KILLED" => Ok(State::Killed),
            "CANCELLED" => Ok(State::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}
