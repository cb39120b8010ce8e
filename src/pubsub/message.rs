use serde::Serialize;
use std::fmt;

/// A notification delivered by `NOTIFY` or `pg_notify()`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Notification {
    process_id: i32,
    channel: String,
    payload: String,
}

impl Notification {
    pub fn new(process_id: i32, channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            process_id,
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// PID of the notifying backend
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Payload, empty when the sender gave none
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.channel, self.payload)
    }
}
