//! In-memory stand-in for a PostgreSQL server.
//!
//! `FakeServer` keeps the server side of one session: which channels it is
//! listening on, the notifications queued for delivery and every command
//! received. `FakeBackend` is the client end; its waits block on a condvar
//! and can be interrupted like the real socket poll.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use pg_pubsub::{Backend, Client, Error, Interrupt, Notification, QueryResult, Result, ServerError};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const BACKEND_PID: i32 = 4242;

#[derive(Default)]
struct State {
    listening: HashSet<String>,
    queued: VecDeque<Notification>,
    commands: Vec<String>,
    interrupted: bool,
    closed: bool,
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<State>,
    cond: Condvar,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, poll_interval: Duration) -> Client<FakeBackend> {
        Client::with_poll_interval(
            FakeBackend {
                server: Arc::clone(self),
            },
            poll_interval,
        )
    }

    /// NOTIFY from another session; delivered only if this session listens
    pub fn notify(&self, channel: &str, payload: &str) {
        let mut state = self.state.lock();
        if state.listening.contains(channel) {
            state
                .queued
                .push_back(Notification::new(BACKEND_PID + 1, channel, payload));
            self.cond.notify_all();
        }
    }

    /// Queue a notification regardless of the server-side LISTEN state
    pub fn inject(&self, channel: &str, payload: &str) {
        let mut state = self.state.lock();
        state
            .queued
            .push_back(Notification::new(BACKEND_PID + 1, channel, payload));
        self.cond.notify_all();
    }

    /// Drop the session as if the server went away
    pub fn disconnect(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn listening(&self) -> HashSet<String> {
        self.state.lock().listening.clone()
    }

    fn run(&self, command: &str) -> Result<QueryResult> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        state.commands.push(command.to_string());

        let tag = if command == "UNLISTEN *" {
            state.listening.clear();
            "UNLISTEN"
        } else if let Some(name) = command.strip_prefix("LISTEN ") {
            state.listening.insert(unquote_ident(name));
            "LISTEN"
        } else if let Some(name) = command.strip_prefix("UNLISTEN ") {
            state.listening.remove(&unquote_ident(name));
            "UNLISTEN"
        } else if let Some(args) = command
            .strip_prefix("SELECT pg_notify(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let (channel, rest) = parse_literal(args);
            let (payload, _) = parse_literal(rest.trim_start_matches(", "));
            if state.listening.contains(&channel) {
                state
                    .queued
                    .push_back(Notification::new(BACKEND_PID, channel, payload));
                self.cond.notify_all();
            }
            "SELECT 1"
        } else {
            return Err(Error::Server(ServerError {
                severity: Some("ERROR".into()),
                code: Some("42601".into()),
                message: Some(format!("unsupported command {command:?}")),
                ..Default::default()
            }));
        };

        Ok(QueryResult {
            tag: tag.to_string(),
            ..Default::default()
        })
    }
}

fn unquote_ident(quoted: &str) -> String {
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(quoted)
        .replace("\"\"", "\"")
}

/// Parse one quoted literal from the front of `input`
fn parse_literal(input: &str) -> (String, &str) {
    let (escaped, input) = match input.strip_prefix('E') {
        Some(rest) => (true, rest),
        None => (false, input),
    };
    let body = input.strip_prefix('\'').unwrap_or(input);

    let mut value = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\'' if matches!(chars.peek(), Some((_, '\''))) => {
                chars.next();
                value.push('\'');
            }
            '\'' => return (value, &body[idx + 1..]),
            '\\' if escaped => {
                if let Some((_, next)) = chars.next() {
                    value.push(next);
                }
            }
            c => value.push(c),
        }
    }
    (value, "")
}

struct FakeInterrupt {
    server: Arc<FakeServer>,
}

impl Interrupt for FakeInterrupt {
    fn interrupt(&self) -> std::io::Result<()> {
        self.server.state.lock().interrupted = true;
        self.server.cond.notify_all();
        Ok(())
    }
}

pub struct FakeBackend {
    server: Arc<FakeServer>,
}

impl Backend for FakeBackend {
    fn execute(&mut self, command: &str) -> Result<QueryResult> {
        self.server.run(command)
    }

    fn wait_for_activity(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.server.state.lock();
        loop {
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            if !state.queued.is_empty() {
                return Ok(true);
            }
            if state.interrupted {
                state.interrupted = false;
                return Ok(false);
            }
            if self.server.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(false);
            }
        }
    }

    fn drain_notifications(&mut self) -> Result<Vec<Notification>> {
        let mut state = self.server.state.lock();
        if state.closed && state.queued.is_empty() {
            return Err(Error::ConnectionClosed);
        }
        Ok(state.queued.drain(..).collect())
    }

    fn has_pending_notifications(&self) -> bool {
        !self.server.state.lock().queued.is_empty()
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        Arc::new(FakeInterrupt {
            server: Arc::clone(&self.server),
        })
    }

    fn take_notices(&mut self) -> Vec<ServerError> {
        Vec::new()
    }

    fn close(&mut self) -> Result<()> {
        self.server.disconnect();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.server.state.lock().closed
    }
}
