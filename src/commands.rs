//! Line command dispatch.
//!
//! Each input line is split on ASCII whitespace; the first token is looked up
//! in a fixed command table. Lookup is exact and case-sensitive. Lines whose
//! token is not in the table are echoed back byte-for-byte as
//! `ECHO [<line>]`.
//!
//! ```text
//! help            -> usage summary
//! time            -> Current server time: 2024-05-01T12:00:00+02:00
//! status          -> server status block
//! quit            -> Bye!  (connection is then closed)
//! anything else   -> ECHO [anything else]
//! ```

use bytes::BytesMut;
use chrono::{Local, SecondsFormat};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::status::StatusSource;

const HELP_TEXT: &str = "
Available commands:
  help       - Display this help message
  quit       - Close the connection
  time       - Display the current server time
  status     - Display server status (uptime, connections)
  <message>  - Echo back the message
";

const FAREWELL: &str = "Bye!\n";

const STATUS_UNAVAILABLE: &str = "Status information not available\n";

/// What the session should do after sending a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep reading lines.
    Continue,
    /// Close the connection once the reply is written.
    Close,
}

/// Response to one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: BytesMut,
    pub action: Action,
}

impl Reply {
    fn text(body: impl AsRef<[u8]>) -> Self {
        Self {
            body: BytesMut::from(body.as_ref()),
            action: Action::Continue,
        }
    }

    fn closing(body: impl AsRef<[u8]>) -> Self {
        Self {
            body: BytesMut::from(body.as_ref()),
            action: Action::Close,
        }
    }

    /// Whether the session should keep reading after this reply.
    pub fn keeps_open(&self) -> bool {
        self.action == Action::Continue
    }
}

type Handler = fn(&CommandDispatcher, &[&[u8]]) -> Reply;

/// Maps command tokens to handlers, falling back to echo.
pub struct CommandDispatcher {
    commands: HashMap<&'static str, Handler>,
    status: Option<Arc<dyn StatusSource>>,
}

impl CommandDispatcher {
    /// Build the command table. Without a status source, `status` reports
    /// that no information is available.
    pub fn new(status: Option<Arc<dyn StatusSource>>) -> Self {
        let mut commands: HashMap<&'static str, Handler> = HashMap::new();
        commands.insert("help", help);
        commands.insert("quit", quit);
        commands.insert("time", time);
        commands.insert("status", status_report);

        Self { commands, status }
    }

    /// Dispatcher whose `status` command reports from `source`.
    pub fn with_status(source: Arc<dyn StatusSource>) -> Self {
        Self::new(Some(source))
    }

    /// Handle one line with its line terminator already stripped.
    pub fn dispatch(&self, line: &[u8]) -> Reply {
        let mut tokens = line
            .split(u8::is_ascii_whitespace)
            .filter(|token| !token.is_empty());

        let handler = tokens
            .next()
            .and_then(|token| std::str::from_utf8(token).ok())
            .and_then(|name| self.commands.get(name));

        match handler {
            Some(handler) => {
                let args: Vec<&[u8]> = tokens.collect();
                handler(self, &args)
            }
            None => echo(line),
        }
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.commands.keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("CommandDispatcher")
            .field("commands", &names)
            .field("has_status", &self.status.is_some())
            .finish()
    }
}

fn help(_: &CommandDispatcher, _args: &[&[u8]]) -> Reply {
    Reply::text(HELP_TEXT)
}

fn quit(_: &CommandDispatcher, _args: &[&[u8]]) -> Reply {
    Reply::closing(FAREWELL)
}

fn time(_: &CommandDispatcher, _args: &[&[u8]]) -> Reply {
    let now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    Reply::text(format!("Current server time: {now}\n"))
}

fn status_report(dispatcher: &CommandDispatcher, _args: &[&[u8]]) -> Reply {
    match &dispatcher.status {
        Some(source) => Reply::text(source.status().to_string()),
        None => Reply::text(STATUS_UNAVAILABLE),
    }
}

fn echo(line: &[u8]) -> Reply {
    let mut body = BytesMut::with_capacity(line.len() + 8);
    body.extend_from_slice(b"ECHO [");
    body.extend_from_slice(line);
    body.extend_from_slice(b"]\n");
    Reply {
        body,
        action: Action::Continue,
    }
}
