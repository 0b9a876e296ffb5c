//! Command processing
//!
//! Maps one inbound line to an [`Effect`]. Processing is pure: the session
//! loop decides how each effect reaches the hub or its own outbound queue.

/// Leading character that switches a line into command mode
pub const COMMAND_MARKER: char = '/';

/// Reply for an unrecognised command
pub const UNKNOWN_COMMAND: &str = "Unknown command, use /help to list available commands";

/// Reply for a malformed whisper
pub const WHISPER_USAGE: &str = "Usage: /w <name> <message>";

const HELP: &[&str] = &[
    "Available commands:",
    "/help : show this list",
    "/w <name> <message> : send a private message",
    "/infos, /mem, /stats : show server diagnostics",
    "/list : list connected clients",
    "/shutdown : stop the server",
    "/quit, /leave : disconnect",
];

/// What a line asks the server to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Nothing to do
    None,
    /// Send to every registered session
    Broadcast(String),
    /// Send these lines to the sender only
    Reply(Vec<String>),
    /// Direct message, routed through the hub
    Whisper { to: String, text: String },
    /// Registered names, one per line, to the sender
    List,
    /// Runtime diagnostics to the sender
    Diagnostics,
    /// Stop the whole server
    Shutdown,
    /// Soft leave of the sender
    Leave,
}

/// Map a raw line from `sender` to its effect
pub fn process(line: &str, sender: &str) -> Effect {
    if line.is_empty() {
        return Effect::None;
    }

    let Some(body) = line.strip_prefix(COMMAND_MARKER) else {
        return Effect::Broadcast(format!("{}: {}", sender, line));
    };

    let Some((command, args)) = split_token(body) else {
        return unknown();
    };

    match command {
        "help" => Effect::Reply(HELP.iter().map(|s| s.to_string()).collect()),
        "w" => match split_token(args) {
            Some((to, text)) if !text.is_empty() => Effect::Whisper {
                to: to.to_string(),
                text: text.to_string(),
            },
            _ => Effect::Reply(vec![WHISPER_USAGE.to_string()]),
        },
        "infos" | "mem" | "stats" => Effect::Diagnostics,
        "list" => Effect::List,
        "shutdown" => Effect::Shutdown,
        "quit" | "leave" => Effect::Leave,
        _ => unknown(),
    }
}

fn unknown() -> Effect {
    Effect::Reply(vec![UNKNOWN_COMMAND.to_string()])
}

/// Split off the first whitespace-delimited token; the rest keeps its
/// inner spacing but loses surrounding whitespace.
fn split_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], s[idx..].trim_start())),
        None => Some((s, "")),
    }
}
