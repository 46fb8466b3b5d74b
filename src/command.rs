//! Client slash commands and their wire form.
//!
//! The client recognises `/exit`, `/list` and
//! `/private -u <user> -m <message>`. The server only acts on `/exit`; the
//! other two are answered with an "unsupported" notice and never broadcast.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    List,
    Private { user: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: /exit")]
    ExitUsage,
    #[error("usage: /list")]
    ListUsage,
    #[error("usage: /private -u <user> -m <message>")]
    PrivateUsage,
}

impl CommandError {
    /// Keyword of the command the input was trying to be, if it was a known one.
    pub fn keyword(&self) -> Option<&'static str> {
        match self {
            Self::Unknown(_) => None,
            Self::ExitUsage => Some("/exit"),
            Self::ListUsage => Some("/list"),
            Self::PrivateUsage => Some("/private"),
        }
    }
}

impl Command {
    /// Parse a line as a command.
    ///
    /// Returns `None` if the input does not start with `/`.
    pub fn parse(input: &str) -> Option<Result<Command, CommandError>> {
        let input = input.trim();
        if !input.starts_with('/') {
            return None;
        }
        let (keyword, rest) = match input.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (input, ""),
        };
        Some(match keyword {
            "/exit" if rest.is_empty() => Ok(Command::Exit),
            "/exit" => Err(CommandError::ExitUsage),
            "/list" if rest.is_empty() => Ok(Command::List),
            "/list" => Err(CommandError::ListUsage),
            "/private" => parse_private(rest),
            other => Err(CommandError::Unknown(other.to_string())),
        })
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Exit => "/exit",
            Self::List => "/list",
            Self::Private { .. } => "/private",
        }
    }

    /// The exact text a client sends for this command.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit | Self::List => f.write_str(self.keyword()),
            Self::Private { user, message } => write!(f, "/private -u {user} -m {message}"),
        }
    }
}

fn parse_private(args: &str) -> Result<Command, CommandError> {
    let rest = flag_value(args, "-u").ok_or(CommandError::PrivateUsage)?;
    let (user, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or(CommandError::PrivateUsage)?;
    let message = flag_value(rest.trim_start(), "-m").ok_or(CommandError::PrivateUsage)?;
    let message = message.trim();
    if user.is_empty() || message.is_empty() {
        return Err(CommandError::PrivateUsage);
    }
    Ok(Command::Private {
        user: user.to_string(),
        message: message.to_string(),
    })
}

/// `"-u bob ..."` with flag `-u` yields `"bob ..."`. The flag must be
/// followed by whitespace.
fn flag_value<'a>(input: &'a str, flag: &str) -> Option<&'a str> {
    let rest = input.strip_prefix(flag)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim_start())
}
