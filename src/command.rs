//! Command line parsing.
//!
//! This module defines [`CommandLine`], the parsed form of one line typed at the remote
//! shell: a command name followed by its arguments. Parsing is deliberately small: words are
//! split on whitespace, and double quotes group words (with `\"` and `\\` escapes inside
//! quotes). There is no variable expansion, globbing, or piping.
//!
//! # Example
//! ```rust
//! use rsh::CommandLine;
//!
//! let line = CommandLine::try_from(r#"echo "hello world" again"#).unwrap();
//! assert_eq!(line.name, "echo");
//! assert_eq!(line.args, vec!["hello world", "again"]);
//! ```
//!
//! # See Also
//! - [`shell`](crate::shell): Looks up and runs the parsed command.
use thiserror::Error;

/// List of possible errors that a command can throw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),

    #[error("{path}: {reason}")]
    File { path: String, reason: String },

    #[error("failed to write output: {0}")]
    Output(String),

    #[error("no command provided")]
    Empty,
}

impl From<std::io::Error> for CommandError {
    fn from(value: std::io::Error) -> Self {
        CommandError::Output(value.to_string())
    }
}

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub name: String,
    pub args: Vec<String>,
}

impl TryFrom<&str> for CommandLine {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut words = split(value)?.into_iter();
        let name = words.next().ok_or(CommandError::Empty)?;

        Ok(CommandLine {
            name,
            args: words.collect(),
        })
    }
}

fn split(line: &str) -> Result<Vec<String>, CommandError> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.trim().chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if quoted => match chars.next() {
                Some(escaped @ ('"' | '\\')) => word.push(escaped),
                Some(other) => {
                    word.push('\\');
                    word.push(other);
                }
                None => word.push('\\'),
            },
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                word.push(c);
                in_word = true;
            }
        }
    }

    if quoted {
        return Err(CommandError::UnterminatedQuote(line.trim().to_string()));
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}
