//! CLI utilities for the shell client.
//!
//! Lines starting with `.` are handled by the client itself; everything else is sent to the
//! server as a shell command.
use std::{
    io::{self, BufRead, Write},
    time::Duration,
};

use thiserror::Error;

/// Possible inputs from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Exit command `.exit`, or end of input
    Exit,
    /// Round trip check `.ping`
    Ping,
    /// Change the request timeout, `.timeout MILLIS`
    Timeout(Duration),
    /// Client help `.help`
    Help,
    /// A line for the remote shell
    Line(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),

    #[error("invalid timeout '{0}', expected milliseconds")]
    InvalidTimeout(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub const CLIENT_HELP: &str = "\
.exit           leave the shell
.ping           measure the round trip to the server
.timeout MILLIS set the timeout for each request
.help           show this message
Anything else runs on the server; try 'help'.";

/// Prompt user for one line of input.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Input, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Input::Exit);
    }

    let s = s.trim();
    match s.split_once(char::is_whitespace) {
        _ if !s.starts_with('.') => Ok(Input::Line(s.to_string())),
        Some((".timeout", millis)) => millis
            .trim()
            .parse::<u64>()
            .map(|millis| Input::Timeout(Duration::from_millis(millis)))
            .map_err(|_| PromptError::InvalidTimeout(millis.trim().to_string())),
        None if s == ".exit" => Ok(Input::Exit),
        None if s == ".ping" => Ok(Input::Ping),
        None if s == ".help" => Ok(Input::Help),
        _ => Err(PromptError::Unrecognized(s.to_string())),
    }
}
