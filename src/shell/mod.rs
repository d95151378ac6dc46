//! The remote shell executed on behalf of `Execute` requests.
//!
//! A [`Shell`] owns the per-connection state (the working directory) and runs one line at
//! a time: the line is parsed into a [`CommandLine`], the command is looked up in a
//! [`CommandRegistry`], and it runs against a [`CommandContext`] holding the output
//! writers, the [`FileSystem`], and the shell state.
//!
//! Commands never touch host paths directly. They see a virtual tree rooted at `/` and go
//! through the [`FileSystem`] they are handed, which is what confines a session to the
//! directory the server exports.
//!
//! # Exit Codes
//! - `0`: success (or whatever the command chose to return).
//! - `1`: the command failed; the reason is written to the error stream.
//! - `2`: the line could not be parsed.
//! - `127`: no such command.
mod builtins;
mod fs;

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::debug;

pub use fs::{DirEntry, FileSystem, LocalFileSystem, normalize};

use crate::command::{CommandError, CommandLine};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 127;

/// A runnable shell command.
pub trait Command: Send + Sync {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[String]) -> Result<i32, CommandError>;
}

/// Builds a fresh command instance.
pub type CommandFactory = fn() -> Box<dyn Command>;

struct Registration {
    help: String,
    factory: CommandFactory,
}

/// Commands known to a shell, by name.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Registration>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the builtin commands.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtins::register(&mut registry);
        registry
    }

    /// Register `name`, replacing any previous registration.
    pub fn register(&mut self, name: &str, help: &str, factory: CommandFactory) {
        self.commands.insert(
            name.to_string(),
            Registration {
                help: help.to_string(),
                factory,
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Option<Box<dyn Command>> {
        self.commands.get(name).map(|r| (r.factory)())
    }

    pub fn help(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(|r| r.help.as_str())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellState {
    pub cwd: PathBuf,
}

impl Default for ShellState {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("/"),
        }
    }
}

/// Everything a running command may use.
pub struct CommandContext<'a> {
    pub out: &'a mut dyn Write,
    pub err: &'a mut dyn Write,
    pub fs: &'a dyn FileSystem,
    pub state: &'a mut ShellState,
    pub commands: &'a CommandRegistry,
}

impl CommandContext<'_> {
    pub fn cwd(&self) -> &Path {
        &self.state.cwd
    }

    /// The virtual path `path` names from the working directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.fs.canonical(&self.state.cwd, Path::new(path))
    }
}

/// One shell session.
pub struct Shell {
    commands: Arc<CommandRegistry>,
    fs: Arc<dyn FileSystem>,
    state: Mutex<ShellState>,
}

impl Shell {
    pub fn new(commands: Arc<CommandRegistry>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            commands,
            fs,
            state: Mutex::new(ShellState::default()),
        }
    }

    pub fn cwd(&self) -> PathBuf {
        self.state.lock().unwrap().cwd.clone()
    }

    /// Run one line and return its exit code. Lines run one at a time per shell.
    pub fn execute(&self, line: &str, out: &mut dyn Write, err: &mut dyn Write) -> i32 {
        let command_line = match CommandLine::try_from(line) {
            Ok(command_line) => command_line,
            Err(CommandError::Empty) => return EXIT_SUCCESS,
            Err(e) => {
                let _ = writeln!(err, "rsh: {e}");
                return EXIT_USAGE;
            }
        };

        let Some(command) = self.commands.lookup(&command_line.name) else {
            let _ = writeln!(err, "rsh: {}: command not found", command_line.name);
            return EXIT_NOT_FOUND;
        };

        debug!("running {:?}", command_line);
        let mut state = self.state.lock().unwrap();
        let mut ctx = CommandContext {
            out: &mut *out,
            err: &mut *err,
            fs: self.fs.as_ref(),
            state: &mut *state,
            commands: &self.commands,
        };

        match command.execute(&mut ctx, &command_line.args) {
            Ok(code) => code,
            Err(e) => {
                let _ = writeln!(err, "{}: {e}", command_line.name);
                EXIT_FAILURE
            }
        }
    }
}
