pub mod cli;
pub mod client;
pub mod command;
pub mod protocol;
pub mod shell;

pub use cli::{Input, PromptError, prompt};
pub use client::{ClientError, ShellClient};
pub use command::{CommandError, CommandLine};
pub use shell::{CommandRegistry, LocalFileSystem, Shell};
