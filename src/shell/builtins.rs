//! Commands every shell starts with.
use std::{path::Path, thread, time::Duration};

use super::{Command, CommandContext, CommandRegistry};
use crate::command::CommandError;

/// Register the builtin commands.
pub fn register(registry: &mut CommandRegistry) {
    registry.register("cat", "cat FILE... - print file contents", || Box::new(Cat));
    registry.register("cd", "cd [DIR] - change the working directory", || Box::new(Cd));
    registry.register("echo", "echo [WORD]... - print the words", || Box::new(Echo));
    registry.register("help", "help - list the available commands", || Box::new(Help));
    registry.register("ls", "ls [PATH]... - list directory contents", || Box::new(Ls));
    registry.register("pwd", "pwd - print the working directory", || Box::new(Pwd));
    registry.register("sleep", "sleep MILLIS - pause for a while", || Box::new(Sleep));
}

fn file_error(path: &Path, reason: impl ToString) -> CommandError {
    CommandError::File {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

struct Echo;

impl Command for Echo {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[String]) -> Result<i32, CommandError> {
        writeln!(ctx.out, "{}", args.join(" "))?;
        Ok(0)
    }
}

struct Pwd;

impl Command for Pwd {
    fn execute(&self, ctx: &mut CommandContext<'_>, _: &[String]) -> Result<i32, CommandError> {
        let cwd = ctx.cwd().display().to_string();
        writeln!(ctx.out, "{cwd}")?;
        Ok(0)
    }
}

struct Cd;

impl Command for Cd {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[String]) -> Result<i32, CommandError> {
        let target = match args {
            [] => ctx.resolve("/"),
            [dir] => ctx.resolve(dir),
            _ => {
                return Err(CommandError::InvalidCommandArguments {
                    command: "cd".to_string(),
                    reason: "too many arguments".to_string(),
                });
            }
        };

        if !ctx.fs.is_dir(&target) {
            return Err(file_error(&target, "not a directory"));
        }
        ctx.state.cwd = target;
        Ok(0)
    }
}

struct Ls;

impl Command for Ls {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[String]) -> Result<i32, CommandError> {
        let targets = if args.is_empty() {
            vec![ctx.cwd().to_path_buf()]
        } else {
            args.iter().map(|arg| ctx.resolve(arg)).collect()
        };

        let mut status = 0;
        for (n, target) in targets.iter().enumerate() {
            if targets.len() > 1 {
                if n > 0 {
                    writeln!(ctx.out)?;
                }
                writeln!(ctx.out, "{}:", target.display())?;
            }

            match ctx.fs.read_dir(target) {
                Ok(entries) => {
                    for entry in entries {
                        if entry.is_dir {
                            writeln!(ctx.out, "{}/", entry.name)?;
                        } else {
                            writeln!(ctx.out, "{}", entry.name)?;
                        }
                    }
                }
                Err(e) => {
                    writeln!(ctx.err, "ls: {}", file_error(target, e))?;
                    status = 1;
                }
            }
        }
        Ok(status)
    }
}

struct Cat;

impl Command for Cat {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[String]) -> Result<i32, CommandError> {
        if args.is_empty() {
            return Err(CommandError::InvalidCommandArguments {
                command: "cat".to_string(),
                reason: "missing file operand".to_string(),
            });
        }

        let mut status = 0;
        for arg in args {
            let path = ctx.resolve(arg);
            match ctx.fs.read(&path) {
                Ok(contents) => ctx.out.write_all(&contents)?,
                Err(e) => {
                    writeln!(ctx.err, "cat: {}", file_error(&path, e))?;
                    status = 1;
                }
            }
        }
        Ok(status)
    }
}

struct Sleep;

impl Command for Sleep {
    fn execute(&self, _: &mut CommandContext<'_>, args: &[String]) -> Result<i32, CommandError> {
        let millis = match args {
            [millis] => millis.parse::<u64>().map_err(|e| CommandError::InvalidCommandArguments {
                command: "sleep".to_string(),
                reason: e.to_string(),
            })?,
            _ => {
                return Err(CommandError::InvalidCommandArguments {
                    command: "sleep".to_string(),
                    reason: "expected a duration in milliseconds".to_string(),
                });
            }
        };

        thread::sleep(Duration::from_millis(millis));
        Ok(0)
    }
}

struct Help;

impl Command for Help {
    fn execute(&self, ctx: &mut CommandContext<'_>, _: &[String]) -> Result<i32, CommandError> {
        for name in ctx.commands.names() {
            if let Some(help) = ctx.commands.help(name) {
                writeln!(ctx.out, "{help}")?;
            }
        }
        Ok(0)
    }
}
