use clap::{Parser, ValueEnum};
use std::{
    error::Error,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use rsh::{
    ClientError, Input, PromptError, ShellClient,
    cli::CLIENT_HELP,
    prompt,
    protocol::{IdStrategy, SessionOptions},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Ids {
    /// Counter starting at 1
    Sequential,
    /// Random 128-bit tokens
    Random,
}

impl From<Ids> for IdStrategy {
    fn from(value: Ids) -> Self {
        match value {
            Ids::Sequential => IdStrategy::Sequential,
            Ids::Random => IdStrategy::Random,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the shell server
    address: SocketAddr,
    /// Request timeout in milliseconds
    #[arg(short, long, default_value_t = 10_000)]
    timeout: u64,
    /// How request ids are generated
    #[arg(long, value_enum, default_value_t = Ids::Sequential)]
    ids: Ids,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let options = SessionOptions::default().with_ids(cli.ids.into());
    let client = ShellClient::connect(cli.address, options)?;

    // Ctrl-C cancels the running command instead of killing the client.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::Release))?;
    }

    if let Some(banner) = client.banner(Duration::from_millis(500)) {
        println!("{banner}");
    }

    let mut timeout = Duration::from_millis(cli.timeout);
    let stdin = io::stdin();

    loop {
        if client.is_closed() {
            eprintln!("connection closed");
            break;
        }

        let input = match prompt(stdin.lock(), io::stdout().lock()) {
            Ok(input) => input,
            Err(PromptError::Io(e)) => return Err(e.into()),
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match input {
            Input::Exit => break,
            Input::Help => println!("{CLIENT_HELP}"),
            Input::Ping => match client.ping(timeout) {
                Ok(rtt) => println!("pong in {rtt:?}"),
                Err(e) => eprintln!("ping failed: {e}"),
            },
            Input::Timeout(t) => {
                timeout = t;
                println!("timeout set to {t:?}");
            }
            Input::Line(line) if line.is_empty() => {}
            Input::Line(line) => {
                let mut out = io::stdout();
                let mut err = io::stderr();
                match client.execute(&line, timeout, &mut out, &mut err, &interrupted) {
                    Ok(0) => {}
                    Ok(code) => eprintln!("exit {code}"),
                    Err(ClientError::Interrupted) => eprintln!("^C"),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
        }
    }

    client.close();
    Ok(())
}
