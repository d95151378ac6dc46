use std::{error::Error, net::SocketAddr, path::PathBuf};

use clap::Parser;
use rsh::protocol::{DEFAULT_WORKERS, ShellServer};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory served as the shell's root
    path: PathBuf,
    /// Listen for new connection at address
    address: SocketAddr,
    /// Worker threads for running commands
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = ShellServer::new(cli.address, cli.path, cli.workers)?;

    server.listen()?;
    Ok(())
}
