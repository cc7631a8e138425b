use std::{
    env, fs,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    process,
};

use clap::Parser;
use log::{error, info};
use visage::{
    ExternalEngine, ImageServer, ServerConfig, SharedState,
    protocol::{DEFAULT_FALLBACK, ServerError, StatusFiles},
};

const EXIT_USAGE: i32 = 11;
const EXIT_FILE_WRITE: i32 = 1;
const EXIT_LISTEN: i32 = 5;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Most connections served at once; 0 for no limit
    #[arg(value_parser = clap::value_parser!(u64).range(0..=10_000))]
    max_connections: u64,
    /// Largest accepted image in bytes; 0 for no limit
    max_size: u32,
    /// Port to listen on; an ephemeral port is chosen when omitted
    port: Option<u16>,
    /// Program that performs detection and replacement
    #[arg(long)]
    engine: PathBuf,
    /// Extra argument passed to the engine before the operation (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,
    /// File sent to clients that do not speak the protocol
    #[arg(long)]
    response_file: Option<PathBuf>,
    /// Directory receiving the thread and socket counter files
    #[arg(long)]
    status_dir: Option<PathBuf>,
    /// Directory holding each connection's working images
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let fallback = match &cli.response_file {
        Some(path) => fs::read(path).unwrap_or_else(|e| {
            eprintln!("visage_server: cannot read the response file {path:?}: {e}");
            process::exit(EXIT_USAGE);
        }),
        None => DEFAULT_FALLBACK.to_vec(),
    };

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        address: SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            cli.port.unwrap_or(0),
        )),
        max_connections: cli.max_connections as usize,
        max_size: cli.max_size,
        scratch_dir: cli.scratch_dir.unwrap_or(defaults.scratch_dir),
        fallback,
    };

    let status_dir = cli.status_dir.unwrap_or_else(env::temp_dir);
    if let Err(e) = fs::create_dir_all(&status_dir) {
        eprintln!("visage_server: cannot create the status directory {status_dir:?}: {e}");
        process::exit(EXIT_FILE_WRITE);
    }

    let engine = ExternalEngine::new(cli.engine).with_args(cli.engine_args);
    let state = SharedState::with_mirror(engine, StatusFiles::new(status_dir));

    let scratch_dir = config.scratch_dir.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutting down");
        if let Err(e) = fs::remove_dir_all(&scratch_dir) {
            error!("failed to remove scratch directory {scratch_dir:?}: {e}");
        }
        process::exit(0);
    }) {
        error!("failed to install interrupt handler: {e}");
    }

    let port = cli.port.unwrap_or(0);
    let server = match ImageServer::bind(config, state) {
        Ok(server) => server,
        Err(e @ ServerError::ScratchDir { .. }) => {
            error!("{e}");
            eprintln!("visage_server: {e}");
            process::exit(EXIT_FILE_WRITE);
        }
        Err(e) => {
            error!("{e}");
            eprintln!("visage_server: cannot listen on given port \"{port}\"");
            process::exit(EXIT_LISTEN);
        }
    };

    if let Err(e) = server.listen() {
        eprintln!("visage_server: {e}");
        process::exit(EXIT_LISTEN);
    }
}
