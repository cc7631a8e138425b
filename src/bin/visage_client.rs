use std::{
    fs::File,
    io::{self, Write},
    path::PathBuf,
    process,
};

use clap::Parser;
use visage::{
    ClientConfig,
    protocol::{self, ClientError},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server port
    port: String,
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,
    /// Image to process; read from standard input when omitted
    #[arg(long)]
    detect: Option<PathBuf>,
    /// Face pasted over every detected face
    #[arg(long = "replaceimage")]
    replace_image: Option<PathBuf>,
    /// Where the resulting image is written; standard output when omitted
    #[arg(long = "outputimage")]
    output_image: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig {
        address: format!("{}:{}", cli.host, cli.port),
        detect: cli.detect,
        replace: cli.replace_image,
    };

    let output_image = cli.output_image;
    let result = protocol::run(&config, io::stdin().lock(), || open_output(output_image));

    if let Err(e) = result {
        eprintln!("visage_client: {e}");
        process::exit(e.exit_code());
    }
}

fn open_output(path: Option<PathBuf>) -> Result<Box<dyn Write>, ClientError> {
    match path {
        Some(path) => match File::create(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(source) => Err(ClientError::OpenOutput { path, source }),
        },
        None => Ok(Box::new(io::stdout().lock())),
    }
}
