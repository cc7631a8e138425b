use std::{
    fs,
    io::{self, Read, Write},
    net::TcpStream,
    path::{Path, PathBuf},
};

use log::{debug, info};
use thiserror::Error;

use super::{ProtocolTransport, Request, Response, TransportError};

pub const EXIT_CONNECT: i32 = 3;
pub const EXIT_READ_INPUT: i32 = 7;
pub const EXIT_SERVER_MESSAGE: i32 = 9;
pub const EXIT_COMMUNICATION: i32 = 13;
pub const EXIT_WRITE_OUTPUT: i32 = 19;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to the server on \"{address}\"")]
    Connect { address: String, source: io::Error },
    #[error("unable to open the input file \"{}\" for reading", .path.display())]
    ReadInput { path: PathBuf, source: io::Error },
    #[error("unable to open the output file \"{}\" for writing", .path.display())]
    OpenOutput { path: PathBuf, source: io::Error },
    #[error("unable to write the output image: {0}")]
    WriteOutput(io::Error),
    #[error("a communication error occurred")]
    Communication(#[from] TransportError),
    #[error("the image to send is empty")]
    EmptyImage,
    #[error("received the following error message: \"{0}\"")]
    Server(String),
}

impl ClientError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Connect { .. } => EXIT_CONNECT,
            ClientError::ReadInput { .. } => EXIT_READ_INPUT,
            ClientError::Server(_) => EXIT_SERVER_MESSAGE,
            ClientError::Communication(_) | ClientError::EmptyImage => EXIT_COMMUNICATION,
            ClientError::OpenOutput { .. } | ClientError::WriteOutput(_) => EXIT_WRITE_OUTPUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub address: String,
    /// Image to process; read from the supplied input stream when absent.
    pub detect: Option<PathBuf>,
    /// Face to paste over every detected face; turns the job into a replace.
    pub replace: Option<PathBuf>,
}

/// One connection carrying one request and its response.
pub struct ClientSession<T: Read + Write> {
    transport: ProtocolTransport<T>,
}

impl ClientSession<TcpStream> {
    pub fn connect(address: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).map_err(|source| ClientError::Connect {
            address: address.to_string(),
            source,
        })?;
        debug!("connected to {address}");
        Ok(Self::new(stream))
    }
}

impl<T: Read + Write> ClientSession<T> {
    pub fn new(stream: T) -> Self {
        Self {
            transport: ProtocolTransport::new(stream),
        }
    }

    pub fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        if request.segments().iter().any(|segment| segment.is_empty()) {
            return Err(ClientError::EmptyImage);
        }
        self.transport.write_request(request)?;
        Ok(())
    }

    /// Reads exactly one response frame. Empty payloads are never sent by a
    /// well-behaved server and count as a communication error.
    pub fn receive(&mut self) -> Result<Response, ClientError> {
        let response = self.transport.read_response()?;
        if response.payload().is_empty() {
            return Err(TransportError::EmptyPayload(response.opcode()).into());
        }
        Ok(response)
    }

    /// Sends `request` and returns the image the server produced.
    pub fn exchange(&mut self, request: &Request) -> Result<Vec<u8>, ClientError> {
        self.send(request)?;
        match self.receive()? {
            Response::Image(image) => Ok(image),
            Response::Error(message) => Err(ClientError::Server(message)),
        }
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>, ClientError> {
    fs::read(path).map_err(|source| ClientError::ReadInput {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs one client invocation: loads the images, performs a single exchange
/// and writes the resulting image to the sink returned by `open_output`.
///
/// The sink is only opened once the server has answered with an image.
pub fn run<R, W, F>(config: &ClientConfig, mut input: R, open_output: F) -> Result<(), ClientError>
where
    R: Read,
    W: Write,
    F: FnOnce() -> Result<W, ClientError>,
{
    let image = match &config.detect {
        Some(path) => read_input(path)?,
        None => {
            let mut image = Vec::new();
            input
                .read_to_end(&mut image)
                .map_err(|source| ClientError::ReadInput {
                    path: PathBuf::from("-"),
                    source,
                })?;
            image
        }
    };
    let face = config.replace.as_deref().map(read_input).transpose()?;
    let request = Request::new(image, face);

    let mut session = ClientSession::connect(&config.address)?;
    let result = session.exchange(&request)?;
    info!("received {} byte image", result.len());

    let mut output = open_output()?;
    output
        .write_all(&result)
        .and_then(|_| output.flush())
        .map_err(ClientError::WriteOutput)
}
