//! Per-connection protocol state machine.
//!
//! A connection cycles through the same states for every request:
//!
//! | State       | Success     | Recoverable fault        | Fatal fault                |
//! |-------------|-------------|--------------------------|----------------------------|
//! | AwaitPrefix | AwaitHeader |                          | closed, truncated, foreign |
//! | AwaitHeader | AwaitBody   | bad opcode               | truncated header           |
//! | AwaitBody   | Process     | empty or oversized image | truncated body             |
//! | Process     | send image  | invalid image, no faces  | scratch file failure       |
//!
//! A foreign peer, one whose first bytes are not the protocol prefix, is sent
//! the fallback response before the connection closes.
//!
//! Each step returns `Result<_, Fault>`. A [`Fault::Recoverable`] is answered
//! with an error-message frame and the connection goes back to AwaitPrefix;
//! a [`Fault::Fatal`] ends the connection. The whole table is applied in
//! [`ConnectionHandler::serve`].
use std::{
    io::{self, Read, Write},
    path::PathBuf,
    sync::Arc,
};

use log::{debug, trace};
use thiserror::Error;

use crate::engine::{EngineOutcome, ScratchSpace};

use super::{
    OpCode, ProtocolError, ProtocolTransport, Response, ServerConfig, SharedState,
    transport::TransportError,
};

/// Why a connection ended.
#[derive(Debug, Error)]
pub enum Disconnect {
    #[error("peer closed the connection")]
    Closed,
    #[error("non-protocol client was sent the fallback response")]
    NonProtocol,
    #[error("communication error: {0}")]
    Communication(#[from] TransportError),
    #[error("scratch space error: {0}")]
    Scratch(#[from] io::Error),
}

/// Outcome of a failed state-machine step.
#[derive(Debug)]
pub enum Fault {
    /// Report to the peer and keep the connection.
    Recoverable(ProtocolError),
    /// End the connection.
    Fatal(Disconnect),
}

impl From<ProtocolError> for Fault {
    fn from(value: ProtocolError) -> Self {
        Fault::Recoverable(value)
    }
}

impl From<Disconnect> for Fault {
    fn from(value: Disconnect) -> Self {
        Fault::Fatal(value)
    }
}

impl From<TransportError> for Fault {
    fn from(value: TransportError) -> Self {
        Fault::Fatal(Disconnect::Communication(value))
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    opcode: OpCode,
    size: u32,
}

#[derive(Debug)]
struct Job {
    image: Vec<u8>,
    face: Option<Vec<u8>>,
}

pub struct ConnectionHandler<T: Read + Write> {
    transport: ProtocolTransport<T>,
    state: Arc<SharedState>,
    config: Arc<ServerConfig>,
    scratch: ScratchSpace,
}

impl<T: Read + Write> ConnectionHandler<T> {
    pub fn new(
        stream: T,
        state: Arc<SharedState>,
        config: Arc<ServerConfig>,
        scratch: ScratchSpace,
    ) -> Self {
        Self {
            transport: ProtocolTransport::new(stream),
            state,
            config,
            scratch,
        }
    }

    /// Serves requests until a fatal fault, returning the reason.
    pub fn serve(mut self) -> Disconnect {
        loop {
            let response = match self.next_request() {
                Ok(image) => Response::Image(image),
                Err(Fault::Recoverable(error)) => {
                    debug!("request rejected: {error}");
                    error.into()
                }
                Err(Fault::Fatal(reason)) => return reason,
            };

            if let Err(e) = self.transport.write_response(&response) {
                return Disconnect::Communication(e);
            }
        }
    }

    fn next_request(&mut self) -> Result<Vec<u8>, Fault> {
        self.await_prefix()?;
        let header = self.await_header()?;
        let job = self.await_body(header)?;
        self.process(job)
    }

    fn await_prefix(&mut self) -> Result<(), Fault> {
        match self.transport.read_prefix() {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => Err(Disconnect::Closed.into()),
            Err(TransportError::BadPrefix(prefix)) => {
                debug!("bad prefix {prefix:#010x}, serving fallback response");
                self.transport.write_raw(&self.config.fallback)?;
                Err(Disconnect::NonProtocol.into())
            }
            Err(e) => Err(self.truncated(e)),
        }
    }

    /// Reads the opcode and the size. A frame with an operation the server
    /// does not accept is read to its end before it is rejected, leaving the
    /// stream on the next frame.
    fn await_header(&mut self) -> Result<Header, Fault> {
        let byte = self.transport.read_u8().map_err(|e| self.truncated(e))?;
        let size = self.transport.read_u32().map_err(|e| self.truncated(e))?;

        match OpCode::try_from(byte) {
            Ok(opcode) if opcode.is_request() => {
                trace!("{opcode} request of {size} bytes");
                Ok(Header { opcode, size })
            }
            _ => {
                self.transport.discard(size)?;
                Err(ProtocolError::InvalidOperation.into())
            }
        }
    }

    fn await_body(&mut self, header: Header) -> Result<Job, Fault> {
        let image = self.accept_segment(header.size)?;
        let face = match header.opcode {
            OpCode::Replace => {
                let len = self.transport.read_u32()?;
                if image.is_err() {
                    self.transport.discard(len)?;
                    None
                } else {
                    Some(self.accept_segment(len)?)
                }
            }
            _ => None,
        };

        Ok(Job {
            image: image?,
            face: face.transpose()?,
        })
    }

    /// Reads one image segment of `len` bytes. A segment that is empty or over
    /// the size limit is skipped over and reported in the inner result, so the
    /// stream stays aligned on the next frame.
    fn accept_segment(
        &mut self,
        len: u32,
    ) -> Result<Result<Vec<u8>, ProtocolError>, TransportError> {
        if len == 0 {
            return Ok(Err(ProtocolError::EmptyImage));
        }
        if self.config.max_size != 0 && len > self.config.max_size {
            self.transport.discard(len)?;
            return Ok(Err(ProtocolError::ImageTooLarge));
        }
        self.transport.read_payload(len).map(Ok)
    }

    fn process(&mut self, job: Job) -> Result<Vec<u8>, Fault> {
        let image = self
            .scratch
            .save_image(&job.image)
            .map_err(Disconnect::Scratch)?;
        let face: Option<PathBuf> = job
            .face
            .map(|face| self.scratch.save_face(&face))
            .transpose()
            .map_err(Disconnect::Scratch)?;

        let outcome = self.state.run_engine(|engine| match &face {
            Some(face) => engine.replace(&image, face),
            None => engine.detect(&image),
        });
        debug!("engine finished with {outcome:?}");

        match outcome {
            EngineOutcome::Success => {
                Ok(self.scratch.load_image().map_err(Disconnect::Scratch)?)
            }
            EngineOutcome::InvalidImage => Err(ProtocolError::InvalidImage.into()),
            EngineOutcome::NoFaces => Err(ProtocolError::NoFaces.into()),
        }
    }

    /// Tells the peer its message was cut short, if it is still listening,
    /// and ends the connection.
    fn truncated(&mut self, error: TransportError) -> Fault {
        let notice = Response::from(ProtocolError::InvalidMessage);
        if let Err(e) = self.transport.write_response(&notice) {
            trace!("peer gone before invalid message notice: {e}");
        }
        Fault::Fatal(Disconnect::Communication(error))
    }
}
