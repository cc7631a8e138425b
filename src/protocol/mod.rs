//! Client-server communication protocol.
//!
//! This module defines the wire protocol used between visage clients and the
//! server, the per-connection state machine that serves it, and the shared
//! state every connection thread works against.
//!
//! # Overview
//!
//! A client opens a TCP connection and sends a request frame carrying one image
//! (detect) or two images (replace). The server answers every request with
//! exactly one frame: either the processed image or an error message. Errors
//! the peer can correct (an unknown operation, an empty or oversized image, an
//! image the engine rejects) keep the connection open; anything that breaks the
//! byte stream closes it.
//!
//! # Binary Format
//!
//! | Field          | Size     | Encoding                                  |
//! |----------------|----------|-------------------------------------------|
//! | prefix         | 4 bytes  | little-endian [`PROTOCOL_PREFIX`]         |
//! | opcode         | 1 byte   | [`OpCode`]                                |
//! | segment length | 4 bytes  | little-endian unsigned, once per segment  |
//! | segment        | variable | raw bytes                                 |
//!
//! Detect requests, output images and error messages carry one segment;
//! replace requests carry the target image followed by the replacement face.
//!
//! # Key Components
//!
//! - [`ProtocolTransport`]: Frame codec over any bidirectional stream.
//! - [`ConnectionHandler`]: The server-side state machine for one connection.
//! - [`ImageServer`]: Accept loop spawning one thread per connection.
//! - [`SharedState`]: Counters and the engine behind one lock.
//! - [`ClientSession`]: One request, one response.
//!
//! # See Also
//!
//! - [`engine`](crate::engine): The collaborator that does the image work.
mod client;
mod handler;
mod request;
mod response;
mod server;
mod state;
mod transport;

pub use client::{ClientConfig, ClientError, ClientSession, run};
pub use handler::{ConnectionHandler, Disconnect, Fault};
pub use request::{OpCode, Request};
pub use response::{ProtocolError, Response};
pub use server::{DEFAULT_FALLBACK, ImageServer, ServerConfig, ServerError};
pub use state::{ConnectionGuard, CounterMirror, Counters, SharedState, StatusFiles};
pub use transport::{Frame, PROTOCOL_PREFIX, ProtocolTransport, TransportError};

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Cursor, Read, Write};

    /// In-memory stream: reads come from a fixed input, writes are collected.
    pub struct Duplex {
        input: Cursor<Vec<u8>>,
        pub output: Vec<u8>,
    }

    impl Duplex {
        pub fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stream whose peer has stopped reading: reads succeed, every write fails.
    pub struct BrokenPipe {
        input: Cursor<Vec<u8>>,
    }

    impl BrokenPipe {
        pub fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
            }
        }
    }

    impl Read for BrokenPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }
}
