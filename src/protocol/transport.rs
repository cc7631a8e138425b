use std::io::{self, Read, Write};

use bincode::{
    config::{Configuration, Fixint, LittleEndian},
    decode_from_slice, decode_from_std_read, encode_into_std_write,
};
use log::trace;
use thiserror::Error;

use super::{OpCode, Request, Response};

/// Magic value opening every frame.
pub const PROTOCOL_PREFIX: u32 = 0x2310_7231;

const PREFIX_SIZE: usize = size_of::<u32>();
const OPCODE_SIZE: usize = size_of::<u8>();
const SEGMENT_LENGTH_SIZE: usize = size_of::<u32>();

/// Upper bound on the buffer reserved before a payload's bytes arrive.
const PREALLOCATION_LIMIT: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("bad protocol prefix {0:#010x}")]
    BadPrefix(u32),
    #[error("unknown operation type {0}")]
    UnknownOpcode(u8),
    #[error("unexpected {0} frame")]
    UnexpectedOpcode(OpCode),
    #[error("empty {0} payload")]
    EmptyPayload(OpCode),
    #[error("segment of {0} bytes does not fit a 32-bit length")]
    SegmentTooLarge(usize),
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    fn truncated(expected: usize, received: usize) -> Self {
        TransportError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {expected} bytes, stream ended after {received}"),
        ))
    }
}

/// One complete protocol message: prefix, opcode and its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub segments: Vec<Vec<u8>>,
}

/// Reads and writes frames over any bidirectional byte stream.
///
/// Every numeric field is a fixed-width little-endian integer, whatever the
/// host byte order.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: Configuration<LittleEndian, Fixint>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding();
        Self { stream, config }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Writes the prefix, the opcode and every segment, then flushes. The
    /// frame is assembled first so it reaches the stream in a single write.
    pub fn write_frame(
        &mut self,
        opcode: OpCode,
        segments: &[&[u8]],
    ) -> Result<(), TransportError> {
        let body: usize = segments
            .iter()
            .map(|segment| SEGMENT_LENGTH_SIZE + segment.len())
            .sum();
        let mut buf = Vec::with_capacity(PREFIX_SIZE + OPCODE_SIZE + body);

        encode_into_std_write(PROTOCOL_PREFIX, &mut buf, self.config)?;
        encode_into_std_write(u8::from(opcode), &mut buf, self.config)?;
        for segment in segments {
            let len = u32::try_from(segment.len())
                .map_err(|_| TransportError::SegmentTooLarge(segment.len()))?;
            encode_into_std_write(len, &mut buf, self.config)?;
            buf.extend_from_slice(segment);
        }

        trace!("writing {opcode} frame of {} bytes", buf.len());
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_request(&mut self, request: &Request) -> Result<(), TransportError> {
        self.write_frame(request.opcode(), &request.segments())
    }

    pub fn write_response(&mut self, response: &Response) -> Result<(), TransportError> {
        self.write_frame(response.opcode(), &[response.payload()])
    }

    /// Writes bytes outside of any framing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads the 4-byte prefix and checks it against [`PROTOCOL_PREFIX`].
    ///
    /// A stream that ends before its first byte yields [`TransportError::Closed`];
    /// one that ends part-way through the prefix is an I/O error.
    pub fn read_prefix(&mut self) -> Result<(), TransportError> {
        let mut buf = [0u8; PREFIX_SIZE];
        let mut filled = 0;

        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Err(TransportError::Closed),
                Ok(0) => return Err(TransportError::truncated(PREFIX_SIZE, filled)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let (prefix, _) = decode_from_slice::<u32, _>(&buf, self.config)?;
        if prefix != PROTOCOL_PREFIX {
            return Err(TransportError::BadPrefix(prefix));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, TransportError> {
        Ok(decode_from_std_read::<u8, _, _>(&mut self.stream, self.config)?)
    }

    pub fn read_u32(&mut self) -> Result<u32, TransportError> {
        Ok(decode_from_std_read::<u32, _, _>(&mut self.stream, self.config)?)
    }

    /// Reads exactly `len` bytes. The buffer grows as data arrives rather
    /// than trusting the peer's length for one large allocation.
    pub fn read_payload(&mut self, len: u32) -> Result<Vec<u8>, TransportError> {
        let expected = len as usize;
        let mut payload = Vec::with_capacity(expected.min(PREALLOCATION_LIMIT));

        Read::by_ref(&mut self.stream)
            .take(u64::from(len))
            .read_to_end(&mut payload)?;

        if payload.len() != expected {
            return Err(TransportError::truncated(expected, payload.len()));
        }
        Ok(payload)
    }

    /// Consumes and drops exactly `len` bytes.
    pub fn discard(&mut self, len: u32) -> Result<(), TransportError> {
        let mut limited = Read::by_ref(&mut self.stream).take(u64::from(len));
        let dropped = io::copy(&mut limited, &mut io::sink())?;

        if dropped != u64::from(len) {
            return Err(TransportError::truncated(len as usize, dropped as usize));
        }
        Ok(())
    }

    pub fn read_segment(&mut self) -> Result<Vec<u8>, TransportError> {
        let len = self.read_u32()?;
        self.read_payload(len)
    }

    /// Reads a whole frame, taking the number of segments from its opcode.
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        self.read_prefix()?;
        let opcode = OpCode::try_from(self.read_u8()?)?;
        let segments = (0..opcode.segments())
            .map(|_| self.read_segment())
            .collect::<Result<Vec<_>, _>>()?;

        trace!("read {opcode} frame with {} segment(s)", segments.len());
        Ok(Frame { opcode, segments })
    }

    pub fn read_response(&mut self) -> Result<Response, TransportError> {
        self.read_frame()?.try_into()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};

    use crate::protocol::testing::BrokenPipe;

    use super::*;

    fn transport_over(bytes: &[u8]) -> ProtocolTransport<Cursor<Vec<u8>>> {
        ProtocolTransport::new(Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn read_write_request() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        let request = Request::Replace {
            image: b"target".to_vec(),
            face: b"face".to_vec(),
        };

        transport.write_request(&request).unwrap();
        transport.stream.seek(SeekFrom::Start(0)).unwrap();
        let frame = transport.read_frame().unwrap();

        assert_eq!(frame.opcode, OpCode::Replace);
        assert_eq!(frame.segments, vec![b"target".to_vec(), b"face".to_vec()]);
    }

    #[test]
    fn read_write_response() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport
            .write_response(&Response::Error("image too large".to_string()))
            .unwrap();
        transport.stream.seek(SeekFrom::Start(0)).unwrap();
        let resp = transport.read_response().unwrap();
        assert_eq!(resp, Response::Error("image too large".to_string()));
    }

    #[test]
    fn failed_write_is_io_error() {
        let mut transport = ProtocolTransport::new(BrokenPipe::new(Vec::new()));

        let err = transport
            .write_frame(OpCode::OutputImage, &[b"abc"])
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe
        ));

        let err = transport.write_raw(b"fallback").unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn frame_layout_is_little_endian() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));

        transport
            .write_frame(OpCode::OutputImage, &[b"abc"])
            .unwrap();

        let bytes = transport.into_inner().into_inner();
        assert_eq!(
            bytes,
            vec![0x31, 0x72, 0x10, 0x23, 0x02, 0x03, 0x00, 0x00, 0x00, b'a', b'b', b'c']
        );
    }

    #[test]
    fn read_prefix_mismatch() {
        let mut transport = transport_over(b"GET / HTTP/1.1\r\n\r\n");

        let err = transport.read_prefix().unwrap_err();
        let expected = u32::from_le_bytes(*b"GET ");
        assert!(matches!(err, TransportError::BadPrefix(p) if p == expected));
    }

    #[test]
    fn read_prefix_on_empty_stream() {
        let mut transport = transport_over(&[]);

        assert!(matches!(
            transport.read_prefix().unwrap_err(),
            TransportError::Closed
        ));
    }

    #[test]
    fn read_prefix_truncated() {
        let mut transport = transport_over(&[0x31, 0x72]);

        assert!(matches!(
            transport.read_prefix().unwrap_err(),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn read_u32_short() {
        let mut transport = transport_over(&[0x01, 0x02, 0x03]);

        assert!(transport.read_u32().is_err());
    }

    #[test]
    fn read_payload_short() {
        let mut transport = transport_over(b"abc");

        assert!(transport.read_payload(4).is_err());
    }

    #[test]
    fn discard_skips_exact_length() {
        let mut transport = transport_over(&[9, 9, 9, 0x05, 0x00, 0x00, 0x00]);

        transport.discard(3).unwrap();
        assert_eq!(transport.read_u32().unwrap(), 5);
        assert!(transport.discard(1).is_err());
    }

    #[test]
    fn read_frame_unknown_opcode() {
        let mut bytes = PROTOCOL_PREFIX.to_le_bytes().to_vec();
        bytes.push(9);
        let mut transport = transport_over(&bytes);

        assert!(matches!(
            transport.read_frame().unwrap_err(),
            TransportError::UnknownOpcode(9)
        ));
    }
}
