use thiserror::Error;

use super::{
    OpCode,
    transport::{Frame, TransportError},
};

/// Exactly one of these is sent back for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Image(Vec<u8>),
    Error(String),
}

impl Response {
    pub fn opcode(&self) -> OpCode {
        match self {
            Response::Image(_) => OpCode::OutputImage,
            Response::Error(_) => OpCode::ErrorMessage,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Image(bytes) => bytes,
            Response::Error(message) => message.as_bytes(),
        }
    }
}

impl From<ProtocolError> for Response {
    fn from(value: ProtocolError) -> Self {
        Response::Error(value.to_string())
    }
}

impl TryFrom<Frame> for Response {
    type Error = TransportError;

    fn try_from(frame: Frame) -> Result<Self, TransportError> {
        let Frame {
            opcode,
            mut segments,
        } = frame;
        let payload = segments.pop().unwrap_or_default();

        match opcode {
            OpCode::OutputImage => Ok(Response::Image(payload)),
            OpCode::ErrorMessage => Ok(Response::Error(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            other => Err(TransportError::UnexpectedOpcode(other)),
        }
    }
}

/// Problems reported to the peer as an error-message frame. None of these
/// close the connection.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid operation type")]
    InvalidOperation,
    #[error("image is 0 bytes")]
    EmptyImage,
    #[error("image too large")]
    ImageTooLarge,
    #[error("invalid image")]
    InvalidImage,
    #[error("no faces detected in image")]
    NoFaces,
    #[error("invalid message")]
    InvalidMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_messages() {
        let inputs = vec![
            (ProtocolError::InvalidOperation, "invalid operation type"),
            (ProtocolError::EmptyImage, "image is 0 bytes"),
            (ProtocolError::ImageTooLarge, "image too large"),
            (ProtocolError::InvalidImage, "invalid image"),
            (ProtocolError::NoFaces, "no faces detected in image"),
        ];

        for (error, expected) in inputs {
            let response: Response = error.into();
            assert_eq!(response, Response::Error(expected.to_string()));
            assert_eq!(response.opcode(), OpCode::ErrorMessage);
        }
    }

    #[test]
    fn response_from_output_frame() {
        let frame = Frame {
            opcode: OpCode::OutputImage,
            segments: vec![vec![1, 2, 3]],
        };

        assert_eq!(
            Response::try_from(frame).unwrap(),
            Response::Image(vec![1, 2, 3])
        );
    }

    #[test]
    #[should_panic(expected = "UnexpectedOpcode(Detect)")]
    fn response_from_request_frame() {
        let frame = Frame {
            opcode: OpCode::Detect,
            segments: vec![vec![1]],
        };

        Response::try_from(frame).unwrap();
    }
}
