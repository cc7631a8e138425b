use std::fmt;

use super::transport::TransportError;

/// Single-byte tag identifying the kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Detect = 0,
    Replace = 1,
    OutputImage = 2,
    ErrorMessage = 3,
}

impl OpCode {
    /// Number of (length, payload) segments that follow the opcode.
    pub fn segments(self) -> usize {
        match self {
            OpCode::Replace => 2,
            OpCode::Detect | OpCode::OutputImage | OpCode::ErrorMessage => 1,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, OpCode::Detect | OpCode::Replace)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OpCode::Detect),
            1 => Ok(OpCode::Replace),
            2 => Ok(OpCode::OutputImage),
            3 => Ok(OpCode::ErrorMessage),
            other => Err(TransportError::UnknownOpcode(other)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        value as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Detect => "detect",
            OpCode::Replace => "replace",
            OpCode::OutputImage => "output image",
            OpCode::ErrorMessage => "error message",
        };
        f.write_str(name)
    }
}

/// A job sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Mark every face found in `image`.
    Detect { image: Vec<u8> },
    /// Paste `face` over every face found in `image`.
    Replace { image: Vec<u8>, face: Vec<u8> },
}

impl Request {
    /// Builds a replace request when a replacement image is present, a detect
    /// request otherwise.
    pub fn new(image: Vec<u8>, face: Option<Vec<u8>>) -> Self {
        match face {
            Some(face) => Request::Replace { image, face },
            None => Request::Detect { image },
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Detect { .. } => OpCode::Detect,
            Request::Replace { .. } => OpCode::Replace,
        }
    }

    pub fn segments(&self) -> Vec<&[u8]> {
        match self {
            Request::Detect { image } => vec![image],
            Request::Replace { image, face } => vec![image, face],
        }
    }
}
