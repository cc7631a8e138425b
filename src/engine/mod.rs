//! Image-analysis engine boundary.
//!
//! The server never looks at pixels itself. Every job is handed to an
//! [`ImageEngine`], which works on files saved in the connection's
//! [`ScratchSpace`] and reports one of three [`EngineOutcome`]s. On success
//! the engine leaves its output in place of the input image.
//!
//! Engines are assumed not to be reentrant: the server only ever calls one
//! through [`SharedState::run_engine`](crate::protocol::SharedState::run_engine),
//! which holds the global lock for the duration of the call.
//!
//! # Key Components
//!
//! - [`ImageEngine`]: The detect/replace contract.
//! - [`ExternalEngine`]: Runs a separate program for every job.
//! - [`ScratchSpace`]: Private per-connection working files.
use std::path::Path;

mod external;
mod scratch;

pub use external::ExternalEngine;
pub use scratch::ScratchSpace;

/// Result of one engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Output was written over the input image.
    Success,
    /// The input could not be decoded as an image.
    InvalidImage,
    /// The image decoded but no face was found in it.
    NoFaces,
}

pub trait ImageEngine: Send {
    /// Marks the faces found in the image at `image`.
    fn detect(&mut self, image: &Path) -> EngineOutcome;

    /// Pastes the image at `face` over every face found in the image at `image`.
    fn replace(&mut self, image: &Path, face: &Path) -> EngineOutcome;
}
