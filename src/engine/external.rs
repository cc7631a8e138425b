use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use log::{debug, warn};

use super::{EngineOutcome, ImageEngine};

/// Exit status an engine program uses to report an image without faces.
pub const NO_FACES_STATUS: i32 = 2;

/// Runs an external program for every job.
///
/// The program is invoked as `<program> [args...] detect <image>` or
/// `<program> [args...] replace <image> <face>`. Exit status 0 means success,
/// [`NO_FACES_STATUS`] means no faces, anything else is an invalid image.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExternalEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn run(&self, operation: &str, files: &[&Path]) -> EngineOutcome {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(operation)
            .args(files)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status();

        match status {
            Ok(status) => {
                debug!("engine {operation} exited with {status}");
                match status.code() {
                    Some(0) => EngineOutcome::Success,
                    Some(NO_FACES_STATUS) => EngineOutcome::NoFaces,
                    _ => EngineOutcome::InvalidImage,
                }
            }
            Err(e) => {
                warn!("failed to run engine {:?}: {e}", self.program);
                EngineOutcome::InvalidImage
            }
        }
    }
}

impl ImageEngine for ExternalEngine {
    fn detect(&mut self, image: &Path) -> EngineOutcome {
        self.run("detect", &[image])
    }

    fn replace(&mut self, image: &Path, face: &Path) -> EngineOutcome {
        self.run("replace", &[image, face])
    }
}
