use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};

const IMAGE_FILE: &str = "image";
const FACE_FILE: &str = "face";

/// Working files belonging to a single connection.
///
/// Each connection gets its own directory so that concurrent requests never
/// write to the same path. The directory is removed on drop.
#[derive(Debug)]
pub struct ScratchSpace {
    dir: PathBuf,
}

impl ScratchSpace {
    pub fn create(root: &Path, connection: u64) -> io::Result<Self> {
        let dir = root.join(format!("connection-{connection}"));
        fs::create_dir_all(&dir)?;
        debug!("scratch space at {dir:?}");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    pub fn face_path(&self) -> PathBuf {
        self.dir.join(FACE_FILE)
    }

    pub fn save_image(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.image_path();
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn save_face(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.face_path();
        fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Reads back whatever the engine left at the image path.
    pub fn load_image(&self) -> io::Result<Vec<u8>> {
        fs::read(self.image_path())
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove scratch space {:?}: {e}", self.dir);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn scratch_spaces_are_private() {
        let temp = TempDir::new("scratch").unwrap();
        let first = ScratchSpace::create(temp.path(), 1).unwrap();
        let second = ScratchSpace::create(temp.path(), 2).unwrap();

        first.save_image(b"one").unwrap();
        second.save_image(b"two").unwrap();

        assert_ne!(first.image_path(), second.image_path());
        assert_eq!(first.load_image().unwrap(), b"one");
        assert_eq!(second.load_image().unwrap(), b"two");
    }

    #[test]
    fn scratch_space_removed_on_drop() {
        let temp = TempDir::new("scratch").unwrap();
        let scratch = ScratchSpace::create(temp.path(), 7).unwrap();
        scratch.save_face(b"face").unwrap();
        let dir = scratch.dir().to_path_buf();

        assert!(dir.join(FACE_FILE).exists());
        drop(scratch);
        assert!(!dir.exists());
    }
}
