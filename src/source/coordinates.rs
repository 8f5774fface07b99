use std::fmt;

use sha2::{Digest, Sha256};

/// Identifies a piece of content independently of how it was found: the path where it really
/// lives plus the filesystem (image layer digest) it lives in.  The filesystem id is empty for
/// directory and file sources.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinates {
    pub real_path: String,
    pub file_system_id: String,
}

impl Coordinates {
    pub fn new(real_path: impl Into<String>, file_system_id: impl Into<String>) -> Self {
        Coordinates {
            real_path: real_path.into(),
            file_system_id: file_system_id.into(),
        }
    }

    /// A stable, content-addressed identifier for use as a map or graph key.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.real_path.as_bytes());
        hasher.update([0]);
        hasher.update(self.file_system_id.as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RealPath={:?}", self.real_path)?;
        if !self.file_system_id.is_empty() {
            write!(f, " Layer={:?}", self.file_system_id)?;
        }
        Ok(())
    }
}
