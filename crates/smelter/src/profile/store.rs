//! Profile store: resolves a profile identifier to a validated profile.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use crate::error::{Result, SmelterError};

use super::ExtractionProfile;

/// Resolves a profile identifier to a validated [`ExtractionProfile`].
pub trait ProfileStore {
    fn load(&self, id: &str) -> Result<ExtractionProfile>;
}

/// Profile store backed by a directory of `<id>.profile.json` files.
pub struct FileProfileStore {
    root: PathBuf,
}

impl FileProfileStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.profile.json"))
    }
}

impl ProfileStore for FileProfileStore {
    fn load(&self, id: &str) -> Result<ExtractionProfile> {
        let path = self.path_for(id);
        let file = File::open(&path).map_err(|source| SmelterError::Io {
            path: path.clone(),
            source,
        })?;

        let profile: ExtractionProfile = serde_json::from_reader(BufReader::new(file))?;
        profile.validate()?;
        Ok(profile)
    }
}
