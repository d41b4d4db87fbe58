//! Build artifact handling for the image builder.
//!
//! A rendered [`BuildSpec`] is written to `buildfile-<image>` in the working
//! directory before the runtime build and, under the destroy policy, removed
//! afterwards. Keeping it otherwise leaves a trail for post-mortem debugging.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;

use crate::buildspec::BuildSpec;
use crate::types::ImageName;

/// File name prefix for build artifacts.
pub const ARTIFACT_PREFIX: &str = "buildfile-";

/// Errors raised while materialising a build artifact.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// Raised when the working directory or artifact cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the written artifact is empty, which usually means the
    /// filesystem is full.
    #[error("build artifact {path} was not written, filesystem full?")]
    EmptyArtifact {
        /// Artifact path.
        path: Utf8PathBuf,
    },
}

/// On-disk build specification for a single image build.
#[derive(Debug)]
pub struct BuildArtifact {
    dir: Dir,
    file_name: String,
    path: Utf8PathBuf,
}

impl BuildArtifact {
    /// Renders `spec` into `buildfile-<image>` inside `work_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] when the directory cannot be opened or the
    /// file written, and [`BuildError::EmptyArtifact`] when the written file
    /// has no content. An empty artifact is removed before returning.
    pub fn write(
        work_dir: &Utf8Path,
        image: &ImageName,
        spec: &BuildSpec,
    ) -> Result<Self, BuildError> {
        Self::write_contents(work_dir, image, &spec.render())
    }

    fn write_contents(
        work_dir: &Utf8Path,
        image: &ImageName,
        contents: &str,
    ) -> Result<Self, BuildError> {
        let dir = Dir::open_ambient_dir(work_dir, ambient_authority())
            .map_err(|err| io_error(work_dir, &err))?;
        let file_name = format!("{ARTIFACT_PREFIX}{image}");
        let path = work_dir.join(&file_name);

        dir.write(&file_name, contents)
            .map_err(|err| io_error(&path, &err))?;
        let size = dir
            .metadata(&file_name)
            .map_err(|err| io_error(&path, &err))?
            .len();
        let artifact = Self {
            dir,
            file_name,
            path,
        };
        if size < 1 {
            let leftover = artifact.path.clone();
            if let Err(err) = artifact.remove() {
                debug!(path = %leftover, error = %err, "failed to remove empty build artifact");
            }
            return Err(BuildError::EmptyArtifact { path: leftover });
        }

        debug!(path = %artifact.path, size, "wrote build artifact");
        Ok(artifact)
    }

    /// Path of the artifact on the host.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Deletes the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] when removal fails for a reason other than
    /// the file already being gone.
    pub fn remove(self) -> Result<(), BuildError> {
        match self.dir.remove_file(&self.file_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.path, &err)),
        }
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> BuildError {
    BuildError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
