//! Node-set data contract consumed from the harness configuration loader.
//!
//! A [`NodeSpec`] names one fixture node and binds it to a prefab base image
//! plus customisation commits and read-only shared directories. The loader
//! that parses node-set files lives outside this crate; it either builds
//! specs with [`NodeSpecBuilder`] or deserialises them with `serde`.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::Deserialize;
use thiserror::Error;

/// Provider-specific prefab data for the container provider.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct PrefabSpecifics {
    /// Base image reference (for example `ubuntu:12.10`).
    #[serde(default)]
    pub base_image: Option<String>,
}

/// Named group of shell fragments rendered as a single image layer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Commit {
    /// Label used in logs; not rendered into the build specification.
    pub name: String,
    /// Shell fragments joined with `&&`, in the order supplied.
    pub commands: Vec<String>,
}

impl Commit {
    /// Creates a commit from a label and its ordered commands.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        commands: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }
}

/// Host directory mounted read-only into the container.
///
/// Nested host paths (a parent and one of its children both mounted) can make
/// the runtime refuse to start the container; no attempt is made to merge
/// them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SharedDirectory {
    /// Path on the host; relative paths resolve against the process cwd.
    pub source: Utf8PathBuf,
    /// Mount point inside the container.
    pub destination: Utf8PathBuf,
}

/// Immutable description of one fixture node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct NodeSpec {
    /// Node name, also used as the container hostname.
    pub name: String,
    /// Prefab data for this provider; absence is a configuration defect.
    #[serde(default)]
    pub prefab: Option<PrefabSpecifics>,
    /// Ordered customisation commits layered on top of the base image.
    #[serde(default)]
    pub commits: Vec<Commit>,
    /// Read-only bind mounts.
    #[serde(default)]
    pub shared_directories: Vec<SharedDirectory>,
    /// Options owned by other providers, carried through untouched.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl NodeSpec {
    /// Starts a builder for a [`NodeSpec`].
    #[must_use]
    pub fn builder(name: impl Into<String>) -> NodeSpecBuilder {
        NodeSpecBuilder::new(name)
    }

    /// Returns the base image, rejecting specs without prefab data or with an
    /// empty base image.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::MissingPrefab`] or [`NodeError::MissingBaseImage`].
    pub fn base_image(&self) -> Result<&str, NodeError> {
        let prefab = self.prefab.as_ref().ok_or_else(|| NodeError::MissingPrefab {
            node: self.name.clone(),
        })?;
        match prefab.base_image.as_deref().map(str::trim) {
            Some(image) if !image.is_empty() => Ok(image),
            _ => Err(NodeError::MissingBaseImage {
                node: self.name.clone(),
            }),
        }
    }

    /// Validates the spec as a whole.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] when the name is blank, prefab data is absent, or
    /// the base image is unspecified.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.name.trim().is_empty() {
            return Err(NodeError::EmptyName);
        }
        self.base_image().map(|_| ())
    }
}

/// Builder for [`NodeSpec`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeSpecBuilder {
    name: String,
    base_image: Option<String>,
    has_prefab: bool,
    commits: Vec<Commit>,
    shared_directories: Vec<SharedDirectory>,
    options: BTreeMap<String, String>,
}

impl NodeSpecBuilder {
    /// Creates a builder for the named node without prefab data.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the prefab base image.
    #[must_use]
    pub fn base_image(mut self, value: impl Into<String>) -> Self {
        self.base_image = Some(value.into());
        self.has_prefab = true;
        self
    }

    /// Marks prefab data as present without a base image.
    #[must_use]
    pub const fn empty_prefab(mut self) -> Self {
        self.has_prefab = true;
        self
    }

    /// Appends a customisation commit.
    #[must_use]
    pub fn commit(mut self, commit: Commit) -> Self {
        self.commits.push(commit);
        self
    }

    /// Appends a read-only shared directory.
    #[must_use]
    pub fn shared_directory(
        mut self,
        source: impl Into<Utf8PathBuf>,
        destination: impl Into<Utf8PathBuf>,
    ) -> Self {
        self.shared_directories.push(SharedDirectory {
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    /// Records an opaque option for another provider.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Builds the spec, trimming the node name. Validation is deferred to
    /// launch so that defects surface as lifecycle errors.
    #[must_use]
    pub fn build(self) -> NodeSpec {
        let prefab = self.has_prefab.then(|| PrefabSpecifics {
            base_image: self.base_image.map(|image| image.trim().to_owned()),
        });
        NodeSpec {
            name: self.name.trim().to_owned(),
            prefab,
            commits: self.commits,
            shared_directories: self.shared_directories,
            options: self.options,
        }
    }
}

/// Configuration defects detected in a [`NodeSpec`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NodeError {
    /// Raised when a node has no name.
    #[error("node name must not be empty")]
    EmptyName,
    /// Raised when the prefab carries no data for this provider.
    #[error("no provider specifics for the prefab of node {node}")]
    MissingPrefab {
        /// Node name.
        node: String,
    },
    /// Raised when the prefab does not name a base image.
    #[error("no base image specified for the prefab of node {node}")]
    MissingBaseImage {
        /// Node name.
        node: String,
    },
    /// Raised when the same node name appears twice in one launch.
    #[error("node {node} appears more than once in the node set")]
    Duplicate {
        /// Node name.
        node: String,
    },
}
