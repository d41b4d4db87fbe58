//! Per-run registry of provisioned nodes.
//!
//! The registry is an explicit context object: launch inserts one entry per
//! node, connect attaches SSH sessions, and teardown drains it. The harness
//! reads it to discover connection details but cannot mutate it; mutation is
//! reserved for the lifecycle.

use std::collections::BTreeMap;

use crate::ssh::SshSession;
use crate::types::{ContainerId, ImageName};

/// Resources provisioned for one node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistryEntry {
    id: ContainerId,
    image: ImageName,
    session: Option<SshSession>,
}

impl RegistryEntry {
    pub(crate) const fn new(id: ContainerId, image: ImageName) -> Self {
        Self {
            id,
            image,
            session: None,
        }
    }

    /// Runtime-assigned container id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Image built for the node.
    #[must_use]
    pub const fn image(&self) -> &ImageName {
        &self.image
    }

    /// SSH session attached by connect, if any.
    #[must_use]
    pub const fn session(&self) -> Option<&SshSession> {
        self.session.as_ref()
    }

    pub(crate) const fn session_mut(&mut self) -> Option<&mut SshSession> {
        self.session.as_mut()
    }

    pub(crate) fn attach_session(&mut self, session: SshSession) {
        self.session = Some(session);
    }

    /// Returns `true` when an open session is attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|session| !session.is_closed())
    }
}

/// Node name to provisioned resources, for one test-harness invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no node is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` when `node` is registered.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.entries.contains_key(node)
    }

    /// Entry for `node`, if registered.
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&RegistryEntry> {
        self.entries.get(node)
    }

    /// Entries in node-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Registered node names in order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn insert(&mut self, node: impl Into<String>, entry: RegistryEntry) {
        self.entries.insert(node.into(), entry);
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut RegistryEntry)> {
        self.entries
            .iter_mut()
            .map(|(name, entry)| (name.as_str(), entry))
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, RegistryEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}
