//! Access grants.
//!
//! The access directory answers two questions at handshake: does the
//! resource exist, and what grant does the user hold on it.

use crate::connection::ResourceId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tessera_protocol::Role;
use thiserror::Error;

/// Grant a user holds on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRole {
    Owner,
    Editor,
    Viewer,
}

impl AccessRole {
    /// Collapse the grant into a connection role.
    #[must_use]
    pub fn connection_role(&self) -> Role {
        match self {
            AccessRole::Owner | AccessRole::Editor => Role::Controller,
            AccessRole::Viewer => Role::Viewer,
        }
    }
}

/// The directory could not answer.
#[derive(Debug, Error)]
#[error("access directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// Looks up resources and grants.
#[async_trait]
pub trait AccessDirectory: Send + Sync {
    /// Check whether a resource exists.
    async fn resource_exists(&self, resource_id: &str) -> Result<bool, DirectoryError>;

    /// Get the grant `user_id` holds on `resource_id`, if any.
    async fn grant_for(
        &self,
        user_id: &str,
        resource_id: &str,
    ) -> Result<Option<AccessRole>, DirectoryError>;
}

/// Directory held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    resources: DashMap<ResourceId, HashMap<String, AccessRole>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource with no grants.
    pub fn add_resource(&self, resource_id: impl Into<ResourceId>) {
        self.resources.entry(resource_id.into()).or_default();
    }

    /// Grant `user_id` a role on a resource, registering the resource if
    /// needed.
    pub fn grant(&self, resource_id: impl Into<ResourceId>, user_id: impl Into<String>, role: AccessRole) {
        self.resources
            .entry(resource_id.into())
            .or_default()
            .insert(user_id.into(), role);
    }

    /// Revoke a user's grant. Open connections keep the role they were
    /// admitted with until they reconnect.
    pub fn revoke(&self, resource_id: &str, user_id: &str) -> Option<AccessRole> {
        self.resources
            .get_mut(resource_id)
            .and_then(|mut grants| grants.remove(user_id))
    }

    /// Remove a resource and all its grants.
    pub fn remove_resource(&self, resource_id: &str) -> bool {
        self.resources.remove(resource_id).is_some()
    }
}

#[async_trait]
impl AccessDirectory for InMemoryDirectory {
    async fn resource_exists(&self, resource_id: &str) -> Result<bool, DirectoryError> {
        Ok(self.resources.contains_key(resource_id))
    }

    async fn grant_for(
        &self,
        user_id: &str,
        resource_id: &str,
    ) -> Result<Option<AccessRole>, DirectoryError> {
        Ok(self
            .resources
            .get(resource_id)
            .and_then(|grants| grants.get(user_id).copied()))
    }
}
