//! Connection gateway.
//!
//! Admission happens once per connection: the token is verified, the
//! resource is checked, the grant is looked up and collapsed into a role.
//! Nothing is re-evaluated afterwards; revoking access means forcing the
//! connection to reconnect.

use crate::auth::{AuthError, TokenVerifier};
use crate::connection::{Connection, ResourceId};
use crate::directory::{AccessDirectory, DirectoryError};
use crate::room::validate_resource_id;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Handshake rejection. Always terminal for the attempt.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Token missing, invalid, or expired.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    /// The user holds no grant on the resource.
    #[error("access denied to resource {0}")]
    AccessDenied(ResourceId),

    /// The access directory could not be consulted.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl AdmissionError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Auth(_) => "auth",
            AdmissionError::NotFound(_) => "not_found",
            AdmissionError::AccessDenied(_) => "access_denied",
            AdmissionError::Directory(_) => "directory",
        }
    }
}

/// Authenticates and authorizes new connections.
#[derive(Clone)]
pub struct Gateway {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn AccessDirectory>,
}

impl Gateway {
    /// Create a gateway over a token verifier and an access directory.
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>, directory: Arc<dyn AccessDirectory>) -> Self {
        Self {
            verifier,
            directory,
        }
    }

    /// Admit a connection to `resource_id`.
    ///
    /// # Errors
    ///
    /// Checks run in order and the first failure is returned: token
    /// ([`AdmissionError::Auth`]), resource ([`AdmissionError::NotFound`]),
    /// grant ([`AdmissionError::AccessDenied`]).
    pub async fn admit(
        &self,
        resource_id: &str,
        token: Option<&str>,
    ) -> Result<Connection, AdmissionError> {
        let result = self.try_admit(resource_id, token).await;
        match &result {
            Ok(conn) => info!(
                resource = %resource_id,
                connection = %conn.id,
                user = %conn.user_id,
                role = %conn.role,
                "Admitted connection"
            ),
            Err(e) => warn!(resource = %resource_id, reason = e.reason(), error = %e, "Rejected handshake"),
        }
        result
    }

    async fn try_admit(
        &self,
        resource_id: &str,
        token: Option<&str>,
    ) -> Result<Connection, AdmissionError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::MissingToken)?;
        let identity = self.verifier.verify(token).await?;

        if validate_resource_id(resource_id).is_err()
            || !self.directory.resource_exists(resource_id).await?
        {
            return Err(AdmissionError::NotFound(resource_id.to_string()));
        }

        let grant = self
            .directory
            .grant_for(&identity.user_id, resource_id)
            .await?
            .ok_or_else(|| AdmissionError::AccessDenied(resource_id.to_string()))?;

        Ok(Connection::new(
            resource_id,
            identity.user_id,
            grant.connection_role(),
        ))
    }
}
