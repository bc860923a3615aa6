//! Error types for Servicekit.
//!
//! Every adapter normalizes backing-service failures into a [`ServiceError`]
//! before returning. Callers branch on [`ServiceError::kind`] and never on the
//! shape of the retained cause.

use std::fmt;

use thiserror::Error;

/// Boxed error retained as the cause of a [`ServiceError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The capability an adapter or factory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Identity and token handling
    Auth,
    /// Relational and document storage
    Database,
    /// Generative AI
    Ai,
    /// Workflow orchestration
    Workflow,
    /// Metrics, logs and events
    Monitoring,
}

impl Capability {
    /// The error domain failures of this capability are reported under.
    pub fn domain(&self) -> ErrorDomain {
        match self {
            Capability::Auth => ErrorDomain::Authentication,
            Capability::Database => ErrorDomain::Database,
            Capability::Ai => ErrorDomain::Ai,
            Capability::Workflow => ErrorDomain::Workflow,
            Capability::Monitoring => ErrorDomain::Monitoring,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Auth => "auth",
            Capability::Database => "database",
            Capability::Ai => "ai",
            Capability::Workflow => "workflow",
            Capability::Monitoring => "monitoring",
        };
        f.write_str(name)
    }
}

/// Domain error family a [`ServiceError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    Authentication,
    Authorization,
    Database,
    Ai,
    Workflow,
    Monitoring,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorDomain::Authentication => "Authentication",
            ErrorDomain::Authorization => "Authorization",
            ErrorDomain::Database => "Database",
            ErrorDomain::Ai => "AI",
            ErrorDomain::Workflow => "Workflow",
            ErrorDomain::Monitoring => "Monitoring",
        };
        f.write_str(name)
    }
}

/// The stable set of failure kinds callers may branch on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A factory was asked for a provider name it has no adapter for
    #[error("unknown provider")]
    UnknownProvider,

    /// Operation attempted before `connect()` or outside an active session
    #[error("not connected")]
    NotConnected,

    /// The operation has no meaning for this provider
    #[error("unsupported operation")]
    UnsupportedOperation,

    /// Credential or token rejected by the identity provider
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Backing store rejected a query or transaction
    #[error("query failed")]
    QueryFailed,

    /// Generic backing-service failure
    #[error("provider call failed")]
    ProviderCallFailed,

    /// Adapter configuration rejected at construction
    #[error("invalid configuration")]
    InvalidConfiguration,
}

/// Normalized error returned by every capability operation.
#[derive(Error, Debug)]
#[error("{domain} error ({kind}): {message}")]
pub struct ServiceError {
    domain: ErrorDomain,
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<BoxError>,
}

impl ServiceError {
    /// Create an error without a cause.
    pub fn new(domain: ErrorDomain, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            domain,
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the original backing-service error.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// The factory for `capability` has no adapter registered as `name`.
    pub fn unknown_provider(capability: Capability, name: &str) -> Self {
        Self::new(
            capability.domain(),
            ErrorKind::UnknownProvider,
            format!("Unknown {} provider: {}", capability, name),
        )
    }

    /// The adapter has not been connected (or was disconnected).
    pub fn not_connected(domain: ErrorDomain, provider: &str) -> Self {
        Self::new(
            domain,
            ErrorKind::NotConnected,
            format!("{} is not connected", provider),
        )
    }

    /// `provider` cannot perform `operation`.
    pub fn unsupported(domain: ErrorDomain, provider: &str, operation: &str) -> Self {
        Self::new(
            domain,
            ErrorKind::UnsupportedOperation,
            format!("{} does not support {}", provider, operation),
        )
    }

    /// A configuration key is missing or out of range.
    pub fn invalid_config(domain: ErrorDomain, message: impl Into<String>) -> Self {
        Self::new(domain, ErrorKind::InvalidConfiguration, message)
    }

    /// The backing store rejected a statement.
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Database, ErrorKind::QueryFailed, message)
    }

    /// The identity provider rejected a credential or token.
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(
            ErrorDomain::Authentication,
            ErrorKind::AuthenticationFailed,
            message,
        )
    }

    /// An authenticated principal lacks a required role or permission.
    pub fn authorization_denied(message: impl Into<String>) -> Self {
        Self::new(
            ErrorDomain::Authorization,
            ErrorKind::AuthenticationFailed,
            message,
        )
    }

    /// Generic backing-service failure.
    pub fn provider_call(domain: ErrorDomain, message: impl Into<String>) -> Self {
        Self::new(domain, ErrorKind::ProviderCallFailed, message)
    }

    /// The failure kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The domain error family.
    pub fn domain(&self) -> ErrorDomain {
        self.domain
    }

    /// Human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The original backing-service error, kept for diagnostics only.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Whether this error carries the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

/// Result type alias for capability operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("socket closed")]
    struct SocketClosed;

    #[test]
    fn test_unknown_provider_names_capability_and_provider() {
        let err = ServiceError::unknown_provider(Capability::Database, "oracle");
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
        assert_eq!(err.domain(), ErrorDomain::Database);
        assert!(err.message().contains("database"));
        assert!(err.message().contains("oracle"));
        assert!(err.cause().is_none());
    }

    #[test]
    fn test_cause_is_exposed_as_source() {
        use std::error::Error as _;

        let err = ServiceError::query_failed("Query failed").with_cause(SocketClosed);
        assert_eq!(err.kind(), ErrorKind::QueryFailed);
        assert_eq!(err.source().map(|s| s.to_string()), Some("socket closed".to_string()));
    }

    #[test]
    fn test_display_includes_domain_kind_and_message() {
        let err = ServiceError::unsupported(ErrorDomain::Ai, "anthropic", "generate_image");
        let msg = err.to_string();
        assert!(msg.starts_with("AI error (unsupported operation)"));
        assert!(msg.contains("anthropic does not support generate_image"));
    }

    #[test]
    fn test_authorization_denied_uses_authorization_domain() {
        let err = ServiceError::authorization_denied("missing role admin");
        assert_eq!(err.domain(), ErrorDomain::Authorization);
        assert!(err.is(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_capability_domains() {
        assert_eq!(Capability::Auth.domain(), ErrorDomain::Authentication);
        assert_eq!(Capability::Monitoring.domain(), ErrorDomain::Monitoring);
        assert_eq!(Capability::Ai.to_string(), "ai");
    }
}
