//! Provider trait shared by every adapter.
//!
//! The `Provider` trait is the base contract of all capability adapters. Each
//! capability trait (`DatabaseProvider`, `AuthProvider`, ...) extends it, so a
//! factory can report which adapter it resolved and which operations that
//! adapter rejects up front.

use std::fmt::Debug;

use crate::error::{Capability, ServiceError};

/// Base trait for all adapters.
///
/// # Example
///
/// ```rust
/// use servicekit::{Capability, Provider};
///
/// #[derive(Debug)]
/// struct EchoProvider;
///
/// impl Provider for EchoProvider {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     fn capability(&self) -> Capability {
///         Capability::Ai
///     }
///
///     fn unsupported_operations(&self) -> &[&'static str] {
///         &["generate_image"]
///     }
/// }
///
/// let provider = EchoProvider;
/// assert!(provider.supports("chat_completion"));
/// assert!(!provider.supports("generate_image"));
/// ```
pub trait Provider: Send + Sync + Debug {
    /// Returns the provider name this adapter is registered under.
    fn name(&self) -> &str;

    /// Returns the capability this adapter implements.
    fn capability(&self) -> Capability;

    /// Operations of the capability contract this adapter rejects with
    /// `UnsupportedOperation` without calling the backing service.
    fn unsupported_operations(&self) -> &[&'static str] {
        &[]
    }

    /// Check if this adapter can perform the named operation.
    fn supports(&self, operation: &str) -> bool {
        !self.unsupported_operations().contains(&operation)
    }

    /// Build the fail-fast error for an unsupported operation.
    fn unsupported(&self, operation: &str) -> ServiceError {
        tracing::debug!(
            provider = self.name(),
            capability = %self.capability(),
            operation,
            "rejecting unsupported operation"
        );
        ServiceError::unsupported(self.capability().domain(), self.name(), operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorDomain, ErrorKind};

    #[derive(Debug, Clone)]
    struct TestProvider {
        name: String,
    }

    impl Provider for TestProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn capability(&self) -> Capability {
            Capability::Database
        }

        fn unsupported_operations(&self) -> &[&'static str] {
            &["query"]
        }
    }

    #[test]
    fn test_provider_name() {
        let provider = TestProvider {
            name: "mongodb".to_string(),
        };
        assert_eq!(provider.name(), "mongodb");
        assert_eq!(provider.capability(), Capability::Database);
    }

    #[test]
    fn test_provider_supports() {
        let provider = TestProvider {
            name: "mongodb".to_string(),
        };
        assert!(!provider.supports("query"));
        assert!(provider.supports("health_check"));
    }

    #[test]
    fn test_unsupported_error() {
        let provider = TestProvider {
            name: "mongodb".to_string(),
        };
        let err = provider.unsupported("query");
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(err.domain(), ErrorDomain::Database);
        assert!(err.message().contains("mongodb"));
    }

    #[test]
    fn test_default_supports_everything() {
        #[derive(Debug)]
        struct Complete;

        impl Provider for Complete {
            fn name(&self) -> &str {
                "complete"
            }

            fn capability(&self) -> Capability {
                Capability::Monitoring
            }
        }

        assert!(Complete.unsupported_operations().is_empty());
        assert!(Complete.supports("send_event"));
    }
}
