//! Prelude module for convenient imports.
//!
//! Re-exports the capability traits, their value types, the factories and
//! the error taxonomy for glob imports.
//!
//! # Example
//!
//! ```rust
//! use servicekit::prelude::*;
//!
//! let factory = DatabaseServiceFactory::new();
//! assert!(factory.providers().contains(&"supabase"));
//! ```

// Configuration and startup
pub use crate::config::{ProviderConfig, ProviderNames, Settings, SettingsError};
pub use crate::services::{Factories, Services};

// Core traits
pub use crate::provider::Provider;
pub use crate::registry::{ProviderTable, ProviderTableBuilder};

// Errors
pub use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceError, ServiceResult};

// Database
pub use crate::database::{
    fetch_page, ConnectionState, DatabaseConfig, DatabaseProvider, DatabaseProviderExt,
    DatabaseServiceFactory, Filter, InsertBuilder, Page, PagedQuery, Pagination, Row,
    SelectBuilder, SortDirection, SqlValue, Statement, Transaction, TxFuture, UpdateBuilder,
};

// Auth
pub use crate::auth::{
    AuthConfig, AuthCredentials, AuthProvider, AuthResult, AuthServiceFactory, CredentialStore,
    TokenValidation, User,
};

// AI
pub use crate::ai::{
    AiConfig, AiProvider, AiServiceFactory, ChatMessage, ChatOptions, ChatResponse, ChatRole,
    EmbeddingOptions, EmbeddingResponse, ImageOptions, ImageResponse, TextOptions, TextResponse,
    TokenUsage,
};

// Workflow
pub use crate::workflow::{
    Workflow, WorkflowConfig, WorkflowProvider, WorkflowResult, WorkflowServiceFactory,
    WorkflowStatus, WorkflowStep,
};

// Monitoring
pub use crate::monitoring::{MonitoringConfig, MonitoringProvider, MonitoringServiceFactory, Tags};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
