//! Startup bundle of resolved adapters.
//!
//! Resolve every capability once from [`Settings`] and share the handles;
//! request handlers never call factories themselves.

use std::fmt;
use std::sync::Arc;

use crate::ai::{AiProvider, AiServiceFactory};
use crate::auth::{AuthProvider, AuthServiceFactory};
use crate::config::Settings;
use crate::database::{DatabaseProvider, DatabaseServiceFactory};
use crate::error::ServiceResult;
use crate::monitoring::{MonitoringProvider, MonitoringServiceFactory};
use crate::workflow::{WorkflowProvider, WorkflowServiceFactory};

/// One factory per capability.
#[derive(Debug, Default)]
pub struct Factories {
    pub database: DatabaseServiceFactory,
    pub auth: AuthServiceFactory,
    pub ai: AiServiceFactory,
    pub workflow: WorkflowServiceFactory,
    pub monitoring: MonitoringServiceFactory,
}

/// The active adapter of every capability.
#[derive(Clone)]
pub struct Services {
    pub database: Arc<dyn DatabaseProvider>,
    pub auth: Arc<dyn AuthProvider>,
    pub ai: Arc<dyn AiProvider>,
    pub workflow: Arc<dyn WorkflowProvider>,
    pub monitoring: Arc<dyn MonitoringProvider>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("database", &self.database.name())
            .field("auth", &self.auth.name())
            .field("ai", &self.ai.name())
            .field("workflow", &self.workflow.name())
            .field("monitoring", &self.monitoring.name())
            .finish()
    }
}

impl Services {
    /// Resolve every capability through the built-in factories.
    pub fn from_settings(settings: &Settings) -> ServiceResult<Self> {
        Self::resolve(settings, &Factories::default())
    }

    /// Resolve every capability through `factories`. Fails on the first
    /// unknown provider name or rejected configuration.
    pub fn resolve(settings: &Settings, factories: &Factories) -> ServiceResult<Self> {
        let names = &settings.providers;
        let services = Self {
            database: factories
                .database
                .create_service(&names.database, &settings.database)?,
            auth: factories.auth.create_service(&names.auth, &settings.auth)?,
            ai: factories.ai.create_service(&names.ai, &settings.ai)?,
            workflow: factories
                .workflow
                .create_service(&names.workflow, &settings.workflow)?,
            monitoring: factories
                .monitoring
                .create_service(&names.monitoring, &settings.monitoring)?,
        };
        tracing::info!(
            database = %names.database,
            auth = %names.auth,
            ai = %names.ai,
            workflow = %names.workflow,
            monitoring = %names.monitoring,
            "services resolved"
        );
        Ok(services)
    }

    /// Connect the database adapter.
    pub async fn connect(&self) -> ServiceResult<()> {
        self.database.connect().await
    }

    /// Disconnect the database adapter. Safe to call more than once.
    pub async fn shutdown(&self) -> ServiceResult<()> {
        self.database.disconnect().await
    }
}
