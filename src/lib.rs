//! # servicekit
//!
//! Provider abstraction layer for application backends: one trait per
//! capability, interchangeable adapters per backing service, and a factory
//! per capability that resolves a provider name to an adapter.
//!
//! ## Capabilities
//!
//! ```text
//! database    postgresql | supabase | firebase | mongodb
//! auth        jwt | auth0 | firebase | supabase
//! ai          openai | anthropic | google | azure
//! workflow    n8n
//! monitoring  datadog
//! ```
//!
//! Every failure is a [`ServiceError`] carrying a stable [`ErrorKind`], the
//! [`ErrorDomain`] it belongs to, a message and the original backing-service
//! error as its source.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use servicekit::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::from_env()?;
//! let services = Services::from_settings(&settings)?;
//! services.connect().await?;
//!
//! let query = SelectBuilder::new("contacts")
//!     .filter(Filter::contains(["name", "email"], "ann"))
//!     .order_by("created_at", SortDirection::Desc)
//!     .paginate(Pagination::new(1, 20))?;
//! let page = fetch_page(services.database.as_ref(), &query).await?;
//! println!("{} of {} contacts", page.items.len(), page.total);
//!
//! services.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `postgres` (default): the `postgresql` database adapter
//! - `mongodb` (default): the `mongodb` database adapter

pub mod ai;
pub mod auth;
mod config;
pub mod database;
mod error;
mod http;
pub mod monitoring;
mod provider;
mod registry;
mod services;
pub mod workflow;

pub mod prelude;

pub use config::{ProviderConfig, ProviderNames, Settings, SettingsError, DEFAULT_TIMEOUT_MS};
pub use error::{BoxError, Capability, ErrorDomain, ErrorKind, ServiceError, ServiceResult};
pub use http::HttpStatusError;
pub use provider::Provider;
pub use registry::{Constructor, ProviderTable, ProviderTableBuilder};
pub use services::{Factories, Services};

// Re-export async-trait for adapters implemented outside the crate
pub use async_trait::async_trait;
