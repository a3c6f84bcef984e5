//! Ingress controller core library: configuration, desired-state cache, events.
//!
//! - [`config`]: immutable [`ControllerConfig`] resolved once at startup
//! - [`types`]: ingress / secret / namespace model with change status
//! - [`cache`]: [`DesiredState`], the namespace-scoped desired-state cache
//! - [`event`]: [`SyncEvent`], what the resource source feeds the event loop
//! - [`error`]: [`ConfigError`]

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use cache::DesiredState;
pub use config::{ConfigFile, ControllerConfig, ProxyPaths};
pub use error::ConfigError;
pub use event::SyncEvent;
pub use types::{
    GlobalSettings, Ingress, IngressPath, IngressRule, IngressTls, Namespace, PublishService, Secret, ServiceRef,
    Status,
};
