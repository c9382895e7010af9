//! Wiring of the event-sourcing backbone.
//!
//! [`Config`] selects a storage profile and the dispatch settings,
//! [`Backbone::build`] assembles the components, and the `backbone` binary
//! runs them with structured logging and Prometheus metrics.

pub mod account;
pub mod backbone;
pub mod config;
pub mod error;
pub mod welcome;

pub use account::{account_validation, register_account_handlers};
pub use backbone::Backbone;
pub use config::{Config, ConfigError, InterceptorKind, Profile};
pub use error::BackboneError;
pub use welcome::{WelcomeBonus, WelcomeBonusState};
