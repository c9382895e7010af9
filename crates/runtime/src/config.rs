//! Backbone configuration loaded from environment variables.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use command_bus::GatewayConfig;
use thiserror::Error;

/// Storage profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    /// Log-file event store and in-memory saga repository.
    Embedded { events_dir: PathBuf },

    /// PostgreSQL document event store and saga repository.
    DocumentStore { database_url: String },
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Embedded { .. } => f.write_str("embedded"),
            Profile::DocumentStore { .. } => f.write_str("document-store"),
        }
    }
}

/// Interceptors that can be installed in front of the command bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptorKind {
    Validation,
    Correlation,
    Logging,
}

impl FromStr for InterceptorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(InterceptorKind::Validation),
            "correlation" => Ok(InterceptorKind::Correlation),
            "logging" => Ok(InterceptorKind::Logging),
            other => Err(format!("unknown interceptor `{other}`")),
        }
    }
}

/// Errors raised while reading the configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required for the {profile} profile")]
    Missing {
        var: &'static str,
        profile: &'static str,
    },

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Backbone configuration.
///
/// Reads from environment variables:
/// - `BACKBONE_PROFILE`: `embedded` (default) or `document-store`
/// - `BACKBONE_EVENTS_DIR`: log directory of the embedded profile (default: `./target/events`)
/// - `BACKBONE_DATABASE_URL`: PostgreSQL URL, required by `document-store`
/// - `BACKBONE_WORKERS`: gateway workers (default: `4`)
/// - `BACKBONE_QUEUE_CAPACITY`: per-worker queue capacity (default: `256`)
/// - `BACKBONE_SNAPSHOT_EVERY`: events between snapshots, `0` disables (default: `100`)
/// - `BACKBONE_INTERCEPTORS`: comma list of `validation,correlation,logging` (default: all)
/// - `BACKBONE_METRICS_ADDR`: Prometheus listener (default: `0.0.0.0:9000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
///
/// Absent variables fall back to their defaults; malformed ones are errors.
/// Validation is always installed, first, even when the list omits it.
#[derive(Debug, Clone)]
pub struct Config {
    pub profile: Profile,
    pub interceptors: Vec<InterceptorKind>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub snapshot_every: u64,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::Embedded {
                events_dir: PathBuf::from("./target/events"),
            },
            interceptors: vec![
                InterceptorKind::Validation,
                InterceptorKind::Correlation,
                InterceptorKind::Logging,
            ],
            workers: 4,
            queue_capacity: 256,
            snapshot_every: 100,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Embedded configuration over `events_dir` with default settings.
    pub fn embedded(events_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile: Profile::Embedded {
                events_dir: events_dir.into(),
            },
            ..Self::default()
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let profile = match get("BACKBONE_PROFILE").as_deref().map(str::trim) {
            None | Some("embedded") => Profile::Embedded {
                events_dir: get("BACKBONE_EVENTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(PathBuf::from("./target/events")),
            },
            Some("document-store") => Profile::DocumentStore {
                database_url: get("BACKBONE_DATABASE_URL").ok_or(ConfigError::Missing {
                    var: "BACKBONE_DATABASE_URL",
                    profile: "document-store",
                })?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "BACKBONE_PROFILE",
                    value: other.to_string(),
                    reason: "expected `embedded` or `document-store`".to_string(),
                });
            }
        };

        let interceptors = match get("BACKBONE_INTERCEPTORS") {
            None => defaults.interceptors,
            Some(list) => parse_interceptors(&list)?,
        };

        let workers = parse(&get, "BACKBONE_WORKERS", defaults.workers)?;
        let queue_capacity = parse(&get, "BACKBONE_QUEUE_CAPACITY", defaults.queue_capacity)?;
        for (var, value) in [
            ("BACKBONE_WORKERS", workers),
            ("BACKBONE_QUEUE_CAPACITY", queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: value.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        Ok(Self {
            profile,
            interceptors,
            workers,
            queue_capacity,
            snapshot_every: parse(&get, "BACKBONE_SNAPSHOT_EVERY", defaults.snapshot_every)?,
            metrics_addr: parse(&get, "BACKBONE_METRICS_ADDR", defaults.metrics_addr)?,
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
        })
    }

    /// Interceptors to install, in order, with validation guaranteed.
    pub fn interceptor_chain(&self) -> Vec<InterceptorKind> {
        let mut kinds = self.interceptors.clone();
        if !kinds.contains(&InterceptorKind::Validation) {
            kinds.insert(0, InterceptorKind::Validation);
        }
        kinds
    }

    /// Worker pool settings for the command gateway.
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_interceptors(list: &str) -> Result<Vec<InterceptorKind>, ConfigError> {
    let mut kinds = vec![InterceptorKind::Validation];
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let kind = name.parse().map_err(|reason| ConfigError::Invalid {
            var: "BACKBONE_INTERCEPTORS",
            value: list.to_string(),
            reason,
        })?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(
            config.profile,
            Profile::Embedded {
                events_dir: PathBuf::from("./target/events")
            }
        );
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.snapshot_every, 100);
        assert_eq!(config.interceptors.len(), 3);
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_document_store_requires_url() {
        let err = load(&[("BACKBONE_PROFILE", "document-store")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                var: "BACKBONE_DATABASE_URL",
                profile: "document-store"
            }
        );

        let config = load(&[
            ("BACKBONE_PROFILE", "document-store"),
            ("BACKBONE_DATABASE_URL", "postgres://localhost/backbone"),
        ])
        .unwrap();
        assert_eq!(config.profile.to_string(), "document-store");
    }

    #[test]
    fn test_unknown_profile_is_rejected() {
        let err = load(&[("BACKBONE_PROFILE", "cluster")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKBONE_PROFILE", .. }));
    }

    #[test]
    fn test_malformed_numbers_are_errors() {
        let err = load(&[("BACKBONE_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKBONE_WORKERS", .. }));

        let err = load(&[("BACKBONE_WORKERS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKBONE_WORKERS", .. }));

        let err = load(&[("BACKBONE_METRICS_ADDR", "nowhere")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKBONE_METRICS_ADDR", .. }));
    }

    #[test]
    fn test_validation_is_always_installed() {
        let config = load(&[("BACKBONE_INTERCEPTORS", "logging, correlation")]).unwrap();
        assert_eq!(
            config.interceptors,
            [
                InterceptorKind::Validation,
                InterceptorKind::Logging,
                InterceptorKind::Correlation
            ]
        );

        let err = load(&[("BACKBONE_INTERCEPTORS", "validation,audit")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BACKBONE_INTERCEPTORS", .. }));
    }

    #[test]
    fn test_chain_restores_validation() {
        let config = Config {
            interceptors: vec![InterceptorKind::Logging],
            ..Config::default()
        };
        assert_eq!(
            config.interceptor_chain(),
            [InterceptorKind::Validation, InterceptorKind::Logging]
        );
    }

    #[test]
    fn test_gateway_settings() {
        let config = load(&[("BACKBONE_WORKERS", "2"), ("BACKBONE_QUEUE_CAPACITY", "8")]).unwrap();
        let gateway = config.gateway();
        assert_eq!(gateway.workers, 2);
        assert_eq!(gateway.queue_capacity, 8);
    }
}
