//! Worker configuration.
//!
//! Everything is read once at startup and passed into constructors; there
//! is no global mutable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::converter::ConverterRegistry;
use crate::pipeline::PipelineSettings;
use crate::retry::RetryConfig;
use crate::store::S3Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to locate installation directory: {0}")]
    InstallDir(#[source] std::io::Error),
}

/// Full worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Redis URL for the job queues
    pub redis_url: String,
    /// Queue jobs are received from
    pub input_queue: String,
    /// Queue completion and failure messages are sent to
    pub output_queue: String,
    /// Optional queue for messages dropped by the redelivery cap
    pub dead_letter_queue: Option<String>,
    /// Consumer group shared by all workers
    pub consumer_group: String,
    /// This process's consumer name within the group
    pub consumer_name: String,
    /// Lease duration of a received message
    pub visibility_timeout: Duration,
    /// Longest a receive blocks on an empty queue
    pub receive_wait: Duration,
    /// Deliveries after which a failing message is dead-lettered
    pub max_receive_count: u32,
    /// Object store settings
    pub s3: S3Config,
    /// Watchdog for a single converter run
    pub converter_timeout: Duration,
    /// Converter name to path, paths possibly relative to `install_dir`
    pub converters: Vec<(String, PathBuf)>,
    /// Directory relative converter paths are resolved against
    pub install_dir: PathBuf,
    /// Root of per-job scratch directories
    pub scratch_dir: PathBuf,
}

impl WorkerConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let credentials = match (get("AWS_ACCESS_KEY_ID"), get("AWS_SECRET_ACCESS_KEY")) {
            (Some(id), Some(secret)) => Some((id, secret)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("AWS_SECRET_ACCESS_KEY")),
            (None, Some(_)) => return Err(ConfigError::Missing("AWS_ACCESS_KEY_ID")),
        };

        let s3 = S3Config {
            bucket: required("SLICER_BUCKET")?,
            region: required("AWS_REGION")?,
            endpoint_url: get("S3_ENDPOINT_URL"),
            credentials,
        };

        let install_dir = match get("SLICER_INSTALL_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => executable_dir()?,
        };

        Ok(Self {
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
            input_queue: required("SLICER_INPUT_QUEUE")?,
            output_queue: required("SLICER_OUTPUT_QUEUE")?,
            dead_letter_queue: get("SLICER_DEAD_LETTER_QUEUE"),
            consumer_group: get("SLICER_CONSUMER_GROUP")
                .unwrap_or_else(|| "slicer-workers".to_string()),
            consumer_name: get("SLICER_CONSUMER_NAME")
                .unwrap_or_else(|| format!("slicer-worker-{}", Uuid::new_v4())),
            visibility_timeout: Duration::from_secs(parse_positive(
                &get,
                "SLICER_VISIBILITY_TIMEOUT_SECS",
                100,
            )?),
            receive_wait: Duration::from_secs(parse_positive(
                &get,
                "SLICER_RECEIVE_WAIT_SECS",
                5,
            )?),
            max_receive_count: parse_positive(&get, "SLICER_MAX_RECEIVE_COUNT", 3)?,
            s3,
            converter_timeout: Duration::from_secs(parse_positive(
                &get,
                "SLICER_CONVERTER_TIMEOUT_SECS",
                300,
            )?),
            converters: parse_converters(
                &get("SLICER_CONVERTERS").unwrap_or_else(|| "slic3r=slic3r/slic3r".to_string()),
            )?,
            install_dir,
            scratch_dir: get("SLICER_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("slicer-worker")),
        })
    }

    pub fn converter_registry(&self) -> ConverterRegistry {
        ConverterRegistry::new(
            &self.install_dir,
            self.converters.iter().map(|(name, path)| (name.as_str(), path.as_path())),
        )
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            input_queue: self.input_queue.clone(),
            output_queue: self.output_queue.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
            visibility_timeout: self.visibility_timeout,
            max_receive_count: self.max_receive_count,
            scratch_dir: self.scratch_dir.clone(),
            worker_name: self.consumer_name.clone(),
            retry: RetryConfig::default(),
            poll_error_backoff: Duration::from_secs(5),
        }
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

/// Like [`parse_or`], but zero is rejected. A zero receive wait would block
/// forever (`BLOCK 0`) and a zero lease would let every worker claim every
/// pending message.
fn parse_positive<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq + std::fmt::Display,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, name, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Parses `name=path[,name=path...]`.
fn parse_converters(raw: &str) -> Result<Vec<(String, PathBuf)>, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        name: "SLICER_CONVERTERS",
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut converters = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, path) = entry
            .split_once('=')
            .ok_or_else(|| invalid("expected name=path"))?;
        let (name, path) = (name.trim(), path.trim());
        if name.is_empty() || path.is_empty() {
            return Err(invalid("empty converter name or path"));
        }
        converters.push((name.to_string(), PathBuf::from(path)));
    }

    if converters.is_empty() {
        return Err(invalid("no converters configured"));
    }
    Ok(converters)
}

fn executable_dir() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe().map_err(ConfigError::InstallDir)?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("SLICER_BUCKET", "models"),
        ("SLICER_INPUT_QUEUE", "slicer:in"),
        ("SLICER_OUTPUT_QUEUE", "slicer:out"),
        ("AWS_REGION", "us-east-1"),
        ("SLICER_INSTALL_DIR", "/opt/slicer-worker"),
    ];

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(REQUIRED)).unwrap();

        assert_eq!(config.redis_url, "redis://127.0.0.1/");
        assert_eq!(config.visibility_timeout, Duration::from_secs(100));
        assert_eq!(config.receive_wait, Duration::from_secs(5));
        assert_eq!(config.max_receive_count, 3);
        assert_eq!(config.converter_timeout, Duration::from_secs(300));
        assert_eq!(config.dead_letter_queue, None);
        assert_eq!(config.s3.credentials, None);
        assert!(config.consumer_name.starts_with("slicer-worker-"));
        assert_eq!(
            config.converter_registry().resolve("slic3r").unwrap(),
            Path::new("/opt/slicer-worker/slic3r/slic3r")
        );
    }

    #[test]
    fn test_missing_required() {
        for (missing, _) in &REQUIRED[..4] {
            let vars: Vec<_> = REQUIRED.iter().copied().filter(|(k, _)| k != missing).collect();
            let err = WorkerConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Missing(name) if name == *missing),
                "expected {} to be required, got {}",
                missing,
                err
            );
        }
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SLICER_OUTPUT_QUEUE", "  "));
        vars.remove(2);
        assert!(matches!(
            WorkerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Missing("SLICER_OUTPUT_QUEUE"))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("SLICER_VISIBILITY_TIMEOUT_SECS", "900"),
            ("SLICER_MAX_RECEIVE_COUNT", "5"),
            ("SLICER_DEAD_LETTER_QUEUE", "slicer:dlq"),
            ("SLICER_CONVERTERS", "acme=bin/acme, cura=/usr/bin/cura"),
            ("AWS_ACCESS_KEY_ID", "id"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("S3_ENDPOINT_URL", "http://127.0.0.1:9000"),
        ]);

        let config = WorkerConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.visibility_timeout, Duration::from_secs(900));
        assert_eq!(config.max_receive_count, 5);
        assert_eq!(config.dead_letter_queue.as_deref(), Some("slicer:dlq"));
        assert_eq!(
            config.s3.credentials,
            Some(("id".to_string(), "secret".to_string()))
        );
        let registry = config.converter_registry();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["acme", "cura"]);
        assert_eq!(
            registry.resolve("cura").unwrap(),
            Path::new("/usr/bin/cura")
        );
    }

    #[test]
    fn test_invalid_number() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SLICER_VISIBILITY_TIMEOUT_SECS", "soon"));
        assert!(matches!(
            WorkerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Invalid { name: "SLICER_VISIBILITY_TIMEOUT_SECS", .. })
        ));
    }

    #[test]
    fn test_zero_durations_and_counts_are_rejected() {
        for name in [
            "SLICER_VISIBILITY_TIMEOUT_SECS",
            "SLICER_RECEIVE_WAIT_SECS",
            "SLICER_CONVERTER_TIMEOUT_SECS",
            "SLICER_MAX_RECEIVE_COUNT",
        ] {
            let mut vars = REQUIRED.to_vec();
            vars.push((name, "0"));
            let err = WorkerConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: invalid, .. } if invalid == name),
                "expected {} = 0 to be rejected, got {}",
                name,
                err
            );
        }
    }

    #[test]
    fn test_worker_name_scopes_scratch() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SLICER_CONSUMER_NAME", "host-1"));

        let settings = WorkerConfig::from_lookup(lookup(&vars))
            .unwrap()
            .pipeline_settings();

        assert_eq!(settings.worker_name, "host-1");
    }

    #[test]
    fn test_lone_access_key_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("AWS_ACCESS_KEY_ID", "id"));
        assert!(matches!(
            WorkerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Missing("AWS_SECRET_ACCESS_KEY"))
        ));
    }

    #[test]
    fn test_parse_converters() {
        assert!(parse_converters("acme").is_err());
        assert!(parse_converters("=bin/acme").is_err());
        assert!(parse_converters(" , ").is_err());
        assert_eq!(
            parse_converters("acme=bin/acme,").unwrap(),
            vec![("acme".to_string(), PathBuf::from("bin/acme"))]
        );
    }
}
