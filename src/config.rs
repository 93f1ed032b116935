use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, sync::Arc, time::Duration};

use crate::{
    models::media_type::MediaType,
    services::{
        optimizer::{
            CompressionTarget, DEFAULT_MAX_ITERATIONS, ImageEncoder, JpegQualityEncoder,
            WebpQualityEncoder,
        },
        storage_service::{MAX_STORED_IMAGES, StoreSettings},
    },
    validation::{MAX_BLOB_SIZE, Policy},
};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Scheme, host and port requests must originate from.
    pub origin: String,
    /// First path segment of every virtual path.
    pub namespace: String,
    pub retention_hours: u64,
    pub max_stored_images: usize,
    pub max_blob_size: usize,
    pub cache_capacity: u64,
    pub sweep_interval_secs: u64,
    pub output_edge: u32,
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub max_iterations: u32,
    pub probe_interval_secs: u64,
    /// Format every conversion is encoded to: `webp` or `jpeg`.
    pub output_format: MediaType,
}

/// What the binary should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Sweep,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Local image vault with virtual-path gateway")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides IMAGE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Serving origin, e.g. http://localhost:3000 (overrides IMAGE_VAULT_ORIGIN)
    #[arg(long)]
    pub origin: Option<String>,

    /// Virtual path namespace (overrides IMAGE_VAULT_NAMESPACE)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run one retention sweep and exit
    #[arg(long, conflicts_with = "migrate")]
    pub sweep: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_sources(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge `args` over the variables `lookup` resolves, over defaults.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<(Self, RunMode)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env(lookup);

        // --- Environment fallback ---
        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env.string("IMAGE_VAULT_HOST", defaults.host)),
            port: match args.port {
                Some(port) => port,
                None => env.parse("IMAGE_VAULT_PORT", defaults.port)?,
            },
            database_url: args.database_url.unwrap_or_else(|| {
                env.string("IMAGE_VAULT_DATABASE_URL", defaults.database_url)
            }),
            origin: args
                .origin
                .unwrap_or_else(|| env.string("IMAGE_VAULT_ORIGIN", defaults.origin))
                .trim_end_matches('/')
                .to_string(),
            namespace: args
                .namespace
                .unwrap_or_else(|| env.string("IMAGE_VAULT_NAMESPACE", defaults.namespace))
                .trim_matches('/')
                .to_string(),
            retention_hours: env.parse("IMAGE_VAULT_RETENTION_HOURS", defaults.retention_hours)?,
            max_stored_images: env
                .parse("IMAGE_VAULT_MAX_STORED_IMAGES", defaults.max_stored_images)?,
            max_blob_size: env.parse("IMAGE_VAULT_MAX_BLOB_SIZE", defaults.max_blob_size)?,
            cache_capacity: env.parse("IMAGE_VAULT_CACHE_CAPACITY", defaults.cache_capacity)?,
            sweep_interval_secs: env
                .parse("IMAGE_VAULT_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            output_edge: env.parse("IMAGE_VAULT_OUTPUT_EDGE", defaults.output_edge)?,
            min_bytes: env.parse("IMAGE_VAULT_MIN_BYTES", defaults.min_bytes)?,
            max_bytes: env.parse("IMAGE_VAULT_MAX_BYTES", defaults.max_bytes)?,
            max_iterations: env.parse("IMAGE_VAULT_MAX_ITERATIONS", defaults.max_iterations)?,
            probe_interval_secs: env
                .parse("IMAGE_VAULT_PROBE_INTERVAL_SECS", defaults.probe_interval_secs)?,
            output_format: match env.get("IMAGE_VAULT_OUTPUT_FORMAT") {
                Some(value) => parse_output_format(&value)?,
                None => defaults.output_format,
            },
        };

        if cfg.namespace.is_empty() || cfg.namespace.contains('/') {
            anyhow::bail!("namespace `{}` must be a single path segment", cfg.namespace);
        }
        if cfg.min_bytes > cfg.max_bytes {
            anyhow::bail!(
                "IMAGE_VAULT_MIN_BYTES ({}) exceeds IMAGE_VAULT_MAX_BYTES ({})",
                cfg.min_bytes,
                cfg.max_bytes
            );
        }

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.sweep {
            RunMode::Sweep
        } else {
            RunMode::Serve
        };
        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            max_stored_images: self.max_stored_images,
            retention: Duration::from_secs(self.retention_hours * 60 * 60),
            policy: Policy::with_max_blob_size(self.max_blob_size),
        }
    }

    /// Window used when an upload does not name its own.
    pub fn default_target(&self) -> CompressionTarget {
        CompressionTarget {
            max_iterations: self.max_iterations,
            ..CompressionTarget::square(self.output_edge, self.min_bytes, self.max_bytes)
        }
    }

    /// Encoder for the configured output format.
    pub fn encoder(&self) -> Arc<dyn ImageEncoder> {
        match self.output_format {
            MediaType::Jpeg => Arc::new(JpegQualityEncoder),
            _ => Arc::new(WebpQualityEncoder),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: "sqlite://./data/image_vault.db".into(),
            origin: "http://localhost:3000".into(),
            namespace: "images".into(),
            retention_hours: 24,
            max_stored_images: MAX_STORED_IMAGES,
            max_blob_size: MAX_BLOB_SIZE,
            cache_capacity: 64,
            sweep_interval_secs: 60 * 60,
            output_edge: 512,
            min_bytes: 40 * 1024,
            max_bytes: 60 * 1024,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            probe_interval_secs: 30,
            output_format: MediaType::Webp,
        }
    }
}

fn parse_output_format(value: &str) -> Result<MediaType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "webp" => Ok(MediaType::Webp),
        "jpeg" | "jpg" => Ok(MediaType::Jpeg),
        other => anyhow::bail!("IMAGE_VAULT_OUTPUT_FORMAT `{}` is not webp or jpeg", other),
    }
}

/// Variable source behind `from_sources`.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(value) => value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", key, value)),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_cli_overrides_and_normalizes() {
        let args = Args {
            port: Some(8080),
            origin: Some("http://example.test/".into()),
            namespace: Some("/vault/".into()),
            sweep: true,
            ..Args::default()
        };
        let (cfg, mode) = AppConfig::from_sources(args, no_env).unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.origin, "http://example.test");
        assert_eq!(cfg.namespace, "vault");
        assert_eq!(mode, RunMode::Sweep);
    }

    #[test]
    fn test_rejects_nested_namespace() {
        let args = Args {
            namespace: Some("a/b".into()),
            ..Args::default()
        };
        let err = AppConfig::from_sources(args, no_env).unwrap_err();
        assert!(err.to_string().contains("single path segment"));
    }

    #[test]
    fn test_derived_settings() {
        let cfg = AppConfig::default();
        let settings = cfg.store_settings();
        assert_eq!(settings.retention, Duration::from_secs(24 * 60 * 60));
        assert_eq!(settings.max_stored_images, 100);

        let target = cfg.default_target();
        assert_eq!((target.output_width, target.output_height), (512, 512));
        assert_eq!(target.max_iterations, 15);
        assert!(target.min_bytes < target.max_bytes);
    }

    #[test]
    fn test_environment_fills_gaps_under_cli() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("IMAGE_VAULT_PORT", "9000"),
            ("IMAGE_VAULT_HOST", "127.0.0.1"),
            ("IMAGE_VAULT_MAX_BLOB_SIZE", "1024"),
            ("IMAGE_VAULT_OUTPUT_FORMAT", "JPEG"),
        ]);
        let lookup = |key: &str| vars.get(key).map(|v| v.to_string());

        let (cfg, mode) = AppConfig::from_sources(
            Args {
                port: Some(8080),
                ..Args::default()
            },
            lookup,
        )
        .unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.max_blob_size, 1024);
        assert_eq!(cfg.output_format, MediaType::Jpeg);
        assert_eq!(cfg.encoder().media_type(), MediaType::Jpeg);
        assert_eq!(mode, RunMode::Serve);
    }

    #[test]
    fn test_malformed_environment_is_an_error() {
        let err = AppConfig::from_sources(Args::default(), |key| {
            (key == "IMAGE_VAULT_MIN_BYTES").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("IMAGE_VAULT_MIN_BYTES"));

        let err = AppConfig::from_sources(Args::default(), |key| {
            (key == "IMAGE_VAULT_OUTPUT_FORMAT").then(|| "avif".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("avif"));
    }
}
