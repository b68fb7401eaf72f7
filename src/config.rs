//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use crate::pipeline::synthesizer::SynthesisTuning;
use serde::Deserialize;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for containers
            port: 3000,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Background pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Scheduler tick interval, per tenant pass.
    pub scheduler_interval_secs: u64,
    /// Number of dispatch workers draining the task queue.
    pub worker_count: usize,
    /// Synthesis confidence coefficients (heuristic, tenant-independent).
    pub tuning: SynthesisTuning,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_secs: 30,
            worker_count: 2,
            tuning: SynthesisTuning::default(),
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub pipeline: PipelineConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: std::env::var("HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let cors = CorsConfig {
            allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                .ok()
                .map(|origins| {
                    origins
                        .split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            scheduler_interval_secs: std::env::var("SCHEDULER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.scheduler_interval_secs),
            worker_count: std::env::var("PIPELINE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_count),
            tuning: load_tuning(defaults.tuning),
        };

        Ok(Self {
            server,
            cors,
            pipeline,
        })
    }
}

/// The confidence coefficients are configuration, not contract: they can
/// be tuned per deployment without touching the synthesis code.
fn load_tuning(defaults: SynthesisTuning) -> SynthesisTuning {
    let read = |name: &str, fallback: f64| {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback)
    };
    SynthesisTuning {
        base: read("SYNTHESIS_BASE", defaults.base),
        weight_coeff: read("SYNTHESIS_WEIGHT_COEFF", defaults.weight_coeff),
        consistency_coeff: read("SYNTHESIS_CONSISTENCY_COEFF", defaults.consistency_coeff),
        max_confidence: read("SYNTHESIS_MAX_CONFIDENCE", defaults.max_confidence),
        insufficient_signal_floor: read(
            "SYNTHESIS_SIGNAL_FLOOR",
            defaults.insufficient_signal_floor,
        ),
        default_coverage: read("SYNTHESIS_DEFAULT_COVERAGE", defaults.default_coverage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.scheduler_interval_secs, 30);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.tuning, SynthesisTuning::default());
    }
}
