//! Service settings.
//!
//! Every setting comes from an environment variable (a `.env` file is loaded
//! first by `main`). Unset variables take their defaults; unparseable values
//! abort startup.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::identifiers::PrimaryTypePolicy;
use crate::jobs::DispatcherConfig;
use crate::ocr::BackendKind;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,

    pub cache_ttl: Duration,
    pub cache_max_size: usize,
    pub sweep_interval: Duration,

    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub task_timeout: Duration,
    pub job_retention: Duration,
    pub queue_max_size: usize,

    pub min_text_len: usize,
    pub default_language: String,
    pub default_backend: BackendKind,
    pub tesseract_bin: String,
    pub psm_modes: Vec<u8>,
    pub sidecar_url: Option<String>,

    pub max_file_size: usize,
    pub pdf_max_pages: usize,

    pub primary_policy: PrimaryTypePolicy,
    pub identifier_patterns: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let settings = Self::from_lookup(|key| env::var(key).ok())?;
        info!(
            "Settings loaded: workers={}, cache={}x{}s, backend={}, lang={}",
            settings.workers,
            settings.cache_max_size,
            settings.cache_ttl.as_secs(),
            settings.default_backend,
            settings.default_language
        );
        Ok(settings)
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let default_backend = match get("OCR_DEFAULT_BACKEND") {
            Some(name) => BackendKind::from_str(&name)
                .with_context(|| format!("OCR_DEFAULT_BACKEND: unknown backend '{}'", name))?,
            None => BackendKind::Tesseract,
        };

        let primary_policy = match get("IDENTIFIER_PRIMARY_POLICY") {
            Some(name) => PrimaryTypePolicy::from_str(&name).with_context(|| {
                format!("IDENTIFIER_PRIMARY_POLICY: unknown policy '{}'", name)
            })?,
            None => PrimaryTypePolicy::default(),
        };

        let psm_modes = match get("TESSERACT_PSM_MODES") {
            Some(list) => parse_list::<u8>(&list).context("TESSERACT_PSM_MODES")?,
            None => vec![6, 11, 12, 13],
        };
        if psm_modes.is_empty() {
            anyhow::bail!("TESSERACT_PSM_MODES must list at least one mode");
        }

        let workers: usize = parse_or(&get, "OCR_WORKERS", 4)?;
        if workers == 0 {
            anyhow::bail!("OCR_WORKERS must be at least 1");
        }
        let max_attempts: u32 = parse_or(&get, "JOB_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            anyhow::bail!("JOB_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,

            cache_ttl: Duration::from_secs(parse_or(&get, "CACHE_TTL_SECONDS", 86400)?),
            cache_max_size: parse_or(&get, "CACHE_MAX_SIZE", 1000)?,
            sweep_interval: Duration::from_secs(
                parse_or::<u64>(&get, "CACHE_SWEEP_INTERVAL_SECONDS", 300)?.max(1),
            ),

            workers,
            max_attempts,
            retry_backoff: Duration::from_millis(parse_or(&get, "JOB_RETRY_BACKOFF_MS", 1000)?),
            task_timeout: Duration::from_secs(parse_or(&get, "TASK_TIMEOUT", 300)?),
            job_retention: Duration::from_secs(parse_or(&get, "JOB_RETENTION_SECONDS", 86400)?),
            queue_max_size: parse_or(&get, "QUEUE_MAX_SIZE", 10000)?,

            min_text_len: parse_or(&get, "OCR_MIN_TEXT_LEN", 5)?,
            default_language: get("OCR_MODEL_LANG").unwrap_or_else(|| "eng".to_string()),
            default_backend,
            tesseract_bin: get("TESSERACT_BIN").unwrap_or_else(|| "tesseract".to_string()),
            psm_modes,
            sidecar_url: get("OCR_SIDECAR_URL"),

            max_file_size: parse_or::<usize>(&get, "MAX_FILE_SIZE_MB", 50)? * 1024 * 1024,
            pdf_max_pages: parse_or(&get, "PDF_MAX_PAGES", 3)?,

            primary_policy,
            identifier_patterns: get("IDENTIFIER_PATTERNS_PATH").map(PathBuf::from),
        })
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            max_attempts: self.max_attempts,
            retry_backoff: self.retry_backoff,
            task_timeout: self.task_timeout,
            retention: self.job_retention,
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}: invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

fn parse_list<T>(raw: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid entry '{}': {}", s, e))
        })
        .collect()
}
