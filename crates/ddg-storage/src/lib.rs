//! Per-degree unit storage, catalog IO and HTTP utilities for DDG.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use ddg_core::{BilingualText, DegreeRecord, GenerationOutput, PartialBilingualText, UnitPatch};
use regex::Regex;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reserved file-name suffix for merged catalogs. Unit scans never read these.
pub const MERGED_CATALOG_SUFFIX: &str = ".merged.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unit id {0:?} is not usable as a file name")]
    InvalidUnitId(String),
    #[error("catalog {} is not a JSON array", .0.display())]
    CatalogNotArray(PathBuf),
}

/// Ids become file stems, so anything that could escape the output directory or hide
/// the file is rejected.
pub fn validate_unit_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.trim().is_empty()
        && id.trim() == id
        && !id.starts_with('.')
        && !id.contains(['/', '\\', '\0'])
        && !id.contains("..");
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidUnitId(id.to_string()))
    }
}

pub fn is_merged_catalog_name(file_name: &str) -> bool {
    file_name.ends_with(MERGED_CATALOG_SUFFIX)
}

/// `<dir>/<stem>.merged.json` next to the catalog.
pub fn default_merged_path(catalog_path: &Path) -> PathBuf {
    let stem = catalog_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "degrees".to_string());
    catalog_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}{MERGED_CATALOG_SUFFIX}"))
}

#[derive(Debug, Clone)]
pub struct StoredUnit {
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Result of scanning the output directory for units.
#[derive(Debug, Clone, Default)]
pub struct UnitScan {
    pub patches: BTreeMap<String, UnitPatch>,
    pub skipped: Vec<PathBuf>,
}

/// One JSON file per degree id under `root`.
#[derive(Debug, Clone)]
pub struct UnitStore {
    root: PathBuf,
}

impl UnitStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn unit_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_unit_id(id)?;
        Ok(self.root.join(format!("{id}.json")))
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output directory {}", self.root.display()))
    }

    pub async fn contains(&self, id: &str) -> anyhow::Result<bool> {
        let path = self.unit_path(id)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking unit path {}", path.display()))
    }

    /// Persist one unit, replacing any previous one for the same id.
    pub async fn write_unit(&self, output: &GenerationOutput) -> anyhow::Result<StoredUnit> {
        let path = self.unit_path(&output.id)?;
        let byte_size = write_json_atomic(&path, output).await?;
        Ok(StoredUnit {
            path,
            byte_size,
        })
    }

    /// Read every unit in the directory. Unreadable or malformed files are skipped.
    pub async fn scan(&self) -> anyhow::Result<UnitScan> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading output directory {}", self.root.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || name.starts_with('.') || is_merged_catalog_name(&name) {
                continue;
            }
            let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
            if is_file {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut scan = UnitScan::default();
        for path in paths {
            match read_unit_patch(&path).await {
                Some(patch) => {
                    scan.patches.insert(patch.id.clone(), patch);
                }
                None => {
                    warn!(path = %path.display(), "skipping malformed unit");
                    scan.skipped.push(path);
                }
            }
        }
        Ok(scan)
    }
}

async fn read_unit_patch(path: &Path) -> Option<UnitPatch> {
    let text = fs::read_to_string(path).await.ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;
    unit_patch_from_json(&value)
}

/// Lenient view of a unit: only `id`, `description` and `source_url` matter here.
pub fn unit_patch_from_json(value: &Value) -> Option<UnitPatch> {
    let obj = value.as_object()?;
    let id = obj.get("id")?.as_str()?.trim();
    if id.is_empty() {
        return None;
    }
    let description = obj
        .get("description")
        .and_then(Value::as_object)
        .map(|d| PartialBilingualText {
            it: d.get("it").and_then(Value::as_str).map(str::to_string),
            en: d.get("en").and_then(Value::as_str).map(str::to_string),
        });
    let source_url = obj
        .get("source_url")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(UnitPatch {
        id: id.to_string(),
        description,
        source_url,
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Field-by-field view of a catalog entry. A field of the wrong type is treated as
/// missing without affecting the others.
pub fn degree_record_from_json(value: &Value) -> DegreeRecord {
    if !value.is_object() {
        debug!("catalog entry is not an object");
        return DegreeRecord::default();
    }
    let name = value
        .get("name")
        .map(|n| BilingualText {
            it: string_field(n, "it").unwrap_or_default(),
            en: string_field(n, "en").unwrap_or_default(),
        })
        .unwrap_or_default();
    let description = value
        .get("description")
        .filter(|d| d.is_object())
        .map(|d| BilingualText {
            it: string_field(d, "it").unwrap_or_default(),
            en: string_field(d, "en").unwrap_or_default(),
        });
    DegreeRecord {
        id: string_field(value, "id").unwrap_or_default(),
        name,
        description,
        source_url: string_field(value, "source_url"),
    }
}

/// Catalog as raw JSON objects, in file order.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub entries: Vec<Value>,
}

impl Catalog {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let value: Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        match value {
            Value::Array(entries) => Ok(Self { entries }),
            _ => Err(StoreError::CatalogNotArray(path.to_path_buf()).into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Typed view of every entry, one per position. Non-object entries come back with
    /// an empty id so callers can skip them.
    pub fn records(&self) -> Vec<DegreeRecord> {
        self.entries.iter().map(degree_record_from_json).collect()
    }
}

/// Pretty JSON (two-space indent, non-ASCII kept literal) written via temp file + rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<usize> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    bytes.push(b'\n');

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(bytes.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only rate limiting is worth retrying; everything else fails the call.
pub fn classify_response(status: StatusCode, body: &str) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn retry_hint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)retry in (\d+(?:\.\d+)?)\s*s").expect("retry hint pattern is valid")
    })
}

/// Seconds suggested by provider error text such as "Please retry in 12.5s.".
pub fn parse_retry_seconds(message: &str) -> Option<f64> {
    retry_hint_pattern()
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitBackoff {
    pub max_attempts: usize,
    pub delay_cap: Duration,
    pub fallback_delay: Duration,
}

impl Default for RateLimitBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_cap: Duration::from_secs(120),
            fallback_delay: Duration::from_secs(45),
        }
    }
}

impl RateLimitBackoff {
    /// Provider hint clamped to `delay_cap`, or `fallback_delay` when the text has none.
    pub fn delay_for_message(&self, message: &str) -> Duration {
        match parse_retry_seconds(message) {
            Some(secs) => {
                let capped = secs.min(self.delay_cap.as_secs_f64());
                Duration::from_secs_f64(capped.max(0.0))
            }
            None => self.fallback_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}
