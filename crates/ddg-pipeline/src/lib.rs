//! Generation pipeline orchestration: per-degree generation, batch runs and merge.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ddg_adapters::{
    select_backend, CompletionError, CompletionProvider, GeminiSettings, OpenAiSettings,
    SerperSettings, SerperSnippetSource, SnippetSource,
};
use ddg_core::{BilingualText, DegreeRecord, GenerationOutput, UnitPatch};
use ddg_storage::{
    default_merged_path, validate_unit_id, write_json_atomic, Catalog, RateLimitBackoff, UnitStore,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod prompts;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub degrees_json: PathBuf,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub serper: SerperSettings,
    pub openai: Option<OpenAiSettings>,
    pub gemini: Option<GeminiSettings>,
    pub llm_delay: Duration,
}

impl PipelineConfig {
    /// Reads the process environment, after loading `.env` when one is present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let count = |key: &str, default: usize| {
            non_empty(key)
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };
        let secs = |key: &str, default: Duration| {
            non_empty(key)
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
                .unwrap_or(default)
        };

        let mut serper = SerperSettings {
            api_key: non_empty("SERPER_API_KEY"),
            timeout: secs("SEARCH_TIMEOUT_SECS", Duration::from_secs(15)),
            max_snippets: count("MAX_SNIPPETS", 5),
            ..Default::default()
        };
        if let Some(endpoint) = non_empty("SERPER_URL") {
            serper.endpoint = endpoint;
        }
        if let Some(sites) = non_empty("SEARCH_SITES") {
            serper.sites = sites
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        let llm_timeout = secs("LLM_TIMEOUT_SECS", Duration::from_secs(60));

        let openai = non_empty("OPENAI_API_KEY").map(|key| {
            let mut settings = OpenAiSettings::new(
                key,
                non_empty("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            );
            if let Some(base_url) = non_empty("OPENAI_BASE_URL") {
                settings.base_url = base_url;
            }
            settings.timeout = llm_timeout;
            settings
        });

        let gemini = non_empty("GEMINI_API_KEY").map(|key| {
            let mut settings = GeminiSettings::new(
                key,
                non_empty("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            );
            if let Some(base_url) = non_empty("GEMINI_BASE_URL") {
                settings.base_url = base_url;
            }
            settings.timeout = llm_timeout;
            settings.backoff = RateLimitBackoff {
                max_attempts: count("GEMINI_MAX_RETRIES", 3),
                delay_cap: secs("GEMINI_RETRY_CAP_SECS", Duration::from_secs(120)),
                ..Default::default()
            };
            settings
        });

        Self {
            degrees_json: non_empty("DEGREES_JSON")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("src/data/degrees.json")),
            output_dir: non_empty("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("output")),
            user_agent: non_empty("DDG_USER_AGENT").unwrap_or_else(|| "ddg-bot/0.1".to_string()),
            serper,
            openai,
            gemini,
            llm_delay: secs("LLM_DELAY_SEC", Duration::from_secs(1)),
        }
    }

    /// Command-line overrides for the two paths.
    pub fn with_paths(mut self, degrees_json: Option<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        if let Some(path) = degrees_json {
            self.degrees_json = path;
        }
        if let Some(dir) = output_dir {
            self.output_dir = dir;
        }
        self
    }
}

/// Problems that stop a run before any degree is attempted.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not load catalog {}: {reason}", .path.display())]
    CatalogUnreadable { path: PathBuf, reason: String },
    #[error("no degrees in {}", .0.display())]
    EmptyCatalog(PathBuf),
    #[error("no degrees match the id filter ({})", .0.join(", "))]
    NoMatchingIds(Vec<String>),
    #[error("no completion provider configured (set OPENAI_API_KEY or GEMINI_API_KEY)")]
    NoProviderConfigured,
    #[error("output directory not found: {}", .0.display())]
    OutputDirMissing(PathBuf),
    #[error("merge destination {} is the catalog itself", .0.display())]
    DestinationIsCatalog(PathBuf),
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Italian description failed: {0}")]
    Italian(#[source] CompletionError),
}

#[derive(Debug, Clone)]
pub struct Generated {
    pub output: GenerationOutput,
    pub english_fallback: bool,
}

/// Search → Italian description → English translation for one degree.
pub struct RecordGenerator {
    snippets: Box<dyn SnippetSource>,
    completion: CompletionProvider,
}

impl RecordGenerator {
    pub fn new(snippets: Box<dyn SnippetSource>, completion: CompletionProvider) -> Self {
        Self {
            snippets,
            completion,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let user_agent = Some(config.user_agent.clone());
        let snippets = SerperSnippetSource::new(config.serper.clone(), user_agent.clone())?;
        let backend = select_backend(config.openai.clone(), config.gemini.clone(), user_agent)?;
        Ok(Self::new(
            Box::new(snippets),
            CompletionProvider::new(backend, config.llm_delay),
        ))
    }

    pub fn completion(&self) -> &CompletionProvider {
        &self.completion
    }

    pub async fn generate(&self, degree: &DegreeRecord) -> Result<Generated, GenerateError> {
        let span = info_span!("generate", degree = %degree.id);
        self.generate_inner(degree).instrument(span).await
    }

    async fn generate_inner(&self, degree: &DegreeRecord) -> Result<Generated, GenerateError> {
        let name = &degree.name;
        info!(name_it = %name.it, "processing degree");

        let snippets = self.snippets.fetch(&name.it, &name.en).await;
        let block = prompts::snippet_block(&snippets);

        let user_it = prompts::italian_prompt(&name.it, &name.en, &block);
        let description_it = match self.completion.complete(prompts::SYSTEM_IT, &user_it).await {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, "Italian description failed");
                return Err(GenerateError::Italian(err));
            }
        };
        info!(chars = description_it.chars().count(), "Italian description done");

        let user_en = prompts::translation_prompt(&description_it);
        let description_en = match self.completion.complete(prompts::SYSTEM_EN, &user_en).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(error = %err, "English translation failed; using Italian as fallback");
                None
            }
        };

        let english_fallback = description_en.is_none();
        Ok(Generated {
            output: GenerationOutput::assemble(degree, snippets, description_it, description_en),
            english_fallback,
        })
    }
}

/// Splits `a, b,,c` into a set; `None` when nothing usable remains.
pub fn parse_id_filter(raw: &str) -> Option<BTreeSet<String>> {
    let ids: BTreeSet<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub dry_run: bool,
    pub ids: Option<BTreeSet<String>>,
    pub skip_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegreeStatus {
    SkippedExisting,
    Planned { name_it: String },
    Generated { path: String, english_fallback: bool },
    Failed { reason: String },
    InvalidId,
}

#[derive(Debug, Clone)]
pub struct DegreeReport {
    pub id: String,
    pub status: DegreeStatus,
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected: usize,
    pub degrees: Vec<DegreeReport>,
}

impl BatchSummary {
    fn count(&self, pred: impl Fn(&DegreeStatus) -> bool) -> usize {
        self.degrees.iter().filter(|d| pred(&d.status)).count()
    }

    /// Generated, skipped-as-existing and planned (dry run) degrees.
    pub fn completed(&self) -> usize {
        self.count(|s| {
            matches!(
                s,
                DegreeStatus::SkippedExisting | DegreeStatus::Planned { .. } | DegreeStatus::Generated { .. }
            )
        })
    }

    pub fn generated(&self) -> usize {
        self.count(|s| matches!(s, DegreeStatus::Generated { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, DegreeStatus::SkippedExisting))
    }

    pub fn english_fallbacks(&self) -> usize {
        self.count(|s| {
            matches!(
                s,
                DegreeStatus::Generated {
                    english_fallback: true,
                    ..
                }
            )
        })
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.degrees
            .iter()
            .filter(|d| matches!(d.status, DegreeStatus::Failed { .. }))
            .map(|d| d.id.as_str())
            .collect()
    }
}

/// Walks the catalog in order, generating and persisting one unit per degree.
pub struct BatchRunner {
    generator: RecordGenerator,
    store: UnitStore,
}

impl BatchRunner {
    pub fn new(generator: RecordGenerator, store: UnitStore) -> Self {
        Self { generator, store }
    }

    pub async fn run(&self, catalog_path: &Path, options: &BatchOptions) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        info!(path = %catalog_path.display(), "loading degrees");
        let catalog = load_catalog(catalog_path).await?;
        let records = catalog.records();

        let selected: Vec<&DegreeRecord> = match &options.ids {
            Some(ids) => records.iter().filter(|r| ids.contains(&r.id)).collect(),
            None => records.iter().collect(),
        };
        if selected.is_empty() {
            let ids = options
                .ids
                .as_ref()
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
            return Err(SetupError::NoMatchingIds(ids).into());
        }
        if !options.dry_run && !self.generator.completion().is_configured() {
            return Err(SetupError::NoProviderConfigured.into());
        }
        if !options.dry_run {
            self.store.ensure_root().await?;
        }

        let mut degrees = Vec::with_capacity(selected.len());
        for degree in &selected {
            let status = self.process(degree, options).await;
            degrees.push(DegreeReport {
                id: degree.id.clone(),
                status,
            });
        }

        let summary = BatchSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            selected: selected.len(),
            degrees,
        };
        info!(
            %run_id,
            completed = summary.completed(),
            selected = summary.selected,
            failed = summary.failed_ids().len(),
            "batch finished"
        );
        Ok(summary)
    }

    async fn process(&self, degree: &DegreeRecord, options: &BatchOptions) -> DegreeStatus {
        if let Err(err) = validate_unit_id(&degree.id) {
            warn!(error = %err, "skipping catalog entry");
            return DegreeStatus::InvalidId;
        }

        if options.skip_existing {
            match self.store.contains(&degree.id).await {
                Ok(true) => {
                    info!(degree = %degree.id, "skip (exists)");
                    return DegreeStatus::SkippedExisting;
                }
                Ok(false) => {}
                Err(err) => warn!(degree = %degree.id, error = %err, "could not check for existing unit"),
            }
        }

        if options.dry_run {
            info!(degree = %degree.id, name_it = %degree.name.it, "would process");
            return DegreeStatus::Planned {
                name_it: degree.name.it.clone(),
            };
        }

        let generated = match self.generator.generate(degree).await {
            Ok(generated) => generated,
            Err(err) => {
                error!(degree = %degree.id, error = %err, "failed");
                return DegreeStatus::Failed {
                    reason: err.to_string(),
                };
            }
        };

        match self.store.write_unit(&generated.output).await {
            Ok(stored) => {
                info!(degree = %degree.id, path = %stored.path.display(), bytes = stored.byte_size, "saved");
                DegreeStatus::Generated {
                    path: stored.path.display().to_string(),
                    english_fallback: generated.english_fallback,
                }
            }
            Err(err) => {
                let detail = format!("{err:#}");
                error!(degree = %degree.id, error = %detail, "could not persist unit");
                DegreeStatus::Failed {
                    reason: format!("persisting unit: {detail}"),
                }
            }
        }
    }
}

async fn load_catalog(path: &Path) -> Result<Catalog> {
    let catalog = Catalog::load(path)
        .await
        .map_err(|err| SetupError::CatalogUnreadable {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        })?;
    if catalog.is_empty() {
        return Err(SetupError::EmptyCatalog(path.to_path_buf()).into());
    }
    Ok(catalog)
}

#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub destination: PathBuf,
    pub degrees: usize,
    pub units_loaded: usize,
    pub units_skipped: usize,
    pub updated: usize,
}

/// Folds persisted units into a fresh copy of the catalog. The catalog file itself is
/// only ever read.
pub struct Reconciler {
    catalog_path: PathBuf,
    store: UnitStore,
    destination: PathBuf,
}

impl Reconciler {
    pub fn new(catalog_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, destination: Option<PathBuf>) -> Self {
        let catalog_path = catalog_path.into();
        let destination = destination.unwrap_or_else(|| default_merged_path(&catalog_path));
        Self {
            catalog_path,
            store: UnitStore::new(output_dir),
            destination,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub async fn run(&self) -> Result<ReconcileSummary> {
        let catalog = load_catalog(&self.catalog_path).await?;

        let root = self.store.root();
        let is_dir = fs::metadata(root).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(SetupError::OutputDirMissing(root.to_path_buf()).into());
        }
        if same_file(&self.catalog_path, &self.destination).await {
            return Err(SetupError::DestinationIsCatalog(self.destination.clone()).into());
        }

        let scan = self.store.scan().await?;
        let mut entries = catalog.entries;
        let mut updated = 0usize;
        for entry in &mut entries {
            let Some(id) = entry.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            if let Some(patch) = scan.patches.get(&id) {
                if apply_patch(entry, patch) {
                    updated += 1;
                }
            }
        }

        write_json_atomic(&self.destination, &entries)
            .await
            .with_context(|| format!("writing merged catalog {}", self.destination.display()))?;

        let summary = ReconcileSummary {
            destination: self.destination.clone(),
            degrees: entries.len(),
            units_loaded: scan.patches.len(),
            units_skipped: scan.skipped.len(),
            updated,
        };
        info!(
            destination = %summary.destination.display(),
            updated = summary.updated,
            units = summary.units_loaded,
            skipped = summary.units_skipped,
            "merged catalog written"
        );
        Ok(summary)
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Applies one unit to a catalog entry. Returns whether the description was replaced.
fn apply_patch(entry: &mut Value, patch: &UnitPatch) -> bool {
    let Some(obj) = entry.as_object_mut() else {
        return false;
    };

    let mut description_updated = false;
    if let Some(description) = &patch.description {
        let prior = obj
            .get("description")
            .map(|d| BilingualText {
                it: d.get("it").and_then(Value::as_str).unwrap_or_default().to_string(),
                en: d.get("en").and_then(Value::as_str).unwrap_or_default().to_string(),
            })
            .unwrap_or_default();
        let merged = description.resolve(&prior);
        obj.insert("description".to_string(), json!({ "it": merged.it, "en": merged.en }));
        description_updated = true;
    }
    if let Some(url) = patch.replacement_source_url() {
        obj.insert("source_url".to_string(), Value::String(url.to_string()));
    }
    description_updated
}

/// Builds everything from `config` and runs one batch.
pub async fn run_batch(config: &PipelineConfig, options: &BatchOptions) -> Result<BatchSummary> {
    let generator = RecordGenerator::from_config(config)?;
    if let Some(backend) = generator.completion().backend_name() {
        info!(backend, "completion backend selected");
    }
    let runner = BatchRunner::new(generator, UnitStore::new(config.output_dir.clone()));
    runner.run(&config.degrees_json, options).await
}

pub async fn run_merge(config: &PipelineConfig, destination: Option<PathBuf>) -> Result<ReconcileSummary> {
    Reconciler::new(config.degrees_json.clone(), config.output_dir.clone(), destination)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};

    struct FixedSnippets(Vec<String>);

    #[async_trait]
    impl SnippetSource for FixedSnippets {
        async fn fetch(&self, _name_primary: &str, _name_secondary: &str) -> Vec<String> {
            self.0.clone()
        }
    }

    /// Answers Italian requests with `IT: <name>` and translations with `EN: ...`,
    /// failing where told to. Every user prompt is recorded.
    #[derive(Default)]
    struct ScriptedBackend {
        fail_italian_for: Option<&'static str>,
        fail_english: bool,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ddg_adapters::CompletionBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
            self.prompts.lock().unwrap().push(user.to_string());
            if system == prompts::SYSTEM_IT {
                if let Some(name) = self.fail_italian_for {
                    if user.contains(name) {
                        return Err(CompletionError::HttpStatus {
                            status: 500,
                            message: "boom".into(),
                        });
                    }
                }
                let first_line = user.lines().next().unwrap_or_default();
                Ok(format!("IT: {first_line}"))
            } else if self.fail_english {
                Err(CompletionError::EmptyResponse)
            } else {
                Ok("EN: translated".to_string())
            }
        }
    }

    fn generator(backend: ScriptedBackend, snippets: Vec<String>) -> RecordGenerator {
        RecordGenerator::new(
            Box::new(FixedSnippets(snippets)),
            CompletionProvider::new(Some(Box::new(backend)), Duration::ZERO),
        )
    }

    fn fixture_catalog(dir: &TempDir) -> PathBuf {
        let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog/degrees.json");
        let dest = dir.path().join("degrees.json");
        std::fs::copy(&source, &dest).expect("copy fixture catalog");
        dest
    }

    fn unit_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn degree(id: &str, it: &str, en: &str) -> DegreeRecord {
        DegreeRecord {
            id: id.into(),
            name: BilingualText::new(it, en),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn placeholder_is_sent_when_search_is_empty() {
        let prompts_seen = Arc::new(Mutex::new(Vec::new()));
        let gen = generator(
            ScriptedBackend {
                prompts: prompts_seen.clone(),
                ..Default::default()
            },
            vec![],
        );
        let generated = gen.generate(&degree("fisica", "Fisica", "Physics")).await.unwrap();
        assert!(generated.output.snippets.is_empty());
        assert!(!generated.english_fallback);
        assert_eq!(generated.output.description.en, "EN: translated");

        let seen = prompts_seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains(prompts::NO_SNIPPETS_PLACEHOLDER));
        assert!(seen[1].contains("IT: Corso di laurea: Fisica (Physics)."));
    }

    #[tokio::test]
    async fn snippets_are_echoed_into_the_unit() {
        let gen = generator(ScriptedBackend::default(), vec!["uno".into(), "due".into()]);
        let generated = gen.generate(&degree("fisica", "Fisica", "Physics")).await.unwrap();
        assert_eq!(generated.output.snippets, vec!["uno", "due"]);
        assert_eq!(generated.output.name_it, "Fisica");
    }

    #[tokio::test]
    async fn italian_failure_fails_the_degree() {
        let prompts_seen = Arc::new(Mutex::new(Vec::new()));
        let gen = generator(
            ScriptedBackend {
                fail_italian_for: Some("Fisica"),
                prompts: prompts_seen.clone(),
                ..Default::default()
            },
            vec![],
        );
        let err = gen.generate(&degree("fisica", "Fisica", "Physics")).await.unwrap_err();
        assert!(matches!(err, GenerateError::Italian(_)));
        // No translation is attempted once the Italian step has failed.
        assert_eq!(prompts_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn english_failure_falls_back_to_italian() {
        let gen = generator(
            ScriptedBackend {
                fail_english: true,
                ..Default::default()
            },
            vec![],
        );
        let generated = gen.generate(&degree("fisica", "Fisica", "Physics")).await.unwrap();
        assert!(generated.english_fallback);
        assert_eq!(generated.output.description.en, generated.output.description.it);
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_persists_the_rest() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let out = dir.path().join("output");
        let runner = BatchRunner::new(
            generator(
                ScriptedBackend {
                    fail_italian_for: Some("Fisica"),
                    ..Default::default()
                },
                vec![],
            ),
            UnitStore::new(&out),
        );

        let summary = runner.run(&catalog, &BatchOptions::default()).await.unwrap();
        assert_eq!(summary.selected, 3);
        assert_eq!(summary.generated(), 2);
        assert_eq!(summary.failed_ids(), vec!["fisica"]);
        assert_eq!(unit_files(&out), vec!["design.json", "ing-informatica.json"]);
    }

    #[tokio::test]
    async fn english_fallback_is_persisted_verbatim() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let out = dir.path().join("output");
        let runner = BatchRunner::new(
            generator(
                ScriptedBackend {
                    fail_english: true,
                    ..Default::default()
                },
                vec![],
            ),
            UnitStore::new(&out),
        );
        let options = BatchOptions {
            ids: parse_id_filter("design"),
            ..Default::default()
        };
        let summary = runner.run(&catalog, &options).await.unwrap();
        assert_eq!(summary.english_fallbacks(), 1);

        let text = std::fs::read_to_string(out.join("design.json")).unwrap();
        let unit: GenerationOutput = serde_json::from_str(&text).unwrap();
        assert_eq!(unit.description.en, unit.description.it);
        assert!(!unit.description.en.is_empty());
    }

    #[tokio::test]
    async fn skip_existing_makes_reruns_idempotent() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let out = dir.path().join("output");
        let prompts_seen = Arc::new(Mutex::new(Vec::new()));
        let runner = BatchRunner::new(
            generator(
                ScriptedBackend {
                    prompts: prompts_seen.clone(),
                    ..Default::default()
                },
                vec![],
            ),
            UnitStore::new(&out),
        );
        let options = BatchOptions {
            skip_existing: true,
            ..Default::default()
        };

        let first = runner.run(&catalog, &options).await.unwrap();
        assert_eq!(first.generated(), 3);
        let calls_after_first = prompts_seen.lock().unwrap().len();
        assert_eq!(calls_after_first, 6);

        let second = runner.run(&catalog, &options).await.unwrap();
        assert_eq!(second.skipped(), 3);
        assert_eq!(second.completed(), 3);
        assert_eq!(prompts_seen.lock().unwrap().len(), calls_after_first);
        assert_eq!(unit_files(&out).len(), 3);
    }

    #[tokio::test]
    async fn unmatched_id_filter_is_a_setup_error() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let out = dir.path().join("output");
        let runner = BatchRunner::new(generator(ScriptedBackend::default(), vec![]), UnitStore::new(&out));
        let options = BatchOptions {
            ids: parse_id_filter("medicina, lettere"),
            ..Default::default()
        };

        let err = runner.run(&catalog, &options).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::NoMatchingIds(ids)) if ids == &vec!["lettere".to_string(), "medicina".to_string()]
        ));
        assert!(unit_files(&out).is_empty());
    }

    #[tokio::test]
    async fn dry_run_lists_without_calls_or_writes() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let out = dir.path().join("output");
        let prompts_seen = Arc::new(Mutex::new(Vec::new()));
        let runner = BatchRunner::new(
            generator(
                ScriptedBackend {
                    prompts: prompts_seen.clone(),
                    ..Default::default()
                },
                vec![],
            ),
            UnitStore::new(&out),
        );
        let options = BatchOptions {
            dry_run: true,
            ..Default::default()
        };
        let summary = runner.run(&catalog, &options).await.unwrap();
        assert_eq!(summary.completed(), 3);
        assert!(matches!(
            &summary.degrees[0].status,
            DegreeStatus::Planned { name_it } if name_it == "Ingegneria Informatica"
        ));
        assert!(prompts_seen.lock().unwrap().is_empty());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn missing_provider_stops_before_work() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let runner = BatchRunner::new(
            RecordGenerator::new(
                Box::new(FixedSnippets(vec![])),
                CompletionProvider::new(None, Duration::ZERO),
            ),
            UnitStore::new(dir.path().join("output")),
        );
        let err = runner.run(&catalog, &BatchOptions::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::NoProviderConfigured)
        ));
    }

    #[tokio::test]
    async fn empty_or_unreadable_catalog_is_a_setup_error() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "[]").unwrap();
        let runner = BatchRunner::new(generator(ScriptedBackend::default(), vec![]), UnitStore::new(dir.path()));

        let err = runner.run(&empty, &BatchOptions::default()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<SetupError>(), Some(SetupError::EmptyCatalog(_))));

        let err = runner
            .run(&dir.path().join("missing.json"), &BatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::CatalogUnreadable { .. })
        ));
    }

    #[tokio::test]
    async fn entries_with_unsafe_ids_are_skipped() {
        let dir = tempdir().unwrap();
        let catalog = dir.path().join("degrees.json");
        std::fs::write(
            &catalog,
            r#"[{"id":"../escape","name":{"it":"X","en":"X"}},{"id":"ok","name":{"it":"Ok","en":"Ok"}}]"#,
        )
        .unwrap();
        let out = dir.path().join("output");
        let runner = BatchRunner::new(generator(ScriptedBackend::default(), vec![]), UnitStore::new(&out));
        let summary = runner.run(&catalog, &BatchOptions::default()).await.unwrap();
        assert_eq!(summary.degrees[0].status, DegreeStatus::InvalidId);
        assert_eq!(summary.completed(), 1);
        assert_eq!(unit_files(&out), vec!["ok.json"]);
    }

    #[tokio::test]
    async fn mistyped_catalog_fields_still_select_the_degree() {
        let dir = tempdir().unwrap();
        let catalog = dir.path().join("degrees.json");
        std::fs::write(
            &catalog,
            r#"[{"id":"a","name":{"it":"Astronomia","en":null},"description":"old text","source_url":42}]"#,
        )
        .unwrap();
        let out = dir.path().join("output");
        let prompts_seen = Arc::new(Mutex::new(Vec::new()));
        let runner = BatchRunner::new(
            generator(
                ScriptedBackend {
                    prompts: prompts_seen.clone(),
                    ..Default::default()
                },
                vec![],
            ),
            UnitStore::new(&out),
        );
        let options = BatchOptions {
            ids: parse_id_filter("a"),
            ..Default::default()
        };

        let summary = runner.run(&catalog, &options).await.unwrap();
        assert_eq!(summary.generated(), 1);
        assert!(prompts_seen.lock().unwrap()[0].starts_with("Corso di laurea: Astronomia ()."));
        assert_eq!(unit_files(&out), vec!["a.json"]);
    }

    fn write_unit(out: &Path, id: &str, value: Value) {
        std::fs::create_dir_all(out).unwrap();
        std::fs::write(out.join(format!("{id}.json")), serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    }

    fn merged_by_id(path: &Path) -> HashMap<String, Value> {
        let entries: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        entries
            .into_iter()
            .map(|e| (e["id"].as_str().unwrap().to_string(), e))
            .collect()
    }

    #[tokio::test]
    async fn merge_replaces_only_degrees_with_units() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let original_bytes = std::fs::read(&catalog).unwrap();
        let out = dir.path().join("output");
        write_unit(
            &out,
            "ing-informatica",
            json!({
                "id": "ing-informatica",
                "name_it": "Ingegneria Informatica",
                "name_en": "Computer Engineering",
                "snippets": [],
                "description": {"it": "Nuova descrizione.", "en": "New description."}
            }),
        );
        write_unit(
            &out,
            "fisica",
            json!({"id": "fisica", "description": {"it": "Solo italiano."}}),
        );

        let summary = Reconciler::new(&catalog, &out, None).run().await.unwrap();
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.degrees, 3);
        assert_eq!(summary.destination, dir.path().join("degrees.merged.json"));
        assert_eq!(std::fs::read(&catalog).unwrap(), original_bytes);

        let merged = merged_by_id(&summary.destination);
        assert_eq!(merged["ing-informatica"]["description"]["en"], "New description.");
        assert_eq!(merged["fisica"]["description"]["it"], "Solo italiano.");
        assert_eq!(merged["fisica"]["description"]["en"], "Study of nature.");
        assert_eq!(merged["fisica"]["source_url"], "https://www.unito.it/fisica");

        let originals = merged_by_id(&catalog);
        assert_eq!(merged["design"], originals["design"]);
    }

    #[tokio::test]
    async fn merge_keeps_key_order_and_unicode() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let out = dir.path().join("output");
        write_unit(
            &out,
            "design",
            json!({
                "id": "design",
                "description": {"it": "Un corso più creativo.", "en": "A more creative degree."},
                "source_url": "https://www.polito.it/design"
            }),
        );

        let dest = dir.path().join("custom.json");
        let summary = Reconciler::new(&catalog, &out, Some(dest.clone())).run().await.unwrap();
        assert_eq!(summary.destination, dest);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("Un corso più creativo."));
        let entries: Vec<Value> = serde_json::from_str(&text).unwrap();
        let keys: Vec<&str> = entries[2].as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["id", "category", "name", "university", "description", "source_url"]
        );
        let keys: Vec<&str> = entries[0].as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["id", "category", "name", "description", "university"]);
    }

    #[tokio::test]
    async fn merge_ignores_previous_merged_catalogs_and_bad_units() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);
        let out = dir.path().join("output");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(
            out.join("degrees.merged.json"),
            r#"{"id":"design","description":{"it":"fantasma","en":"ghost"}}"#,
        )
        .unwrap();
        std::fs::write(out.join("broken.json"), "{").unwrap();

        let summary = Reconciler::new(&catalog, &out, None).run().await.unwrap();
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.units_loaded, 0);
        assert_eq!(summary.units_skipped, 1);
    }

    #[tokio::test]
    async fn merge_requires_output_dir_and_distinct_destination() {
        let dir = tempdir().unwrap();
        let catalog = fixture_catalog(&dir);

        let missing = dir.path().join("nope");
        let reconciler = Reconciler::new(&catalog, &missing, None);
        let err = reconciler.run().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<SetupError>(), Some(SetupError::OutputDirMissing(_))));
        assert!(!reconciler.destination().exists());

        let out = dir.path().join("output");
        std::fs::create_dir_all(&out).unwrap();
        let err = Reconciler::new(&catalog, &out, Some(catalog.clone()))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::DestinationIsCatalog(_))
        ));
    }

    #[test]
    fn config_defaults_and_provider_credentials() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "  "),
            ("GEMINI_API_KEY", "g-key"),
            ("GEMINI_RETRY_CAP_SECS", "60"),
            ("SEARCH_SITES", "polito.it, unito.it ,unimi.it"),
            ("LLM_DELAY_SEC", "not-a-number"),
            ("SEARCH_TIMEOUT_SECS", "1e30"),
            ("LLM_TIMEOUT_SECS", "-5"),
        ]);
        let config = PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert!(config.openai.is_none(), "blank key counts as unset");
        let gemini = config.gemini.expect("gemini configured");
        assert_eq!(gemini.model, "gemini-1.5-flash");
        assert_eq!(gemini.backoff.delay_cap, Duration::from_secs(60));
        assert_eq!(gemini.backoff.max_attempts, 3);
        assert_eq!(config.serper.sites, vec!["polito.it", "unito.it", "unimi.it"]);
        assert!(config.serper.api_key.is_none());
        assert_eq!(config.serper.max_snippets, 5);
        assert_eq!(config.llm_delay, Duration::from_secs(1));
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert_eq!(config.serper.timeout, Duration::from_secs(15));
        assert_eq!(gemini.timeout, Duration::from_secs(60));

        let huge = PipelineConfig::from_lookup(|k| (k == "LLM_DELAY_SEC").then(|| "1e30".to_string()));
        assert_eq!(huge.llm_delay, Duration::from_secs(1));
    }

    #[test]
    fn openai_wins_and_paths_can_be_overridden() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-test"),
            ("GEMINI_API_KEY", "g-key"),
            ("OUTPUT_DIR", "units"),
        ]);
        let config = PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
            .with_paths(Some(PathBuf::from("/tmp/catalog.json")), None);

        assert_eq!(config.openai.as_ref().map(|o| o.model.as_str()), Some("gpt-4o-mini"));
        assert_eq!(config.degrees_json, PathBuf::from("/tmp/catalog.json"));
        assert_eq!(config.output_dir, PathBuf::from("units"));
        let generator = RecordGenerator::from_config(&config).unwrap();
        assert_eq!(generator.completion().backend_name(), Some("openai"));
    }

    #[test]
    fn id_filter_parsing_ignores_blanks() {
        assert_eq!(parse_id_filter(" , "), None);
        let ids = parse_id_filter("b, a,,b").unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
