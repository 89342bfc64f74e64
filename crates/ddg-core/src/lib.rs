//! Core domain model for degree description generation.

use serde::{Deserialize, Serialize};

/// Text carried in both catalog languages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BilingualText {
    #[serde(default)]
    pub it: String,
    #[serde(default)]
    pub en: String,
}

impl BilingualText {
    pub fn new(it: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            it: it.into(),
            en: en.into(),
        }
    }
}

/// Degree entry as read from the catalog.
///
/// Only the fields the generator needs are modelled. The reconciler works on the raw
/// JSON objects so that anything else in the catalog survives a merge untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DegreeRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: BilingualText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<BilingualText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// Persisted per-degree result ("unit").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub id: String,
    pub name_it: String,
    pub name_en: String,
    #[serde(default)]
    pub snippets: Vec<String>,
    pub description: BilingualText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl GenerationOutput {
    /// Builds the unit for `degree`. A missing or blank English text falls back to the
    /// Italian one, so `description.en` is never empty when `description_it` is not.
    pub fn assemble(
        degree: &DegreeRecord,
        snippets: Vec<String>,
        description_it: String,
        description_en: Option<String>,
    ) -> Self {
        let description_en = description_en
            .filter(|en| !en.trim().is_empty())
            .unwrap_or_else(|| description_it.clone());
        Self {
            id: degree.id.clone(),
            name_it: degree.name.it.clone(),
            name_en: degree.name.en.clone(),
            snippets,
            description: BilingualText::new(description_it, description_en),
            source_url: None,
        }
    }
}

/// Description carried by a unit where either language may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialBilingualText {
    pub it: Option<String>,
    pub en: Option<String>,
}

impl PartialBilingualText {
    /// Fills each missing language from `prior`.
    pub fn resolve(&self, prior: &BilingualText) -> BilingualText {
        BilingualText {
            it: self.it.clone().unwrap_or_else(|| prior.it.clone()),
            en: self.en.clone().unwrap_or_else(|| prior.en.clone()),
        }
    }
}

/// Field-level patch a unit contributes to the merged catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnitPatch {
    pub id: String,
    pub description: Option<PartialBilingualText>,
    pub source_url: Option<String>,
}

impl UnitPatch {
    /// Only a non-empty source URL replaces the catalog value.
    pub fn replacement_source_url(&self) -> Option<&str> {
        self.source_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}
