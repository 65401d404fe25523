//! Document identifier extraction from recognized text using regex grammars.
//!
//! Pure functions, no async. Matches are recomputed from a result's text on
//! every read and never stored alongside it.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};

/// A named identifier grammar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierGrammar {
    /// Document type tag reported in matches (e.g. "PAN", "AADHAAR").
    pub id: String,
    /// Human-readable label.
    pub label: String,
    /// Regex pattern string; the first capture group is the value if present.
    pub pattern: String,
    /// Optional normalization: "uppercase" | "strip_punctuation" | "uppercase_strip_punctuation"
    #[serde(default)]
    pub normalize: Option<String>,
}

impl IdentifierGrammar {
    fn new(id: &str, label: &str, pattern: &str, normalize: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            pattern: pattern.to_string(),
            normalize: Some(normalize.to_string()),
        }
    }
}

/// Built-in grammars in declaration order.
pub fn builtin_grammars() -> Vec<IdentifierGrammar> {
    vec![
        IdentifierGrammar::new(
            "PAN",
            "Permanent Account Number",
            r"\b([A-Z]{5}[0-9]{4}[A-Z])\b",
            "uppercase",
        ),
        IdentifierGrammar::new(
            "GSTIN",
            "GST Identification Number",
            r"\b([0-9]{2}[A-Z]{5}[0-9]{4}[A-Z][1-9A-Z]Z[0-9A-Z])\b",
            "uppercase",
        ),
        IdentifierGrammar::new(
            "AADHAAR",
            "Aadhaar Number",
            r"\b([0-9]{4} ?[0-9]{4} ?[0-9]{4})\b",
            "strip_punctuation",
        ),
        IdentifierGrammar::new(
            "VOTER_ID",
            "Voter ID (EPIC)",
            r"\b([A-Z]{3}[0-9]{7})\b",
            "uppercase",
        ),
        IdentifierGrammar::new(
            "DRIVING_LICENSE",
            "Driving Licence Number",
            r"\b([A-Z]{2}[- ]?[0-9]{2}[- ]?(?:19|20)[0-9]{2}[- ]?[0-9]{7})\b",
            "uppercase_strip_punctuation",
        ),
        IdentifierGrammar::new(
            "PASSPORT",
            "Passport Number",
            r"\b([A-Z][1-9][0-9]{6})\b",
            "uppercase",
        ),
        IdentifierGrammar::new(
            "UDYAM",
            "Udyam Registration Number",
            r"\b(UDYAM-[A-Z]{2}-[0-9]{2}-[0-9]{7})\b",
            "uppercase",
        ),
    ]
}

/// Load extra grammars from a JSON array file.
pub fn load_grammars(path: &Path) -> Result<Vec<IdentifierGrammar>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read identifier patterns: {:?}", path))?;
    let grammars: Vec<IdentifierGrammar> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse identifier patterns: {:?}", path))?;
    Ok(grammars)
}

/// How to pick a single "primary" document type when several grammars match.
///
/// This is a presentation policy. Matching more than one grammar says nothing
/// about which document the text actually came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryTypePolicy {
    /// First matching grammar in registry declaration order.
    #[default]
    FirstDeclared,
    /// Grammar with the most distinct values; ties go to declaration order.
    MostMatches,
    /// Never report a primary type.
    Disabled,
}

impl PrimaryTypePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "first_declared" => Some(Self::FirstDeclared),
            "most_matches" => Some(Self::MostMatches),
            "none" | "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

struct CompiledGrammar {
    id: String,
    regex: Regex,
    normalize: Option<String>,
}

/// Pre-compiled grammars ready for matching, in declaration order.
pub struct IdentifierRegistry {
    grammars: Vec<CompiledGrammar>,
}

impl IdentifierRegistry {
    /// Compile grammars case-insensitively. Skips invalid regexes with a warning.
    pub fn compile(grammars: &[IdentifierGrammar]) -> Self {
        let mut compiled = Vec::new();
        for g in grammars {
            match RegexBuilder::new(&g.pattern).case_insensitive(true).build() {
                Ok(regex) => compiled.push(CompiledGrammar {
                    id: g.id.clone(),
                    regex,
                    normalize: g.normalize.clone(),
                }),
                Err(e) => {
                    warn!(
                        "Skipping invalid identifier pattern '{}' ({}): {}",
                        g.id, g.pattern, e
                    );
                }
            }
        }
        debug!("Compiled {} identifier grammars", compiled.len());
        Self { grammars: compiled }
    }

    #[cfg(test)]
    pub fn builtin() -> Self {
        Self::compile(&builtin_grammars())
    }

    /// Document type tags in declaration order (duplicates collapsed).
    pub fn document_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = Vec::new();
        for g in &self.grammars {
            if !types.contains(&g.id.as_str()) {
                types.push(&g.id);
            }
        }
        types
    }

    /// Run every grammar over `text`, keeping grammars with at least one match.
    pub fn extract(&self, text: &str) -> IdentifierMatches {
        let mut matches = IdentifierMatches::default();

        for grammar in &self.grammars {
            let mut values = BTreeSet::new();
            for cap in grammar.regex.captures_iter(text) {
                let raw = cap
                    .get(1)
                    .or_else(|| cap.get(0))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                if raw.is_empty() {
                    continue;
                }
                values.insert(normalize_value(raw, grammar.normalize.as_deref()));
            }

            if !values.is_empty() {
                matches.merge(&grammar.id, values);
            }
        }

        matches
    }
}

/// Document type → distinct matched values, in registry declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentifierMatches {
    entries: Vec<(String, BTreeSet<String>)>,
}

impl IdentifierMatches {
    fn merge(&mut self, document_type: &str, values: BTreeSet<String>) {
        match self.entries.iter_mut().find(|(t, _)| t == document_type) {
            Some((_, existing)) => existing.extend(values),
            None => self.entries.push((document_type.to_string(), values)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn get(&self, document_type: &str) -> Option<&BTreeSet<String>> {
        self.entries
            .iter()
            .find(|(t, _)| t == document_type)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.entries.iter().map(|(t, v)| (t.as_str(), v))
    }

    /// Pick the primary document type according to `policy`.
    pub fn primary(&self, policy: PrimaryTypePolicy) -> Option<&str> {
        match policy {
            PrimaryTypePolicy::FirstDeclared => self.entries.first().map(|(t, _)| t.as_str()),
            PrimaryTypePolicy::MostMatches => {
                let mut best: Option<&(String, BTreeSet<String>)> = None;
                for entry in &self.entries {
                    if best.map_or(true, |b| entry.1.len() > b.1.len()) {
                        best = Some(entry);
                    }
                }
                best.map(|(t, _)| t.as_str())
            }
            PrimaryTypePolicy::Disabled => None,
        }
    }
}

impl Serialize for IdentifierMatches {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (document_type, values) in self.iter() {
            map.serialize_entry(document_type, values)?;
        }
        map.end()
    }
}

/// Apply normalization to a matched value.
fn normalize_value(value: &str, normalize: Option<&str>) -> String {
    match normalize {
        Some("uppercase") => value.to_uppercase(),
        Some("strip_punctuation") => value.chars().filter(|c| c.is_alphanumeric()).collect(),
        Some("uppercase_strip_punctuation") => value
            .to_uppercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect(),
        _ => value.to_string(),
    }
}
