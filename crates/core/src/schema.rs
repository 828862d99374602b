//! Declarative description of the fields a business wants collected on a call.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::normalize_category;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Address,
    Integer,
    Boolean,
    Categorical,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Address => "address",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Categorical => "categorical",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<BTreeSet<String>>,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Question the agent asks when this field is still missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Spoken phrases per allowed value, used by the keyword strategy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub synonyms: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            allowed_values: None,
            required: true,
            prompt: None,
            synonyms: BTreeMap::new(),
            min: None,
            max: None,
        }
    }

    pub fn categorical<I, S>(name: impl Into<String>, allowed_values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::new(name, FieldType::Categorical);
        spec.allowed_values = Some(allowed_values.into_iter().map(Into::into).collect());
        spec
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_synonyms<I, S>(mut self, value: impl Into<String>, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synonyms.insert(value.into(), phrases.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_bounds(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Human-readable label, e.g. `pickup_address` -> `pickup address`.
    pub fn label(&self) -> String {
        self.name.replace('_', " ")
    }

    pub fn prompt_text(&self) -> String {
        self.prompt.clone().unwrap_or_else(|| format!("Could you provide the {}?", self.label()))
    }

    /// Phrases to match for each allowed value. Values without configured
    /// synonyms match on their own spoken form.
    pub fn phrases(&self) -> Vec<(String, String)> {
        let mut phrases = Vec::new();
        for value in self.allowed_values.iter().flatten() {
            match self.synonyms.get(value) {
                Some(configured) if !configured.is_empty() => {
                    for phrase in configured {
                        phrases.push((phrase.to_ascii_lowercase(), value.clone()));
                    }
                }
                _ => phrases.push((value.replace('_', " ").to_ascii_lowercase(), value.clone())),
            }
        }
        phrases
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordVocabulary {
    #[serde(default = "default_yes_words")]
    pub yes_words: Vec<String>,
    #[serde(default = "default_no_words")]
    pub no_words: Vec<String>,
    #[serde(default = "default_zero_words")]
    pub zero_words: Vec<String>,
}

impl Default for KeywordVocabulary {
    fn default() -> Self {
        Self {
            yes_words: default_yes_words(),
            no_words: default_no_words(),
            zero_words: default_zero_words(),
        }
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|word| (*word).to_string()).collect()
}

fn default_yes_words() -> Vec<String> {
    words(&["yes", "yeah", "yep", "sure", "ok", "okay", "definitely", "absolutely"])
}

fn default_no_words() -> Vec<String> {
    words(&["no", "nope", "nah", "not", "don't", "dont", "without"])
}

fn default_zero_words() -> Vec<String> {
    words(&["no", "none", "zero"])
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema must declare at least one field")]
    Empty,
    #[error("duplicate field name `{0}`")]
    DuplicateField(String),
    #[error("field name must not be empty")]
    EmptyFieldName,
    #[error("categorical field `{0}` must declare allowed_values")]
    MissingAllowedValues(String),
    #[error("field `{field}` value `{value}` must be written in canonical form `{canonical}`")]
    NonCanonicalValue { field: String, value: String, canonical: String },
    #[error("field `{field}` declares synonyms for unknown value `{value}`")]
    UnknownSynonymValue { field: String, value: String },
    #[error("field `{0}` has min greater than max")]
    InvalidBounds(String),
    #[error("pricing rule references unknown field `{0}`")]
    UnknownPricingField(String),
    #[error("pricing rule field `{field}` must be {expected}, found {found}")]
    PricingFieldType { field: String, expected: &'static str, found: &'static str },
    #[error("pricing rules invalid: {0}")]
    InvalidPricing(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFieldSchema")]
pub struct FieldSchema {
    fields: Vec<FieldSpec>,
    vocabulary: KeywordVocabulary,
}

#[derive(Deserialize)]
struct RawFieldSchema {
    fields: Vec<FieldSpec>,
    #[serde(default)]
    vocabulary: KeywordVocabulary,
}

impl TryFrom<RawFieldSchema> for FieldSchema {
    type Error = SchemaError;

    fn try_from(raw: RawFieldSchema) -> Result<Self, Self::Error> {
        Self::with_vocabulary(raw.fields, raw.vocabulary)
    }
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        Self::with_vocabulary(fields, KeywordVocabulary::default())
    }

    pub fn with_vocabulary(
        fields: Vec<FieldSpec>,
        vocabulary: KeywordVocabulary,
    ) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = BTreeSet::new();
        for field in &fields {
            if field.name.trim().is_empty() {
                return Err(SchemaError::EmptyFieldName);
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
            if field.field_type == FieldType::Categorical {
                let allowed = match &field.allowed_values {
                    Some(allowed) if !allowed.is_empty() => allowed,
                    _ => return Err(SchemaError::MissingAllowedValues(field.name.clone())),
                };
                for value in allowed {
                    let canonical = normalize_category(value);
                    if &canonical != value {
                        return Err(SchemaError::NonCanonicalValue {
                            field: field.name.clone(),
                            value: value.clone(),
                            canonical,
                        });
                    }
                }
                if let Some(value) = field.synonyms.keys().find(|value| !allowed.contains(*value))
                {
                    return Err(SchemaError::UnknownSynonymValue {
                        field: field.name.clone(),
                        value: value.clone(),
                    });
                }
            }
            if let (Some(min), Some(max)) = (field.min, field.max) {
                if min > max {
                    return Err(SchemaError::InvalidBounds(field.name.clone()));
                }
            }
        }

        Ok(Self { fields, vocabulary })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|field| field.required)
    }

    pub fn vocabulary(&self) -> &KeywordVocabulary {
        &self.vocabulary
    }
}
