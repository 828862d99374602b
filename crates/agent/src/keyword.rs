//! Deterministic fallback strategy: asks for one field at a time and
//! recognizes answers from the schema's phrases and the keyword vocabulary.

use async_trait::async_trait;
use callquote_core::domain::extraction::{ExtractionFailure, ExtractionResult};
use callquote_core::domain::field::FieldValues;
use callquote_core::schema::{FieldSchema, FieldSpec, FieldType, KeywordVocabulary};
use serde_json::Value;

use crate::extractor::{ExtractionRequest, Extractor};

const NUMBER_WORDS: [&str; 21] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen", "twenty",
];

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|token| token.trim_matches('\''))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let phrase = tokens(phrase);
    if phrase.is_empty() || phrase.len() > words.len() {
        return false;
    }
    words.windows(phrase.len()).any(|window| window == phrase.as_slice())
}

fn contains_any(words: &[String], candidates: &[String]) -> bool {
    candidates.iter().any(|candidate| contains_phrase(words, candidate))
}

/// Maps an utterance to one allowed value. Longer phrases win, so
/// "baby grand" is preferred over "grand".
pub fn match_categorical(spec: &FieldSpec, utterance: &str) -> Option<String> {
    let words = tokens(utterance);
    let mut phrases = spec.phrases();
    phrases.sort_by(|(a, _), (b, _)| {
        tokens(b).len().cmp(&tokens(a).len()).then_with(|| b.len().cmp(&a.len()))
    });
    phrases.into_iter().find(|(phrase, _)| contains_phrase(&words, phrase)).map(|(_, value)| value)
}

/// First number in the utterance, digits or words, else zero when a
/// zero-word such as "none" appears.
pub fn match_integer(utterance: &str, vocabulary: &KeywordVocabulary) -> Option<i64> {
    let words = tokens(utterance);
    for word in &words {
        let digits: String = word.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(number) = digits.parse::<i64>() {
            return Some(number);
        }
        if let Some(position) = NUMBER_WORDS.iter().position(|candidate| candidate == word) {
            return Some(position as i64);
        }
    }
    if contains_any(&words, &vocabulary.zero_words) {
        return Some(0);
    }
    None
}

/// Yes or no, or nothing when the answer is ambiguous.
pub fn match_boolean(utterance: &str, vocabulary: &KeywordVocabulary) -> Option<bool> {
    let words = tokens(utterance);
    match (contains_any(&words, &vocabulary.yes_words), contains_any(&words, &vocabulary.no_words)) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        _ => None,
    }
}

fn match_field(spec: &FieldSpec, utterance: &str, schema: &FieldSchema) -> Option<Value> {
    match spec.field_type {
        FieldType::Categorical => match_categorical(spec, utterance).map(Value::String),
        FieldType::Integer => match_integer(utterance, schema.vocabulary()).map(Value::from),
        FieldType::Boolean => match_boolean(utterance, schema.vocabulary()).map(Value::Bool),
        FieldType::Address | FieldType::String => {
            let text = utterance.trim();
            (!text.is_empty()).then(|| Value::String(text.to_string()))
        }
    }
}

fn next_missing<'a>(
    schema: &'a FieldSchema,
    fields: &FieldValues,
    skip: Option<&str>,
) -> Option<&'a FieldSpec> {
    schema
        .required_fields()
        .find(|spec| !fields.contains_key(&spec.name) && Some(spec.name.as_str()) != skip)
}

pub fn reprompt(spec: &FieldSpec) -> String {
    format!("Sorry, I didn't catch that. {}", spec.prompt_text())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct KeywordExtractor;

impl KeywordExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Never fails and never escalates on its own.
    pub fn respond(&self, request: &ExtractionRequest<'_>) -> ExtractionResult {
        let profile = request.profile;
        let schema = &profile.schema;

        let Some(target) = next_missing(schema, request.fields, None) else {
            let mut result = ExtractionResult::reply(&profile.closing_line);
            result.is_complete = true;
            return result;
        };

        match match_field(target, request.utterance, schema) {
            Some(value) => {
                let result = ExtractionResult::default().with_value(&target.name, value);
                match next_missing(schema, request.fields, Some(&target.name)) {
                    Some(next) => ExtractionResult {
                        reply_text: format!("Got it. {}", next.prompt_text()),
                        ..result
                    },
                    None => ExtractionResult {
                        reply_text: profile.closing_line.clone(),
                        is_complete: true,
                        ..result
                    },
                }
            }
            None => ExtractionResult::reply(reprompt(target)).needing(&target.name),
        }
    }
}

#[async_trait]
impl Extractor for KeywordExtractor {
    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
    ) -> Result<ExtractionResult, ExtractionFailure> {
        Ok(self.respond(request))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}
