//! Canonical token accounting.
//!
//! Every provider reports usage differently. Decoders build a [`UsageRecord`]
//! from their own schema; anything that has no canonical slot goes verbatim
//! into `providerUsageDetails`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<TokenDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<TokenDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_usage_details: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl TokenDetails {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// `None` when no field is set.
    pub fn non_empty(self) -> Option<Self> {
        (!self.is_empty()).then_some(self)
    }
}

/// One entry of a per-modality token breakdown (Gemini's `ModalityTokenCount`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalityTokenCount {
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub token_count: Option<u64>,
}

/// Folds a modality breakdown into [`TokenDetails`].
///
/// Modalities match case-insensitively and duplicates are summed. Entries
/// with no modality, no count or an unknown modality are dropped.
pub fn flatten_modality_token_counts(counts: &[ModalityTokenCount]) -> Option<TokenDetails> {
    let mut details = TokenDetails::default();
    for entry in counts {
        let (Some(modality), Some(count)) = (entry.modality.as_deref(), entry.token_count) else {
            continue;
        };
        let slot = match modality.to_ascii_uppercase().as_str() {
            "TEXT" => &mut details.text_tokens,
            "IMAGE" => &mut details.image_tokens,
            "AUDIO" => &mut details.audio_tokens,
            "VIDEO" => &mut details.video_tokens,
            _ => continue,
        };
        *slot = Some(slot.unwrap_or(0).saturating_add(count));
    }
    details.non_empty()
}

impl UsageRecord {
    /// `total` falls back to `prompt + completion` when the provider omits it.
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: Option<u64>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens.unwrap_or(prompt_tokens.saturating_add(completion_tokens)),
            prompt_tokens_details: None,
            completion_tokens_details: None,
            provider_usage_details: None,
        }
    }

    pub fn with_prompt_details(mut self, details: Option<TokenDetails>) -> Self {
        self.prompt_tokens_details = details.and_then(TokenDetails::non_empty);
        self
    }

    pub fn with_completion_details(mut self, details: Option<TokenDetails>) -> Self {
        self.completion_tokens_details = details.and_then(TokenDetails::non_empty);
        self
    }

    /// Null values are skipped; an empty map leaves the field absent.
    pub fn with_provider_details(mut self, details: Map<String, Value>) -> Self {
        let details: Map<String, Value> = details
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        self.provider_usage_details = (!details.is_empty()).then_some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(modality: Option<&str>, count: Option<u64>) -> ModalityTokenCount {
        ModalityTokenCount {
            modality: modality.map(|m| m.to_string()),
            token_count: count,
        }
    }

    #[test]
    fn modality_counts_are_summed_case_insensitively() {
        let details = flatten_modality_token_counts(&[
            entry(Some("TEXT"), Some(100)),
            entry(Some("text"), Some(50)),
            entry(Some("IMAGE"), Some(7)),
            entry(Some("DOCUMENT"), Some(999)),
            entry(None, Some(3)),
            entry(Some("AUDIO"), None),
        ])
        .expect("details present");

        assert_eq!(details.text_tokens, Some(150));
        assert_eq!(details.image_tokens, Some(7));
        assert_eq!(details.audio_tokens, None);
        assert_eq!(details.video_tokens, None);
    }

    #[test]
    fn unknown_only_modalities_yield_nothing() {
        assert_eq!(
            flatten_modality_token_counts(&[entry(Some("DOCUMENT"), Some(4))]),
            None
        );
        assert_eq!(flatten_modality_token_counts(&[]), None);
    }

    #[test]
    fn total_defaults_to_sum() {
        assert_eq!(UsageRecord::new(10, 5, None).total_tokens, 15);
        assert_eq!(UsageRecord::new(10, 5, Some(20)).total_tokens, 20);
    }

    #[test]
    fn huge_counts_saturate_instead_of_overflowing() {
        assert_eq!(UsageRecord::new(u64::MAX, 1, None).total_tokens, u64::MAX);

        let details = flatten_modality_token_counts(&[
            entry(Some("TEXT"), Some(u64::MAX)),
            entry(Some("TEXT"), Some(5)),
        ])
        .expect("details present");
        assert_eq!(details.text_tokens, Some(u64::MAX));
    }

    #[test]
    fn empty_details_are_omitted_from_json() {
        let usage = UsageRecord::new(1, 2, None)
            .with_prompt_details(Some(TokenDetails::default()))
            .with_provider_details(Map::from_iter([("trafficType".to_string(), Value::Null)]));
        let value = serde_json::to_value(&usage).expect("serializes");
        assert_eq!(
            value,
            json!({"promptTokens": 1, "completionTokens": 2, "totalTokens": 3})
        );
    }
}
