use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Non-text attributes attached to an assistant turn.
///
/// Every field is optional on the wire. Structured results (recipe records)
/// are exposed under one canonical name; the backend's older `recipes` and
/// `recipeData` spellings are folded into it while decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawMetadata")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structured_results: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Folds a later partial update into `self`. Fields present on `update`
    /// win; absent fields leave the accumulated value untouched.
    pub fn merge(&mut self, update: MessageMetadata) {
        if update.intent.is_some() {
            self.intent = update.intent;
        }
        if update.confidence.is_some() {
            self.confidence = update.confidence;
        }
        if !update.suggestions.is_empty() {
            self.suggestions = update.suggestions;
        }
        if !update.structured_results.is_empty() {
            self.structured_results = update.structured_results;
        }
        if update.processing_time_ms.is_some() {
            self.processing_time_ms = update.processing_time_ms;
        }
        if update.stage.is_some() {
            self.stage = update.stage;
        }
    }

    pub fn with_structured_results(mut self, results: Vec<Value>) -> Self {
        if !results.is_empty() {
            self.structured_results = results;
        }
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    structured_results: Option<Vec<Value>>,
    #[serde(default)]
    recipes: Option<Vec<Value>>,
    #[serde(default)]
    recipe_data: Option<Vec<Value>>,
    #[serde(default, alias = "processingTime")]
    processing_time_ms: Option<u64>,
    #[serde(default)]
    stage: Option<String>,
}

impl From<RawMetadata> for MessageMetadata {
    fn from(raw: RawMetadata) -> Self {
        let structured_results = raw
            .structured_results
            .or(raw.recipes)
            .or(raw.recipe_data)
            .unwrap_or_default();
        Self {
            intent: raw.intent,
            confidence: raw.confidence,
            suggestions: raw.suggestions,
            structured_results,
            processing_time_ms: raw.processing_time_ms,
            stage: raw.stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_recipe_fields_fold_into_structured_results() {
        let from_recipes: MessageMetadata =
            serde_json::from_value(json!({ "recipes": [{ "title": "carbonara" }] })).unwrap();
        assert_eq!(from_recipes.structured_results.len(), 1);

        let from_recipe_data: MessageMetadata =
            serde_json::from_value(json!({ "recipeData": [{ "title": "ragu" }, { "title": "pesto" }] }))
                .unwrap();
        assert_eq!(from_recipe_data.structured_results.len(), 2);
    }

    #[test]
    fn canonical_field_wins_over_aliases() {
        let metadata: MessageMetadata = serde_json::from_value(json!({
            "structuredResults": [{ "title": "canonical" }],
            "recipes": [{ "title": "legacy" }, { "title": "legacy-2" }],
        }))
        .unwrap();
        assert_eq!(metadata.structured_results, vec![json!({ "title": "canonical" })]);
    }

    #[test]
    fn serializes_only_the_canonical_name() {
        let metadata = MessageMetadata::default().with_structured_results(vec![json!(1)]);
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value, json!({ "structuredResults": [1] }));
    }

    #[test]
    fn merge_keeps_earlier_fields_absent_from_update() {
        let mut acc = MessageMetadata {
            intent: Some("recipe_search".into()),
            stage: Some("intent_analysis".into()),
            ..Default::default()
        };
        acc.merge(MessageMetadata {
            stage: Some("generation".into()),
            confidence: Some(0.9),
            ..Default::default()
        });
        assert_eq!(acc.intent.as_deref(), Some("recipe_search"));
        assert_eq!(acc.stage.as_deref(), Some("generation"));
        assert_eq!(acc.confidence, Some(0.9));
    }
}
