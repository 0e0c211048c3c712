use crate::config::PipelineConfig;
use crate::models::ImageReference;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LotsError {
    #[error("export is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("export has no `results` array")]
    MissingResults,
}

/// How export hits are turned into references.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub image_base_url: String,
    pub alternate_hosts: Vec<String>,
}

impl IngestSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            image_base_url: config.image_base_url.clone(),
            alternate_hosts: config.alternate_hosts.clone(),
        }
    }
}

/// Parses an auction search export (`{"results":[{"hits":[...]}]}`).
///
/// Hits without a lot ref, house name or photo path are skipped, as are
/// repeated lot refs; only a missing `results` array fails the export.
pub fn parse_export(
    raw: &str,
    settings: &IngestSettings,
) -> Result<Vec<ImageReference>, LotsError> {
    let data: Value = serde_json::from_str(raw)?;
    let results = data
        .get("results")
        .and_then(Value::as_array)
        .ok_or(LotsError::MissingResults)?;

    let mut seen = HashSet::new();
    let mut references = Vec::new();
    for (idx, result) in results.iter().enumerate() {
        let Some(hits) = result.get("hits").and_then(Value::as_array) else {
            warn!(target = "valuer.api", result = idx, "export_result_without_hits");
            continue;
        };
        for hit in hits {
            let Some(reference) = reference_from_hit(hit, settings) else {
                warn!(
                    target = "valuer.api",
                    lot_ref = %text_field(hit, "lotRef").unwrap_or_default(),
                    "export_hit_skipped"
                );
                continue;
            };
            if !seen.insert(reference.logical_id.clone()) {
                debug!(
                    target = "valuer.api",
                    lot_ref = %reference.logical_id,
                    "export_duplicate_lot"
                );
                continue;
            }
            references.push(reference);
        }
    }
    Ok(references)
}

fn reference_from_hit(hit: &Value, settings: &IngestSettings) -> Option<ImageReference> {
    let lot_ref = text_field(hit, "lotRef")?;
    let house = text_field(hit, "houseName")?;
    let photo_path = text_field(hit, "photoPath")?;

    let primary_url = if photo_path.starts_with("http://") || photo_path.starts_with("https://") {
        photo_path
    } else {
        format!(
            "{}/{}",
            settings.image_base_url.trim_end_matches('/'),
            photo_path.trim_start_matches('/')
        )
    };
    let mut reference = ImageReference::new(lot_ref, primary_url, house)
        .with_candidate_hosts(settings.alternate_hosts.iter().cloned());
    if let Some(title) = text_field(hit, "lotTitle") {
        reference = reference.with_title(title);
    }
    reference.validate().ok()?;
    Some(reference)
}

/// Non-empty string (or number) field, trimmed.
fn text_field(hit: &Value, key: &str) -> Option<String> {
    let value = match hit.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IngestSettings {
        IngestSettings {
            image_base_url: "https://image.invaluable.com/housePhotos/".into(),
            alternate_hosts: vec!["media.invaluable.com".into()],
        }
    }

    #[test]
    fn parses_hits_into_references() {
        let raw = r#"{"results":[{"hits":[
            {"lotRef":"ABC123","houseName":"Rago Arts","photoPath":"rago/76/1/H0001-L1.jpg","lotTitle":"Lamp"},
            {"lotRef":987,"houseName":"Other","photoPath":"https://cdn.example.com/x.jpg"}
        ]}]}"#;
        let refs = parse_export(raw, &settings()).expect("parse");
        assert_eq!(refs.len(), 2);
        assert_eq!(
            refs[0].primary_url,
            "https://image.invaluable.com/housePhotos/rago/76/1/H0001-L1.jpg"
        );
        assert_eq!(refs[0].title.as_deref(), Some("Lamp"));
        assert_eq!(refs[0].candidate_hosts, vec!["media.invaluable.com"]);
        assert_eq!(refs[1].logical_id, "987");
        assert_eq!(refs[1].primary_url, "https://cdn.example.com/x.jpg");
        assert!(refs[1].title.is_none());
    }

    #[test]
    fn malformed_and_duplicate_hits_are_skipped() {
        let raw = r#"{"results":[
            {"hits":[
                {"lotRef":"A","houseName":"H","photoPath":"a.jpg"},
                {"lotRef":"","houseName":"H","photoPath":"b.jpg"},
                {"lotRef":"C","houseName":"H"},
                {"lotRef":"A","houseName":"H","photoPath":"again.jpg"},
                {"lotRef":"../D","houseName":"H","photoPath":"d.jpg"}
            ]},
            {"nohits":true}
        ]}"#;
        let refs = parse_export(raw, &settings()).expect("parse");
        let ids: Vec<_> = refs.iter().map(|r| r.logical_id.as_str()).collect();
        assert_eq!(ids, vec!["A"]);
        assert!(refs[0].primary_url.ends_with("/housePhotos/a.jpg"));
    }

    #[test]
    fn missing_results_is_an_error() {
        assert!(matches!(
            parse_export(r#"{"hits":[]}"#, &settings()),
            Err(LotsError::MissingResults)
        ));
        assert!(matches!(
            parse_export("not json", &settings()),
            Err(LotsError::Json(_))
        ));
        assert!(parse_export(r#"{"results":[]}"#, &settings()).expect("empty").is_empty());
    }
}
