//! Detail response → record field mapping

use crate::models::DetailMap;
use bibscout_common::config::{validate_field_mappings, FieldMapping, FieldTransform};
use serde_json::Value;

/// Validated mapping table
///
/// Built once at startup; invalid tables are rejected before any network call.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    mappings: Vec<FieldMapping>,
}

impl FieldMapper {
    pub fn new(mappings: Vec<FieldMapping>) -> bibscout_common::Result<Self> {
        validate_field_mappings(&mappings)?;
        Ok(Self { mappings })
    }

    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    /// Map a detail response into the record's detail map
    ///
    /// Missing source keys and values the transform cannot convert are
    /// skipped. Returns `None` when the response is not a JSON object.
    pub fn apply(&self, response: &Value) -> Option<DetailMap> {
        if !response.is_object() {
            return None;
        }

        let mut detail = DetailMap::new();
        for mapping in &self.mappings {
            let Some(raw) = lookup_path(response, &mapping.source_key) else {
                continue;
            };
            match transform(raw, mapping.transform) {
                Some(value) => {
                    detail.insert(mapping.target_field.clone(), value);
                }
                None => {
                    tracing::trace!(
                        source_key = %mapping.source_key,
                        transform = ?mapping.transform,
                        "Detail field skipped"
                    );
                }
            }
        }
        Some(detail)
    }
}

/// Follow a dotted path (`rating.average`) through nested objects
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
        .filter(|v| !v.is_null())
}

fn transform(value: &Value, transform: FieldTransform) -> Option<Value> {
    match transform {
        FieldTransform::Identity => Some(value.clone()),
        FieldTransform::Trim => match value {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| Value::String(trimmed.to_string()))
            }
            other => Some(other.clone()),
        },
        FieldTransform::Number => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }?;
            serde_json::Number::from_f64(number).map(Value::Number)
        }
        FieldTransform::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from),
            Value::String(s) => leading_integer(s).map(Value::from),
            _ => None,
        },
        FieldTransform::JoinList => match value {
            Value::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.trim().to_string()),
                        Value::Object(o) => o.get("name").and_then(Value::as_str).map(|s| s.trim().to_string()),
                        _ => None,
                    })
                    .filter(|s| !s.is_empty())
                    .collect();
                (!parts.is_empty()).then(|| Value::String(parts.join(", ")))
            }
            Value::String(s) if !s.trim().is_empty() => Some(Value::String(s.trim().to_string())),
            _ => None,
        },
    }
}

/// Leading digits of strings such as "320页" or " 1,024 pages"
fn leading_integer(s: &str) -> Option<i64> {
    let digits: String = s
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibscout_common::config::DetailConfig;
    use serde_json::json;

    fn mapping(source: &str, target: &str, transform: FieldTransform) -> FieldMapping {
        FieldMapping {
            source_key: source.into(),
            target_field: target.into(),
            transform,
        }
    }

    #[test]
    fn test_default_table_maps_typical_response() {
        let mapper = FieldMapper::new(DetailConfig::default().field_mappings).unwrap();
        let response = json!({
            "title": "  三体 ",
            "author": ["刘慈欣"],
            "pages": "302页",
            "rating": {"average": "8.8", "numRaters": 523000},
            "summary": "",
            "unmapped": true
        });

        let detail = mapper.apply(&response).unwrap();
        assert_eq!(detail["title"], json!("三体"));
        assert_eq!(detail["authors"], json!("刘慈欣"));
        assert_eq!(detail["pages"], json!(302));
        assert_eq!(detail["rating"], json!(8.8));
        assert_eq!(detail["rating_count"], json!(523000));
        assert!(!detail.contains_key("summary"));
        assert!(!detail.contains_key("unmapped"));
    }

    #[test]
    fn test_join_list_accepts_objects() {
        let mapper = FieldMapper::new(vec![mapping("tags", "tags", FieldTransform::JoinList)]).unwrap();
        let detail = mapper
            .apply(&json!({"tags": [{"name": "sci-fi"}, " classic ", 3]}))
            .unwrap();
        assert_eq!(detail["tags"], json!("sci-fi, classic"));
    }

    #[test]
    fn test_rejects_invalid_table() {
        let duplicate = vec![
            mapping("a", "x", FieldTransform::Identity),
            mapping("b", "x", FieldTransform::Identity),
        ];
        assert!(FieldMapper::new(duplicate).is_err());
        assert!(FieldMapper::new(vec![mapping("a..b", "x", FieldTransform::Identity)]).is_err());
    }

    #[test]
    fn test_non_object_response() {
        let mapper = FieldMapper::new(vec![]).unwrap();
        assert!(mapper.apply(&json!([1, 2])).is_none());
        assert_eq!(mapper.apply(&json!({})).unwrap().len(), 0);
    }

    #[test]
    fn test_leading_integer() {
        assert_eq!(leading_integer("1,024 pages"), Some(1024));
        assert_eq!(leading_integer("n/a"), None);
    }
}
