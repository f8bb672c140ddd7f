//! §6 payload normalization rules for outgoing product writes, shared by
//! the write-path reconciler (G), periodic drift sync (I), and the bulk-sync
//! engine (F).

use serde_json::{Map, Value, json};

use crate::model::InventoryItem;

const READ_ONLY_PROPERTIES: &[&str] = &[
    "mtg_card_colors",
    "collector_number",
    "tournament_legal",
    "cmc",
    "mtg_rarity",
];

const TOP_LEVEL_FIELDS: &[&str] = &[
    "price",
    "quantity",
    "id",
    "graded",
    "description",
    "user_data_field",
];

/// Case-insensitive, abbreviation-tolerant condition normalization.
/// Unknown inputs normalize to `None` (§6: "unknown values are dropped").
pub fn normalize_condition(input: &str) -> Option<&'static str> {
    match input.trim().to_lowercase().as_str() {
        "mint" => Some("Mint"),
        "near mint" | "nm" => Some("Near Mint"),
        "slightly played" | "sp" | "lightly played" => Some("Slightly Played"),
        "moderately played" | "mp" => Some("Moderately Played"),
        "played" | "pl" => Some("Played"),
        "heavily played" | "hp" => Some("Heavily Played"),
        "poor" | "po" | "damaged" => Some("Poor"),
        _ => None,
    }
}

/// Cleans a raw `properties` object for outgoing transmission: drops
/// read-only and top-level-duplicate keys, normalizes `condition`, applies
/// the `mtg_foil`-omit-when-false rule, and lowercases+truncates
/// `mtg_language` to its first two characters.
pub fn normalize_properties_for_wire(properties: &Value) -> Value {
    let Some(obj) = properties.as_object() else {
        return json!({});
    };

    let mut out = Map::new();
    for (key, value) in obj {
        if READ_ONLY_PROPERTIES.contains(&key.as_str()) || TOP_LEVEL_FIELDS.contains(&key.as_str()) {
            continue;
        }

        match key.as_str() {
            "condition" => {
                if let Some(s) = value.as_str() {
                    if let Some(normalized) = normalize_condition(s) {
                        out.insert(key.clone(), Value::String(normalized.to_string()));
                    }
                    // unknown condition values are dropped entirely
                }
            }
            "mtg_foil" => {
                if value.as_bool() == Some(true) {
                    out.insert(key.clone(), Value::Bool(true));
                }
                // false is omitted: the remote silently ignores an
                // explicit `false` so omission is the only way to clear it
            }
            "mtg_language" => {
                if let Some(s) = value.as_str() {
                    let lowered: String = s.to_lowercase().chars().take(2).collect();
                    out.insert(key.clone(), Value::String(lowered));
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

/// Merge rule from §9 "Properties merging": booleans always overwrite;
/// strings overwrite when provided (including empty string, which clears
/// the key); absent keys in `patch` are preserved from `existing`. A JSON
/// `null` in `patch` is treated as an explicit key removal.
pub fn merge_properties(existing: Option<&Value>, patch: &Value) -> Value {
    let mut merged = existing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(patch_obj) = patch.as_object() {
        for (key, value) in patch_obj {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(merged)
}

/// Builds the wire representation of one product for `bulk_update` /
/// `bulk_create` (§6): `{ id, price?, quantity?, description?,
/// user_data_field?, graded?, properties? }`.
pub fn to_wire_product(item: &InventoryItem) -> Value {
    let mut out = Map::new();

    if let Some(external_stock_id) = &item.external_stock_id {
        out.insert("id".to_string(), Value::String(external_stock_id.clone()));
    }
    out.insert(
        "price".to_string(),
        json!((item.price_cents as f64) / 100.0),
    );
    out.insert("quantity".to_string(), json!(item.quantity));
    if let Some(description) = &item.description {
        out.insert("description".to_string(), json!(description));
    }
    if let Some(user_data_field) = &item.user_data_field {
        out.insert("user_data_field".to_string(), json!(user_data_field));
    }
    if let Some(graded) = item.graded {
        out.insert("graded".to_string(), json!(graded));
    }
    if let Some(properties) = &item.properties {
        let wire_properties = normalize_properties_for_wire(properties);
        if wire_properties.as_object().is_some_and(|o| !o.is_empty()) {
            out.insert("properties".to_string(), wire_properties);
        }
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_round_trip() {
        assert_eq!(normalize_condition("NM"), Some("Near Mint"));
        assert_eq!(normalize_condition("Near Mint"), Some("Near Mint"));
        assert_eq!(normalize_condition("near MINT"), Some("Near Mint"));
    }

    #[test]
    fn unknown_condition_drops() {
        assert_eq!(normalize_condition("pristine"), None);
    }

    #[test]
    fn common_condition_variants_map_correctly() {
        assert_eq!(normalize_condition("Lightly Played"), Some("Slightly Played"));
        assert_eq!(normalize_condition("Damaged"), Some("Poor"));
        assert_eq!(normalize_condition("mint"), Some("Mint"));
    }

    #[test]
    fn mtg_foil_omitted_when_false() {
        let props = json!({"mtg_foil": false, "signed": true});
        let wire = normalize_properties_for_wire(&props);
        assert!(wire.get("mtg_foil").is_none());
        assert_eq!(wire.get("signed"), Some(&json!(true)));
    }

    #[test]
    fn mtg_foil_present_when_true() {
        let props = json!({"mtg_foil": true});
        let wire = normalize_properties_for_wire(&props);
        assert_eq!(wire.get("mtg_foil"), Some(&json!(true)));
    }

    #[test]
    fn mtg_language_lowercased_and_truncated() {
        let props = json!({"mtg_language": "ENGLISH"});
        let wire = normalize_properties_for_wire(&props);
        assert_eq!(wire.get("mtg_language"), Some(&json!("en")));
    }

    #[test]
    fn read_only_and_top_level_keys_excluded() {
        let props = json!({
            "mtg_card_colors": ["R", "G"],
            "collector_number": "123",
            "tournament_legal": true,
            "cmc": 3,
            "mtg_rarity": "rare",
            "price": 100,
            "quantity": 5,
            "id": "abc",
            "graded": true,
            "description": "x",
            "user_data_field": "y",
            "signed": true
        });
        let wire = normalize_properties_for_wire(&props);
        assert_eq!(wire.as_object().unwrap().len(), 1);
        assert_eq!(wire.get("signed"), Some(&json!(true)));
    }

    #[test]
    fn merge_preserves_absent_keys_and_clears_on_null() {
        let existing = json!({"signed": true, "mtg_language": "en", "condition": "Near Mint"});
        let patch = json!({"signed": false, "mtg_language": null, "note": ""});
        let merged = merge_properties(Some(&existing), &patch);
        assert_eq!(merged.get("signed"), Some(&json!(false)));
        assert_eq!(merged.get("mtg_language"), None, "null patch value clears the key");
        assert_eq!(merged.get("condition"), Some(&json!("Near Mint")), "absent key preserved");
        assert_eq!(merged.get("note"), Some(&json!("")), "empty string overwrite clears but key remains");
    }
}
