//! Translation from the menu service's position-indexed payloads into typed
//! values. All magic indices live here; callers only ever see a typed value or
//! a single `RemoteError::Shape`.

use dnh_core::{Meal, Menu, NutrientFacts, NutrientValue};
use dnh_storage::RemoteError;
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueListing {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeRow {
    pub name: String,
    pub category: String,
    pub remote_id: i64,
    pub rank: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeListing {
    pub mm_id: i64,
    pub rows: Vec<RecipeRow>,
}

fn field<'a>(value: &'a JsonValue, key: &str, ctx: &str) -> Result<&'a JsonValue, RemoteError> {
    value
        .get(key)
        .ok_or_else(|| RemoteError::shape(ctx, format!("missing field `{key}`")))
}

fn array<'a>(value: &'a JsonValue, ctx: &str) -> Result<&'a [JsonValue], RemoteError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| RemoteError::shape(ctx, format!("expected array, got {}", kind(value))))
}

fn at<'a>(row: &'a [JsonValue], idx: usize, ctx: &str) -> Result<&'a JsonValue, RemoteError> {
    row.get(idx)
        .ok_or_else(|| RemoteError::shape(ctx, format!("row has {} items, needed index {idx}", row.len())))
}

fn as_int(value: &JsonValue) -> Option<i64> {
    // The service emits ids as JSON floats.
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

fn int_at(row: &[JsonValue], idx: usize, ctx: &str) -> Result<i64, RemoteError> {
    let value = at(row, idx, ctx)?;
    as_int(value)
        .ok_or_else(|| RemoteError::shape(ctx, format!("index {idx}: expected integer, got {}", kind(value))))
}

fn str_at(row: &[JsonValue], idx: usize, ctx: &str) -> Result<String, RemoteError> {
    let value = at(row, idx, ctx)?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RemoteError::shape(ctx, format!("index {idx}: expected string, got {}", kind(value))))
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// `{"result": [["DDS", "53 Commons"], ...]}`
pub fn decode_venues(result: &JsonValue) -> Result<Vec<VenueListing>, RemoteError> {
    const CTX: &str = "get_available_sids";
    let rows = array(field(result, "result", CTX)?, CTX)?;
    let venues = rows
        .iter()
        .map(|row| {
            let row = array(row, CTX)?;
            Ok(VenueListing {
                key: str_at(row, 0, CTX)?,
                name: str_at(row, 1, CTX)?,
            })
        })
        .collect::<Result<Vec<_>, RemoteError>>()?;
    if venues.is_empty() {
        return Err(RemoteError::shape(CTX, "no venues listed"));
    }
    Ok(venues)
}

/// `{"sid": "DDS.4ef6..."}`
pub fn decode_session(result: &JsonValue) -> Result<String, RemoteError> {
    const CTX: &str = "create_context";
    match field(result, "sid", CTX)?.as_str() {
        Some(sid) if !sid.is_empty() => Ok(sid.to_string()),
        _ => Err(RemoteError::shape(CTX, "empty session id")),
    }
}

/// `{"menus_list": [[id, _, _, name, ...], ...]}`
pub fn decode_menus(result: &JsonValue) -> Result<Vec<Menu>, RemoteError> {
    const CTX: &str = "get_webmenu_list";
    array(field(result, "menus_list", CTX)?, CTX)?
        .iter()
        .map(|row| {
            let row = array(row, CTX)?;
            Ok(Menu {
                id: int_at(row, 0, CTX)?,
                name: str_at(row, 3, CTX)?,
            })
        })
        .collect()
}

/// `{"meals_list": {"1": [id, _, name, _, code, start, end], ...}}`, returned sorted by id.
pub fn decode_meals(result: &JsonValue) -> Result<Vec<Meal>, RemoteError> {
    const CTX: &str = "get_webmenu_meals_list";
    let listing = field(result, "meals_list", CTX)?
        .as_object()
        .ok_or_else(|| RemoteError::shape(CTX, "meals_list is not an object"))?;
    let mut meals = listing
        .values()
        .map(|row| {
            let row = array(row, CTX)?;
            Ok(Meal {
                id: int_at(row, 0, CTX)?,
                name: str_at(row, 2, CTX)?,
                code: str_at(row, 4, CTX)?,
                start_time: int_at(row, 5, CTX)?,
                end_time: int_at(row, 6, CTX)?,
            })
        })
        .collect::<Result<Vec<_>, RemoteError>>()?;
    meals.sort_by_key(|m| m.id);
    Ok(meals)
}

/// `{"mm_id": 22445, "recipeitems_list": [[name, [category, _, _, id, rank, ...]], ...]}`
pub fn decode_recipes(result: &JsonValue) -> Result<RecipeListing, RemoteError> {
    const CTX: &str = "get_recipes_for_menumealdate";
    let mm_value = field(result, "mm_id", CTX)?;
    let mm_id = as_int(mm_value)
        .ok_or_else(|| RemoteError::shape(CTX, format!("mm_id: expected integer, got {}", kind(mm_value))))?;
    let rows = match result.get("recipeitems_list") {
        None | Some(JsonValue::Null) => &[][..],
        Some(list) => array(list, CTX)?,
    };
    let rows = rows
        .iter()
        .map(|row| {
            let row = array(row, CTX)?;
            let detail = array(at(row, 1, CTX)?, CTX)?;
            Ok(RecipeRow {
                name: str_at(row, 0, CTX)?,
                category: str_at(detail, 0, CTX)?,
                remote_id: int_at(detail, 3, CTX)?,
                rank: int_at(detail, 4, CTX)?,
            })
        })
        .collect::<Result<Vec<_>, RemoteError>>()?;
    Ok(RecipeListing { mm_id, rows })
}

fn text(map: &Map<String, JsonValue>, key: &str) -> Option<String> {
    match map.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn nutrient(map: &Map<String, JsonValue>, key: &str) -> NutrientValue {
    NutrientValue {
        amount: text(map, key),
        daily_percent: text(map, &format!("{key}_p")),
    }
}

/// Nutrient label dictionary. Dietary flags are left default; they come from the recipe name.
pub fn decode_nutrients(result: &JsonValue) -> Result<NutrientFacts, RemoteError> {
    const CTX: &str = "get_nutrient_label_items";
    let map = result
        .as_object()
        .ok_or_else(|| RemoteError::shape(CTX, format!("expected object, got {}", kind(result))))?;
    if map.get("success").and_then(JsonValue::as_bool) == Some(false) {
        let message = text(map, "message").unwrap_or_else(|| "lookup unsuccessful".to_string());
        return Err(RemoteError::shape(CTX, message));
    }

    let serving_size_grams = match map.get("serving_size_grams") {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    };

    Ok(NutrientFacts {
        serving_size_text: text(map, "serving_size_text"),
        serving_size_grams,
        servings_per_container: text(map, "servings_per_container"),
        calories: nutrient(map, "calories"),
        calories_from_fat: nutrient(map, "calfat"),
        fat: nutrient(map, "fat"),
        saturated_fat: nutrient(map, "sfa"),
        trans_fat: nutrient(map, "fatrans"),
        monounsaturated_fat: nutrient(map, "mufa"),
        polyunsaturated_fat: nutrient(map, "pufa"),
        cholesterol: nutrient(map, "cholestrol"),
        sodium: nutrient(map, "sodium"),
        potassium: nutrient(map, "potassium"),
        carbohydrates: nutrient(map, "carbs"),
        fiber: nutrient(map, "fiberdtry"),
        sugars: nutrient(map, "sugars"),
        protein: nutrient(map, "protein"),
        vitamin_a: nutrient(map, "vita_iu"),
        vitamin_c: nutrient(map, "vitc"),
        vitamin_b6: nutrient(map, "vitb6"),
        vitamin_b12: nutrient(map, "vitb12"),
        thiamin: nutrient(map, "thiamin"),
        riboflavin: nutrient(map, "riboflavin"),
        niacin: nutrient(map, "niacin"),
        folacin: nutrient(map, "folacin"),
        calcium: nutrient(map, "calcium"),
        iron: nutrient(map, "iron"),
        zinc: nutrient(map, "zinc"),
        phosphorus: nutrient(map, "phosphorus"),
        dietary: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn venues_decode_key_and_name() {
        let result = json!({"cwp_version": "1.0", "result": [["DDS", "53 Commons"], ["CYC", "Courtyard Cafe"]]});
        let venues = decode_venues(&result).expect("decode");
        assert_eq!(venues[1], VenueListing { key: "CYC".into(), name: "Courtyard Cafe".into() });
    }

    #[test]
    fn empty_session_is_a_shape_failure() {
        assert!(matches!(decode_session(&json!({"sid": ""})), Err(RemoteError::Shape { .. })));
        assert_eq!(decode_session(&json!({"sid": "CYC.abc"})).expect("sid"), "CYC.abc");
    }

    #[test]
    fn menus_use_positions_zero_and_three() {
        let result = json!({"menus_list": [[27.0, "x", "y", "Entrees"], [28, null, null, "Grill"]]});
        let menus = decode_menus(&result).expect("decode");
        assert_eq!(menus, vec![
            Menu { id: 27, name: "Entrees".into() },
            Menu { id: 28, name: "Grill".into() },
        ]);
    }

    #[test]
    fn wrong_type_at_position_is_reported_once() {
        let result = json!({"menus_list": [["27", "x", "y", "Entrees"]]});
        match decode_menus(&result) {
            Err(RemoteError::Shape { context, detail }) => {
                assert_eq!(context, "get_webmenu_list");
                assert!(detail.contains("index 0"), "{detail}");
            }
            other => panic!("expected shape error, got {other:?}"),
        }
    }

    #[test]
    fn meals_decode_from_keyed_object_sorted_by_id() {
        let result = json!({"meals_list": {
            "2": [2.0, "", "Lunch", "", "L", 660.0, 840.0],
            "1": [1.0, "", "Breakfast", "", "B", 420.0, 600.0]
        }});
        let meals = decode_meals(&result).expect("decode");
        assert_eq!(meals.len(), 2);
        assert_eq!(meals[0].name, "Breakfast");
        assert_eq!(meals[1].code, "L");
        assert_eq!(meals[1].end_time, 840);
    }

    #[test]
    fn short_meal_row_is_a_shape_failure() {
        let result = json!({"meals_list": {"1": [1.0, "", "Breakfast"]}});
        assert!(matches!(decode_meals(&result), Err(RemoteError::Shape { .. })));
    }

    #[test]
    fn recipes_decode_nested_detail_row() {
        let result = json!({
            "mm_id": 22445,
            "recipeitems_list": [["Grilled Chicken [gf,v] (d,n)", ["Entrees", 0, 0, 752.0, 200.0]]],
            "cat_list": []
        });
        let listing = decode_recipes(&result).expect("decode");
        assert_eq!(listing.mm_id, 22445);
        assert_eq!(listing.rows, vec![RecipeRow {
            name: "Grilled Chicken [gf,v] (d,n)".into(),
            category: "Entrees".into(),
            remote_id: 752,
            rank: 200,
        }]);
    }

    #[test]
    fn null_recipe_list_is_empty() {
        let listing = decode_recipes(&json!({"mm_id": 1, "recipeitems_list": null})).expect("decode");
        assert!(listing.rows.is_empty());
    }

    #[test]
    fn nutrients_pair_amounts_with_percentages() {
        let result = json!({
            "success": true,
            "serving_size_text": "1 each",
            "serving_size_grams": 113.4,
            "calories": "210",
            "calories_p": "11",
            "cholestrol": "85",
            "fat": "",
            "vita_iu": 120
        });
        let facts = decode_nutrients(&result).expect("decode");
        assert_eq!(facts.serving_size_grams, Some(113.4));
        assert_eq!(facts.calories.amount.as_deref(), Some("210"));
        assert_eq!(facts.calories.daily_percent.as_deref(), Some("11"));
        assert_eq!(facts.cholesterol.amount.as_deref(), Some("85"));
        assert!(facts.fat.is_empty());
        assert_eq!(facts.vitamin_a.amount.as_deref(), Some("120"));
    }

    #[test]
    fn unsuccessful_label_lookup_fails() {
        let result = json!({"success": false, "message": "recipe not found"});
        match decode_nutrients(&result) {
            Err(RemoteError::Shape { detail, .. }) => assert_eq!(detail, "recipe not found"),
            other => panic!("expected shape error, got {other:?}"),
        }
    }
}
