//! Core domain model for DNH: catalog entities, content identities, and the
//! record shapes persisted in the remote object store.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

mod dietary;
mod identity;

pub use dietary::{annotation_tokens, strip_annotations, DietaryFlags};
pub use identity::{content_address, notification_identity, offering_identity, recipe_identity};

pub const CRATE_NAME: &str = "dnh-core";

/// Store class names.
pub const RECIPE_CLASS: &str = "Recipe";
pub const OFFERING_CLASS: &str = "Offering";
pub const SUBSCRIPTION_CLASS: &str = "Subscription";
pub const NOTIFICATION_CLASS: &str = "Notification";
pub const USER_CLASS: &str = "_User";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Menu {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meal {
    pub id: i64,
    pub name: String,
    pub code: String,
    /// Minutes past midnight as reported by the service.
    pub start_time: i64,
    pub end_time: i64,
}

/// Natural key of a harvested recipe. The same remote id recurs across menus and dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecipeKey {
    pub remote_id: i64,
    pub menu_id: i64,
    pub meal_id: i64,
    pub date: NaiveDate,
}

/// One nutrient line: an amount plus its percent of daily value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutrientValue {
    pub amount: Option<String>,
    pub daily_percent: Option<String>,
}

impl NutrientValue {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.daily_percent.is_none()
    }
}

/// Per-serving nutrient label plus dietary flags derived from the recipe name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutrientFacts {
    pub serving_size_text: Option<String>,
    pub serving_size_grams: Option<f64>,
    pub servings_per_container: Option<String>,
    pub calories: NutrientValue,
    pub calories_from_fat: NutrientValue,
    pub fat: NutrientValue,
    pub saturated_fat: NutrientValue,
    pub trans_fat: NutrientValue,
    pub monounsaturated_fat: NutrientValue,
    pub polyunsaturated_fat: NutrientValue,
    pub cholesterol: NutrientValue,
    pub sodium: NutrientValue,
    pub potassium: NutrientValue,
    pub carbohydrates: NutrientValue,
    pub fiber: NutrientValue,
    pub sugars: NutrientValue,
    pub protein: NutrientValue,
    pub vitamin_a: NutrientValue,
    pub vitamin_c: NutrientValue,
    pub vitamin_b6: NutrientValue,
    pub vitamin_b12: NutrientValue,
    pub thiamin: NutrientValue,
    pub riboflavin: NutrientValue,
    pub niacin: NutrientValue,
    pub folacin: NutrientValue,
    pub calcium: NutrientValue,
    pub iron: NutrientValue,
    pub zinc: NutrientValue,
    pub phosphorus: NutrientValue,
    pub dietary: DietaryFlags,
}

/// Enrichment state of a recipe. Only `Pending` recipes are sent for lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NutrientSlot {
    #[default]
    Pending,
    Populated(NutrientFacts),
    Failed { reason: String },
}

impl NutrientSlot {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn facts(&self) -> Option<&NutrientFacts> {
        match self {
            Self::Populated(facts) => Some(facts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub remote_id: i64,
    /// Raw display name, annotations included.
    pub name: String,
    pub category: String,
    pub rank: i64,
    pub mm_id: i64,
    pub menu_id: i64,
    pub meal_id: i64,
    pub date: NaiveDate,
    #[serde(default)]
    pub nutrients: NutrientSlot,
}

impl Recipe {
    pub fn key(&self) -> RecipeKey {
        RecipeKey {
            remote_id: self.remote_id,
            menu_id: self.menu_id,
            meal_id: self.meal_id,
            date: self.date,
        }
    }

    pub fn identity(&self) -> String {
        recipe_identity(&self.key())
    }

    pub fn display_name(&self) -> &str {
        strip_annotations(&self.name)
    }

    pub fn dietary_flags(&self) -> DietaryFlags {
        DietaryFlags::from_title(&self.name)
    }
}

/// A menu served for a meal on a date at a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    pub uuid: String,
    pub venue_key: String,
    pub date: NaiveDate,
    pub menu_id: i64,
    pub menu_name: String,
    pub meal_id: i64,
    pub meal_name: String,
    /// Store object ids of the recipes offered.
    #[serde(default)]
    pub recipe_refs: Vec<String>,
}

impl Offering {
    pub fn new(venue_key: &str, date: NaiveDate, menu: &Menu, meal: &Meal) -> Self {
        Self {
            uuid: offering_identity(date, &menu.name, &meal.name, venue_key),
            venue_key: venue_key.to_string(),
            date,
            menu_id: menu.id,
            menu_name: menu.name.clone(),
            meal_id: meal.id,
            meal_name: meal.name.clone(),
            recipe_refs: Vec::new(),
        }
    }
}

/// Harvested state of one venue for one date; also the on-disk snapshot artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueSnapshot {
    pub key: String,
    pub name: String,
    pub session: String,
    pub harvest_date: NaiveDate,
    #[serde(default)]
    pub menus: Vec<Menu>,
    #[serde(default)]
    pub meals: Vec<Meal>,
    #[serde(default)]
    pub recipes: Vec<Recipe>,
    #[serde(default)]
    pub offerings: Vec<Offering>,
}

impl VenueSnapshot {
    pub fn menu(&self, id: i64) -> Option<&Menu> {
        self.menus.iter().find(|m| m.id == id)
    }

    pub fn meal(&self, id: i64) -> Option<&Meal> {
        self.meals.iter().find(|m| m.id == id)
    }

    /// Distinct `(meal_id, menu_id)` pairs that returned at least one recipe, first-seen order.
    pub fn offered_pairs(&self) -> Vec<(i64, i64)> {
        let mut seen = BTreeSet::new();
        self.recipes
            .iter()
            .map(|r| (r.meal_id, r.menu_id))
            .filter(|pair| seen.insert(*pair))
            .collect()
    }
}

/// A subscriber's watch list of remote recipe ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscriber: String,
    pub recipes: BTreeSet<i64>,
}

/// Notification waiting to be posted for one subscriber and one offering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    pub uuid: String,
    pub recipe_id: i64,
    pub name: String,
    pub venue_key: String,
    pub menu_name: String,
    pub meal_name: String,
    pub date: NaiveDate,
    pub subscriber: String,
    pub seen: bool,
}

impl PendingNotification {
    pub fn new(
        recipe_id: i64,
        name: impl Into<String>,
        venue_key: &str,
        menu_name: &str,
        meal_name: &str,
        date: NaiveDate,
        subscriber: &str,
    ) -> Self {
        Self {
            uuid: notification_identity(date, menu_name, meal_name, venue_key, subscriber),
            recipe_id,
            name: name.into(),
            venue_key: venue_key.to_string(),
            menu_name: menu_name.to_string(),
            meal_name: meal_name.to_string(),
            date,
            subscriber: subscriber.to_string(),
            seen: false,
        }
    }

    /// Target instant: midnight UTC of the offering date.
    pub fn on_date(&self) -> DateTime<Utc> {
        date_to_utc(self.date)
    }
}

pub fn date_to_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

// ---- store record shapes ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    #[serde(rename = "__type")]
    pub kind: String,
    #[serde(rename = "className")]
    pub class_name: String,
    #[serde(rename = "objectId")]
    pub object_id: String,
}

impl Pointer {
    pub fn new(class_name: &str, object_id: &str) -> Self {
        Self {
            kind: "Pointer".to_string(),
            class_name: class_name.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDate {
    #[serde(rename = "__type")]
    pub kind: String,
    pub iso: DateTime<Utc>,
}

impl StoreDate {
    pub fn new(iso: DateTime<Utc>) -> Self {
        Self {
            kind: "Date".to_string(),
            iso,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecipe {
    #[serde(rename = "objectId", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(rename = "dartmouthId")]
    pub remote_id: i64,
    #[serde(default)]
    pub rank: i64,
    #[serde(default)]
    pub nutrients: NutrientFacts,
    #[serde(rename = "createdBy", default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Pointer>,
}

impl StoredRecipe {
    /// Store form of a harvested recipe: stripped name, flags folded into the nutrient record.
    pub fn from_recipe(recipe: &Recipe, attribution: Option<&str>) -> Self {
        let mut nutrients = recipe.nutrients.facts().cloned().unwrap_or_default();
        nutrients.dietary = recipe.dietary_flags();
        Self {
            object_id: None,
            uuid: recipe.identity(),
            name: recipe.display_name().to_string(),
            category: recipe.category.clone(),
            remote_id: recipe.remote_id,
            rank: recipe.rank,
            nutrients,
            created_by: attribution.map(|user| Pointer::new(USER_CLASS, user)),
        }
    }
}

/// `AddRelation` operation attaching recipe pointers to an offering on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationOp {
    #[serde(rename = "__op")]
    pub op: String,
    pub objects: Vec<Pointer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOffering {
    #[serde(rename = "objectId", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub uuid: String,
    #[serde(rename = "venueKey")]
    pub venue_key: String,
    pub day: u32,
    pub month: u32,
    pub year: i32,
    #[serde(rename = "menuName")]
    pub menu_name: String,
    #[serde(rename = "mealName")]
    pub meal_name: String,
    // Read back as a relation descriptor, which carries nothing we need.
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub recipes: Option<RelationOp>,
}

impl StoredOffering {
    pub fn from_offering(offering: &Offering) -> Self {
        let recipes = (!offering.recipe_refs.is_empty()).then(|| RelationOp {
            op: "AddRelation".to_string(),
            objects: offering
                .recipe_refs
                .iter()
                .map(|id| Pointer::new(RECIPE_CLASS, id))
                .collect(),
        });
        Self {
            object_id: None,
            uuid: offering.uuid.clone(),
            venue_key: offering.venue_key.clone(),
            day: offering.date.day(),
            month: offering.date.month(),
            year: offering.date.year(),
            menu_name: offering.menu_name.clone(),
            meal_name: offering.meal_name.clone(),
            recipes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSubscription {
    #[serde(rename = "objectId", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(rename = "User")]
    pub user: Pointer,
    #[serde(default)]
    pub recipes: Vec<i64>,
}

impl StoredSubscription {
    pub fn to_subscription(&self) -> Subscription {
        Subscription {
            subscriber: self.user.object_id.clone(),
            recipes: self.recipes.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNotification {
    #[serde(rename = "objectId", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub uuid: String,
    #[serde(rename = "recipeID")]
    pub recipe_id: i64,
    #[serde(rename = "recipeName")]
    pub recipe_name: String,
    pub day: u32,
    pub month: u32,
    pub year: i32,
    #[serde(default)]
    pub seen: bool,
    #[serde(rename = "for")]
    pub recipient: Pointer,
    #[serde(rename = "onDate")]
    pub on_date: StoreDate,
    #[serde(rename = "menuName")]
    pub menu_name: String,
    #[serde(rename = "mealName")]
    pub meal_name: String,
    #[serde(rename = "venueKey")]
    pub venue_key: String,
}

impl StoredNotification {
    pub fn from_pending(pending: &PendingNotification) -> Self {
        Self {
            object_id: None,
            uuid: pending.uuid.clone(),
            recipe_id: pending.recipe_id,
            recipe_name: pending.name.clone(),
            day: pending.date.day(),
            month: pending.date.month(),
            year: pending.date.year(),
            seen: pending.seen,
            recipient: Pointer::new(USER_CLASS, &pending.subscriber),
            on_date: StoreDate::new(pending.on_date()),
            menu_name: pending.menu_name.clone(),
            meal_name: pending.meal_name.clone(),
            venue_key: pending.venue_key.clone(),
        }
    }
}
