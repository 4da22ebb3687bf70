//! Menu service adapter: typed catalog calls, the per-venue catalog fetcher,
//! and snapshot artifact loading for mock re-runs.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use dnh_core::{Meal, Menu, NutrientFacts, NutrientSlot, Recipe, VenueSnapshot};
use dnh_storage::{QueryService, RemoteError};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub mod wire;

pub use wire::{RecipeListing, RecipeRow, VenueListing};

pub const CRATE_NAME: &str = "dnh-adapters";

/// Stage of a venue harvest, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogStage {
    Session,
    Menus,
    Meals,
    Recipes { menu_id: i64, meal_id: i64 },
}

impl fmt::Display for CatalogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Menus => write!(f, "menu list"),
            Self::Meals => write!(f, "meal list"),
            Self::Recipes { menu_id, meal_id } => write!(f, "recipes for menu {menu_id} meal {meal_id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{stage} failed for venue {venue}: {source}")]
    Stage {
        stage: CatalogStage,
        venue: String,
        #[source]
        source: RemoteError,
    },
}

impl CatalogError {
    pub fn stage(&self) -> CatalogStage {
        match self {
            Self::Stage { stage, .. } => *stage,
        }
    }
}

/// Typed wrapper over the raw query service. Builds request params and decodes results.
#[derive(Clone)]
pub struct CatalogClient {
    service: Arc<dyn QueryService>,
}

fn procedure_params(session: &str, procedure: JsonValue) -> JsonValue {
    // The service expects the procedure arguments as an embedded JSON string.
    json!([{ "sid": session }, procedure.to_string()])
}

impl CatalogClient {
    pub fn new(service: Arc<dyn QueryService>) -> Self {
        Self { service }
    }

    pub async fn available_venues(&self) -> Result<Vec<VenueListing>, RemoteError> {
        let params = json!([null, json!({ "remoteProcedure": "get_available_sids" }).to_string()]);
        let result = self.service.call("get_available_sids", params).await?;
        wire::decode_venues(&result)
    }

    pub async fn create_session(&self, venue_key: &str) -> Result<String, RemoteError> {
        let result = self.service.call("create_context", json!([venue_key])).await?;
        wire::decode_session(&result)
    }

    pub async fn menus(&self, session: &str) -> Result<Vec<Menu>, RemoteError> {
        let params = procedure_params(session, json!({ "remoteProcedure": "get_webmenu_list" }));
        let result = self.service.call("get_webmenu_list", params).await?;
        wire::decode_menus(&result)
    }

    pub async fn meals(&self, session: &str) -> Result<Vec<Meal>, RemoteError> {
        let params = procedure_params(session, json!({ "remoteProcedure": "get_webmenu_meals_list" }));
        let result = self.service.call("get_webmenu_meals_list", params).await?;
        wire::decode_meals(&result)
    }

    pub async fn recipes(
        &self,
        session: &str,
        menu_id: i64,
        meal_id: i64,
        date: NaiveDate,
    ) -> Result<RecipeListing, RemoteError> {
        let params = procedure_params(
            session,
            json!({
                "menu_id": menu_id.to_string(),
                "meal_id": meal_id.to_string(),
                "remoteProcedure": "get_recipes_for_menumealdate",
                "day": date.day(),
                "month": date.month(),
                "year": date.year(),
                "use_menu_query": true,
                "order_by": "pubgroup-alpha",
                "cache": true,
            }),
        );
        let result = self.service.call("get_recipes_for_menumealdate", params).await?;
        wire::decode_recipes(&result)
    }

    pub async fn nutrient_facts(
        &self,
        session: &str,
        mm_id: i64,
        recipe_id: i64,
        rank: i64,
    ) -> Result<NutrientFacts, RemoteError> {
        let params = procedure_params(
            session,
            json!({
                "remoteProcedure": "get_nutrient_label_items",
                "mm_id": mm_id,
                "recipe_id": -recipe_id,
                "mmr_rank": rank,
                "rule": "fda|raw",
                "output": "dictionary",
                "options": "facts",
                "cache": true,
                "recdata": null,
            }),
        );
        let result = self.service.call("get_nutrient_label_items", params).await?;
        wire::decode_nutrients(&result)
    }
}

/// Sequential per-venue harvest: session, menus, meals, then every (menu, meal) listing.
#[derive(Clone)]
pub struct CatalogFetcher {
    client: CatalogClient,
}

impl CatalogFetcher {
    pub fn new(client: CatalogClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &CatalogClient {
        &self.client
    }

    pub async fn available_venues(&self) -> Result<Vec<VenueListing>, RemoteError> {
        self.client.available_venues().await
    }

    pub async fn fetch_venue(
        &self,
        venue_key: &str,
        display_name: &str,
        date: NaiveDate,
    ) -> Result<VenueSnapshot, CatalogError> {
        let fail = |stage: CatalogStage| {
            move |source: RemoteError| CatalogError::Stage {
                stage,
                venue: venue_key.to_string(),
                source,
            }
        };

        let session = self
            .client
            .create_session(venue_key)
            .await
            .map_err(fail(CatalogStage::Session))?;
        let menus = self.client.menus(&session).await.map_err(fail(CatalogStage::Menus))?;
        let meals = self.client.meals(&session).await.map_err(fail(CatalogStage::Meals))?;

        let mut recipes = Vec::new();
        for menu in &menus {
            for meal in &meals {
                let stage = CatalogStage::Recipes {
                    menu_id: menu.id,
                    meal_id: meal.id,
                };
                let listing = self
                    .client
                    .recipes(&session, menu.id, meal.id, date)
                    .await
                    .map_err(fail(stage))?;
                debug!(venue = venue_key, menu = %menu.name, meal = %meal.name, count = listing.rows.len(), "recipe listing");
                recipes.extend(listing.rows.into_iter().map(|row| Recipe {
                    remote_id: row.remote_id,
                    name: row.name,
                    category: row.category,
                    rank: row.rank,
                    mm_id: listing.mm_id,
                    menu_id: menu.id,
                    meal_id: meal.id,
                    date,
                    nutrients: NutrientSlot::Pending,
                }));
            }
        }

        info!(
            venue = venue_key,
            %date,
            menus = menus.len(),
            meals = meals.len(),
            recipes = recipes.len(),
            "catalog fetched"
        );

        Ok(VenueSnapshot {
            key: venue_key.to_string(),
            name: display_name.to_string(),
            session,
            harvest_date: date,
            menus,
            meals,
            recipes,
            offerings: Vec::new(),
        })
    }
}

/// Read a snapshot artifact written by a previous run.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<VenueSnapshot> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned responses keyed by method; `get_recipes_for_menumealdate` keyed by "menu:meal".
    #[derive(Default)]
    struct FakeService {
        responses: HashMap<String, JsonValue>,
        failing: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeService {
        fn key_for(method: &str, params: &JsonValue) -> String {
            if method != "get_recipes_for_menumealdate" {
                return method.to_string();
            }
            let inner: JsonValue = params[1]
                .as_str()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default();
            format!(
                "{}:{}",
                inner["menu_id"].as_str().unwrap_or_default(),
                inner["meal_id"].as_str().unwrap_or_default()
            )
        }
    }

    #[async_trait]
    impl QueryService for FakeService {
        async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue, RemoteError> {
            let key = Self::key_for(method, &params);
            self.calls.lock().unwrap().push(key.clone());
            if self.failing.contains(&key) {
                return Err(RemoteError::Rpc {
                    method: method.to_string(),
                    message: "boom".into(),
                });
            }
            Ok(self.responses.get(&key).cloned().unwrap_or_else(|| json!({"mm_id": 1, "recipeitems_list": []})))
        }
    }

    fn service() -> FakeService {
        let mut responses = HashMap::new();
        responses.insert("create_context".to_string(), json!({"sid": "CYC.session"}));
        responses.insert(
            "get_webmenu_list".to_string(),
            json!({"menus_list": [[27, 0, 0, "Entrees"], [28, 0, 0, "Grill"]]}),
        );
        responses.insert(
            "get_webmenu_meals_list".to_string(),
            json!({"meals_list": {"1": [1, 0, "Lunch", 0, "L", 660, 840], "2": [2, 0, "Dinner", 0, "D", 1020, 1200]}}),
        );
        responses.insert(
            "27:1".to_string(),
            json!({"mm_id": 900, "recipeitems_list": [["Soup [v]", ["Soups", 0, 0, 11, 100]]]}),
        );
        responses.insert(
            "28:2".to_string(),
            json!({"mm_id": 901, "recipeitems_list": [["Burger (d)", ["Grill", 0, 0, 12, 100]], ["Fries", ["Grill", 0, 0, 13, 200]]]}),
        );
        FakeService {
            responses,
            ..FakeService::default()
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2015, 9, 26).expect("date")
    }

    #[tokio::test]
    async fn fetch_venue_walks_every_menu_meal_pair() {
        let fake = Arc::new(service());
        let fetcher = CatalogFetcher::new(CatalogClient::new(fake.clone()));

        let snapshot = fetcher.fetch_venue("CYC", "Courtyard Cafe", date()).await.expect("fetch");

        assert_eq!(snapshot.session, "CYC.session");
        assert_eq!(snapshot.menus.len(), 2);
        assert_eq!(snapshot.meals.len(), 2);
        assert_eq!(snapshot.recipes.len(), 3);
        assert_eq!(snapshot.offered_pairs(), vec![(1, 27), (2, 28)]);
        let burger = snapshot.recipes.iter().find(|r| r.remote_id == 12).expect("burger");
        assert_eq!(burger.mm_id, 901);
        assert_eq!(burger.menu_id, 28);
        assert!(burger.nutrients.is_pending());

        let calls = fake.calls.lock().unwrap().clone();
        assert_eq!(calls.iter().filter(|c| c.contains(':')).count(), 4);
    }

    #[tokio::test]
    async fn stage_failure_aborts_the_venue() {
        let mut fake = service();
        fake.failing.push("28:1".to_string());
        let fetcher = CatalogFetcher::new(CatalogClient::new(Arc::new(fake)));

        let err = fetcher.fetch_venue("CYC", "Courtyard Cafe", date()).await.unwrap_err();
        assert_eq!(err.stage(), CatalogStage::Recipes { menu_id: 28, meal_id: 1 });
        assert!(err.to_string().contains("venue CYC"));
    }

    #[tokio::test]
    async fn session_failure_is_labelled() {
        let mut fake = service();
        fake.failing.push("create_context".to_string());
        let fetcher = CatalogFetcher::new(CatalogClient::new(Arc::new(fake)));

        let err = fetcher.fetch_venue("CYC", "Courtyard Cafe", date()).await.unwrap_err();
        assert_eq!(err.stage(), CatalogStage::Session);
    }

    #[tokio::test]
    async fn nutrient_lookup_negates_recipe_id() {
        struct Echo;
        #[async_trait]
        impl QueryService for Echo {
            async fn call(&self, _method: &str, params: JsonValue) -> Result<JsonValue, RemoteError> {
                let inner: JsonValue = serde_json::from_str(params[1].as_str().unwrap()).unwrap();
                assert_eq!(params[0]["sid"], "CYC.s");
                assert_eq!(inner["recipe_id"], -752);
                assert_eq!(inner["mm_id"], 22445);
                assert_eq!(inner["mmr_rank"], 200);
                Ok(json!({"success": true, "calories": "210"}))
            }
        }
        let client = CatalogClient::new(Arc::new(Echo));
        let facts = client.nutrient_facts("CYC.s", 22445, 752, 200).await.expect("facts");
        assert_eq!(facts.calories.amount.as_deref(), Some("210"));
    }

    #[test]
    fn snapshot_artifact_loads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.json");
        let snapshot = VenueSnapshot {
            key: "CYC".into(),
            name: "Courtyard Cafe".into(),
            session: "CYC.session".into(),
            harvest_date: date(),
            menus: vec![Menu { id: 27, name: "Entrees".into() }],
            meals: vec![],
            recipes: vec![],
            offerings: vec![],
        };
        fs::write(&path, serde_json::to_vec(&snapshot).expect("encode")).expect("write");
        assert_eq!(load_snapshot(&path).expect("load"), snapshot);
        assert!(load_snapshot(dir.path().join("missing.json")).is_err());
    }
}
