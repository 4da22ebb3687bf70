//! Create-or-skip of recipes and offerings against the persisted index.

use std::collections::HashSet;
use std::sync::Arc;

use dnh_core::{Offering, StoredOffering, StoredRecipe, VenueSnapshot, OFFERING_CLASS, RECIPE_CLASS};
use dnh_storage::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::index::{IndexedOffering, IndexedRecipe, PersistedIndex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for EntityCounts {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub recipes: EntityCounts,
    pub offerings: EntityCounts,
}

impl std::ops::AddAssign for ReconcileReport {
    fn add_assign(&mut self, other: Self) {
        self.recipes += other.recipes;
        self.offerings += other.offerings;
    }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    attribution: Option<String>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, attribution: Option<String>) -> Self {
        Self { store, attribution }
    }

    /// Write whatever part of `snapshot` the store does not have yet. Fills
    /// `snapshot.offerings` with every offering the snapshot implies.
    pub async fn reconcile(&self, snapshot: &mut VenueSnapshot, index: &mut PersistedIndex) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.reconcile_recipes(snapshot, index, &mut report).await;
        self.reconcile_offerings(snapshot, index, &mut report).await;

        info!(
            venue = %snapshot.key,
            date = %snapshot.harvest_date,
            recipes_created = report.recipes.created,
            recipes_skipped = report.recipes.skipped,
            recipes_failed = report.recipes.failed,
            offerings_created = report.offerings.created,
            offerings_skipped = report.offerings.skipped,
            offerings_failed = report.offerings.failed,
            "snapshot reconciled"
        );
        report
    }

    async fn reconcile_recipes(&self, snapshot: &VenueSnapshot, index: &mut PersistedIndex, report: &mut ReconcileReport) {
        let mut seen = HashSet::new();
        for recipe in snapshot.recipes.iter().filter(|r| seen.insert(r.remote_id)) {
            if index.recipes.contains_key(&recipe.remote_id) {
                report.recipes.skipped += 1;
                continue;
            }

            let mut stored = StoredRecipe::from_recipe(recipe, self.attribution.as_deref());
            let body = match serde_json::to_value(&stored) {
                Ok(body) => body,
                Err(err) => {
                    warn!(recipe_id = recipe.remote_id, error = %err, "recipe not serializable");
                    report.recipes.failed += 1;
                    continue;
                }
            };
            match self.store.create(RECIPE_CLASS, body).await {
                Ok(object_id) => {
                    stored.object_id = Some(object_id);
                    index.recipes.insert(recipe.remote_id, IndexedRecipe::from(&stored));
                    report.recipes.created += 1;
                }
                Err(err) => {
                    warn!(venue = %snapshot.key, recipe_id = recipe.remote_id, error = %err, "recipe create failed");
                    report.recipes.failed += 1;
                }
            }
        }
    }

    async fn reconcile_offerings(
        &self,
        snapshot: &mut VenueSnapshot,
        index: &mut PersistedIndex,
        report: &mut ReconcileReport,
    ) {
        let mut offerings = Vec::new();
        for (meal_id, menu_id) in snapshot.offered_pairs() {
            let (Some(menu), Some(meal)) = (snapshot.menu(menu_id), snapshot.meal(meal_id)) else {
                warn!(venue = %snapshot.key, menu_id, meal_id, "recipes reference an unlisted menu or meal");
                report.offerings.failed += 1;
                continue;
            };
            let mut offering = Offering::new(&snapshot.key, snapshot.harvest_date, menu, meal);

            let mut refs = HashSet::new();
            offering.recipe_refs = snapshot
                .recipes
                .iter()
                .filter(|r| r.meal_id == meal_id && r.menu_id == menu_id)
                .filter_map(|r| index.recipe_object_id(r.remote_id))
                .filter(|id| refs.insert(*id))
                .map(str::to_string)
                .collect();

            if index.offerings.contains_key(&offering.uuid) {
                report.offerings.skipped += 1;
                offerings.push(offering);
                continue;
            }

            let mut stored = StoredOffering::from_offering(&offering);
            let created = match serde_json::to_value(&stored) {
                Ok(body) => self.store.create(OFFERING_CLASS, body).await.map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match created {
                Ok(object_id) => {
                    stored.object_id = Some(object_id);
                    index.offerings.insert(offering.uuid.clone(), IndexedOffering::from(&stored));
                    report.offerings.created += 1;
                }
                Err(error) => {
                    warn!(
                        venue = %snapshot.key,
                        menu = %offering.menu_name,
                        meal = %offering.meal_name,
                        %error,
                        "offering create failed"
                    );
                    report.offerings.failed += 1;
                }
            }
            offerings.push(offering);
        }
        snapshot.offerings = offerings;
    }
}
