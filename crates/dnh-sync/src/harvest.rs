//! Nutrient enrichment for harvested recipes.

use std::sync::Arc;

use dnh_adapters::CatalogClient;
use dnh_core::{NutrientSlot, Recipe};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::BoundedBatch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestReport {
    pub attempted: usize,
    pub populated: usize,
    pub failed: usize,
    /// Recipes whose slot was already populated or failed.
    pub skipped: usize,
}

impl std::ops::AddAssign for HarvestReport {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.populated += other.populated;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Copy)]
struct Lookup {
    slot: usize,
    remote_id: i64,
    mm_id: i64,
    rank: i64,
}

pub struct NutrientHarvester {
    client: CatalogClient,
    batch: BoundedBatch,
}

impl NutrientHarvester {
    pub fn new(client: CatalogClient, batch: BoundedBatch) -> Self {
        Self { client, batch }
    }

    /// Look up nutrient facts for every pending recipe. The slice is never
    /// resized; each result is written back to the slot it was requested for.
    pub async fn harvest(&self, recipes: &mut [Recipe], session: &str) -> HarvestReport {
        let lookups: Vec<Lookup> = recipes
            .iter()
            .enumerate()
            .filter(|(_, recipe)| recipe.nutrients.is_pending())
            .map(|(slot, recipe)| Lookup {
                slot,
                remote_id: recipe.remote_id,
                mm_id: recipe.mm_id,
                rank: recipe.rank,
            })
            .collect();

        let mut report = HarvestReport {
            attempted: lookups.len(),
            skipped: recipes.len() - lookups.len(),
            ..HarvestReport::default()
        };
        if lookups.is_empty() {
            return report;
        }

        let session: Arc<str> = Arc::from(session);
        let results = self
            .batch
            .run(lookups.clone(), |lookup| {
                let client = self.client.clone();
                let session = Arc::clone(&session);
                async move {
                    client
                        .nutrient_facts(&session, lookup.mm_id, lookup.remote_id, lookup.rank)
                        .await
                }
            })
            .await;

        for (lookup, result) in lookups.iter().zip(results) {
            let recipe = &mut recipes[lookup.slot];
            recipe.nutrients = match result {
                Ok(mut facts) => {
                    facts.dietary = recipe.dietary_flags();
                    report.populated += 1;
                    NutrientSlot::Populated(facts)
                }
                Err(err) => {
                    warn!(recipe_id = lookup.remote_id, error = %err, "nutrient lookup failed");
                    report.failed += 1;
                    NutrientSlot::Failed {
                        reason: err.to_string(),
                    }
                }
            };
        }

        info!(
            attempted = report.attempted,
            populated = report.populated,
            failed = report.failed,
            skipped = report.skipped,
            limit = self.batch.limit(),
            "nutrient harvest finished"
        );
        report
    }
}
