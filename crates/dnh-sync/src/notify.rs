//! Subscriber notifications: derive intents from a snapshot, expand them per
//! subscriber, post the new ones, and prune expired ones.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dnh_core::{PendingNotification, StoredNotification, VenueSnapshot, NOTIFICATION_CLASS};
use dnh_storage::ObjectStore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::batch::BoundedBatch;
use crate::index::{IndexedNotification, PersistedIndex};

/// Buffer between the expansion producer and the collector.
pub const EXPANSION_CHANNEL_CAPACITY: usize = 64;

/// A subscribed recipe appearing on a menu, with the subscribers known at derivation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationIntent {
    pub recipe_id: i64,
    pub name: String,
    pub venue_key: String,
    pub menu_name: String,
    pub meal_name: String,
    pub date: NaiveDate,
    pub subscribers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyReport {
    pub intents: usize,
    pub expanded: usize,
    pub posted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for NotifyReport {
    fn add_assign(&mut self, other: Self) {
        self.intents += other.intents;
        self.expanded += other.expanded;
        self.posted += other.posted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub examined: usize,
    pub expired: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// One intent per snapshot recipe that has at least one subscriber.
pub fn collect_intents(snapshot: &VenueSnapshot, index: &PersistedIndex) -> Vec<NotificationIntent> {
    snapshot
        .recipes
        .iter()
        .filter_map(|recipe| {
            let subscribers = index.subscribers_for(recipe.remote_id)?;
            let (Some(menu), Some(meal)) = (snapshot.menu(recipe.menu_id), snapshot.meal(recipe.meal_id)) else {
                debug!(recipe_id = recipe.remote_id, "subscribed recipe has no menu or meal listing");
                return None;
            };
            Some(NotificationIntent {
                recipe_id: recipe.remote_id,
                name: recipe.display_name().to_string(),
                venue_key: snapshot.key.clone(),
                menu_name: menu.name.clone(),
                meal_name: meal.name.clone(),
                date: recipe.date,
                subscribers: subscribers.iter().cloned().collect(),
            })
        })
        .collect()
}

/// Expand intents into one pending notification per subscriber. A producer
/// task feeds a bounded channel; the full list is collected before returning.
pub async fn expand(intents: Vec<NotificationIntent>, capacity: usize) -> Vec<PendingNotification> {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let producer = tokio::spawn(async move {
        for intent in intents {
            for subscriber in &intent.subscribers {
                let pending = PendingNotification::new(
                    intent.recipe_id,
                    intent.name.clone(),
                    &intent.venue_key,
                    &intent.menu_name,
                    &intent.meal_name,
                    intent.date,
                    subscriber,
                );
                if tx.send(pending).await.is_err() {
                    return;
                }
            }
        }
    });

    let mut pending = Vec::new();
    while let Some(notification) = rx.recv().await {
        pending.push(notification);
    }
    if let Err(err) = producer.await {
        warn!(error = %err, "notification producer stopped early");
    }
    pending
}

pub struct NotificationPoster {
    store: Arc<dyn ObjectStore>,
    batch: BoundedBatch,
}

impl NotificationPoster {
    pub fn new(store: Arc<dyn ObjectStore>, batch: BoundedBatch) -> Self {
        Self { store, batch }
    }

    /// Derive, expand, and post notifications for one snapshot.
    pub async fn notify(&self, snapshot: &VenueSnapshot, index: &mut PersistedIndex) -> NotifyReport {
        let intents = collect_intents(snapshot, index);
        let intent_count = intents.len();
        let pending = expand(intents, EXPANSION_CHANNEL_CAPACITY).await;
        let expanded = pending.len();
        let mut report = self.post(pending, index).await;
        report.intents = intent_count;
        report.expanded = expanded;
        report
    }

    /// Post every notification whose identity is neither persisted nor already
    /// queued in this batch (first occurrence wins).
    pub async fn post(&self, pending: Vec<PendingNotification>, index: &mut PersistedIndex) -> NotifyReport {
        let mut report = NotifyReport::default();
        let mut queued_ids = HashSet::new();
        let mut queue = Vec::new();
        for notification in pending {
            if index.notifications.contains_key(&notification.uuid) || !queued_ids.insert(notification.uuid.clone()) {
                report.duplicates += 1;
                continue;
            }
            queue.push(StoredNotification::from_pending(&notification));
        }
        if queue.is_empty() {
            return report;
        }

        let results = self
            .batch
            .run(queue.clone(), |record| {
                let store = Arc::clone(&self.store);
                async move {
                    let body = serde_json::to_value(&record)?;
                    anyhow::Ok(store.create(NOTIFICATION_CLASS, body).await?)
                }
            })
            .await;

        for (mut record, result) in queue.into_iter().zip(results) {
            match result {
                Ok(object_id) => {
                    record.object_id = Some(object_id);
                    index.notifications.insert(record.uuid.clone(), IndexedNotification::from(&record));
                    report.posted += 1;
                }
                Err(err) => {
                    warn!(
                        recipe_id = record.recipe_id,
                        subscriber = %record.recipient.object_id,
                        error = %err,
                        "notification post failed"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(posted = report.posted, duplicates = report.duplicates, failed = report.failed, "notifications posted");
        report
    }

    /// Delete every known notification whose target date is more than one day before `now`.
    pub async fn prune(&self, index: &mut PersistedIndex, now: DateTime<Utc>) -> PruneReport {
        let cutoff = now - Duration::days(1);
        let mut report = PruneReport {
            examined: index.notifications.len(),
            ..PruneReport::default()
        };

        let mut expired = Vec::new();
        for (uuid, notification) in &index.notifications {
            let Some(on_date) = &notification.on_date else {
                continue;
            };
            if on_date.iso >= cutoff {
                continue;
            }
            match &notification.object_id {
                Some(object_id) => expired.push((uuid.clone(), object_id.clone())),
                None => {
                    warn!(uuid = %uuid, "expired notification has no object id");
                    report.failed += 1;
                }
            }
        }
        report.expired = expired.len() + report.failed;
        if expired.is_empty() {
            return report;
        }

        let results = self
            .batch
            .run(expired.clone(), |(_, object_id)| {
                let store = Arc::clone(&self.store);
                async move { store.delete(NOTIFICATION_CLASS, &object_id).await }
            })
            .await;

        for ((uuid, object_id), result) in expired.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    index.notifications.remove(&uuid);
                    report.deleted += 1;
                }
                Err(err) => {
                    warn!(object_id = %object_id, error = %err, "notification delete failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            expired = report.expired,
            deleted = report.deleted,
            failed = report.failed,
            "notifications pruned"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnh_core::{date_to_utc, notification_identity, Meal, Menu, NutrientSlot, Recipe, StoreDate, Subscription};
    use dnh_storage::MemoryObjectStore;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2015, 9, 26).expect("date")
    }

    fn snapshot() -> VenueSnapshot {
        let recipe = |remote_id: i64, menu_id: i64, meal_id: i64| Recipe {
            remote_id,
            name: "Grilled Chicken [gf,v] (d,n)".into(),
            category: "Entrees".into(),
            rank: 200,
            mm_id: 5,
            menu_id,
            meal_id,
            date: date(),
            nutrients: NutrientSlot::Pending,
        };
        VenueSnapshot {
            key: "CYC".into(),
            name: "Courtyard Cafe".into(),
            session: "CYC.s".into(),
            harvest_date: date(),
            menus: vec![Menu { id: 27, name: "Entrees".into() }],
            meals: vec![
                Meal { id: 1, name: "Lunch".into(), code: "L".into(), start_time: 660, end_time: 840 },
                Meal { id: 2, name: "Dinner".into(), code: "D".into(), start_time: 1020, end_time: 1200 },
            ],
            recipes: vec![recipe(752, 27, 1), recipe(752, 27, 2), recipe(9, 27, 1)],
            offerings: vec![],
        }
    }

    fn subscribed_index() -> PersistedIndex {
        let mut index = PersistedIndex::default();
        for subscriber in ["u1", "u2"] {
            index.add_subscription(&Subscription {
                subscriber: subscriber.into(),
                recipes: BTreeSet::from([752]),
            });
        }
        index
    }

    fn stored(uuid: &str, object_id: &str, on: DateTime<Utc>) -> IndexedNotification {
        IndexedNotification {
            object_id: Some(object_id.into()),
            uuid: uuid.into(),
            on_date: Some(StoreDate::new(on)),
        }
    }

    #[test]
    fn intents_cover_each_subscribed_appearance() {
        let intents = collect_intents(&snapshot(), &subscribed_index());
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].name, "Grilled Chicken ");
        assert_eq!(intents[0].meal_name, "Lunch");
        assert_eq!(intents[1].meal_name, "Dinner");
        assert_eq!(intents[0].subscribers, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn expansion_survives_a_tiny_channel() {
        let intents = collect_intents(&snapshot(), &subscribed_index());
        let pending = expand(intents, 1).await;
        assert_eq!(pending.len(), 4);
        assert!(pending.iter().all(|p| !p.seen));
        let ids: HashSet<_> = pending.iter().map(|p| p.uuid.as_str()).collect();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn posts_new_and_counts_existing_as_duplicates() {
        let store = Arc::new(MemoryObjectStore::new());
        let poster = NotificationPoster::new(store.clone(), BoundedBatch::new(3));
        let mut index = subscribed_index();
        let existing = notification_identity(date(), "Entrees", "Lunch", "CYC", "u1");
        index
            .notifications
            .insert(existing.clone(), stored(&existing, "old", date_to_utc(date())));

        let report = poster.notify(&snapshot(), &mut index).await;

        assert_eq!(report.intents, 2);
        assert_eq!(report.expanded, 4);
        assert_eq!(report.posted, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.count(NOTIFICATION_CLASS).await, 3);
        assert_eq!(index.notifications.len(), 4);

        let again = poster.notify(&snapshot(), &mut index).await;
        assert_eq!(again.posted, 0);
        assert_eq!(again.duplicates, 4);

        let body = &store.objects(NOTIFICATION_CLASS).await[0];
        assert_eq!(body["for"]["className"], "_User");
        assert_eq!(body["onDate"]["__type"], "Date");
        assert_eq!(body["seen"], json!(false));
    }

    #[tokio::test]
    async fn duplicate_identities_within_one_batch_post_once() {
        let store = Arc::new(MemoryObjectStore::new());
        let poster = NotificationPoster::new(store.clone(), BoundedBatch::new(2));
        let mut index = PersistedIndex::default();
        let make = |recipe_id| PendingNotification::new(recipe_id, "Soup", "CYC", "Entrees", "Lunch", date(), "u1");

        let report = poster.post(vec![make(1), make(2)], &mut index).await;

        assert_eq!(report.posted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.objects(NOTIFICATION_CLASS).await[0]["recipeID"], 1);
    }

    #[tokio::test]
    async fn prune_deletes_only_notifications_older_than_a_day() {
        let store = Arc::new(MemoryObjectStore::new());
        let poster = NotificationPoster::new(store.clone(), BoundedBatch::new(2));
        let now = Utc::now();
        let mut index = PersistedIndex::default();

        for (uuid, age) in [("stale", Duration::hours(49)), ("recent", Duration::hours(12))] {
            let object_id = store.insert(NOTIFICATION_CLASS, json!({ "uuid": uuid })).await;
            index.notifications.insert(uuid.into(), stored(uuid, &object_id, now - age));
        }

        let report = poster.prune(&mut index, now).await;

        assert_eq!(report, PruneReport { examined: 2, expired: 1, deleted: 1, failed: 0 });
        assert!(index.notifications.contains_key("recent"));
        assert!(!index.notifications.contains_key("stale"));
        assert_eq!(store.count(NOTIFICATION_CLASS).await, 1);
    }

    #[tokio::test]
    async fn notifications_without_a_date_are_kept() {
        let store = Arc::new(MemoryObjectStore::new());
        let poster = NotificationPoster::new(store.clone(), BoundedBatch::new(2));
        let object_id = store.insert(NOTIFICATION_CLASS, json!({ "uuid": "undated" })).await;
        let mut index = PersistedIndex::default();
        index.notifications.insert(
            "undated".into(),
            IndexedNotification { object_id: Some(object_id), uuid: "undated".into(), on_date: None },
        );

        let report = poster.prune(&mut index, Utc::now()).await;

        assert_eq!(report, PruneReport { examined: 1, expired: 0, deleted: 0, failed: 0 });
        assert_eq!(store.count(NOTIFICATION_CLASS).await, 1);
    }
}
