//! In-memory mirror of the persisted store, keyed by natural or content identity.

use std::collections::{BTreeSet, HashMap};

use dnh_core::{
    StoreDate, StoredNotification, StoredOffering, StoredRecipe, StoredSubscription, Subscription,
    NOTIFICATION_CLASS, OFFERING_CLASS, RECIPE_CLASS, SUBSCRIPTION_CLASS,
};
use dnh_storage::{ObjectStore, RemoteError, STORE_MAX_PAGE_SIZE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

/// The fields of a stored recipe that dedup needs. Rows in older layouts
/// (flat nutrient columns, no `uuid`) still decode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexedRecipe {
    #[serde(rename = "objectId", default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(rename = "dartmouthId")]
    pub remote_id: i64,
}

impl From<&StoredRecipe> for IndexedRecipe {
    fn from(stored: &StoredRecipe) -> Self {
        Self {
            object_id: stored.object_id.clone(),
            uuid: Some(stored.uuid.clone()),
            remote_id: stored.remote_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexedOffering {
    #[serde(rename = "objectId", default)]
    pub object_id: Option<String>,
    pub uuid: String,
}

impl From<&StoredOffering> for IndexedOffering {
    fn from(stored: &StoredOffering) -> Self {
        Self {
            object_id: stored.object_id.clone(),
            uuid: stored.uuid.clone(),
        }
    }
}

/// A notification without `onDate` is indexed for dedup but never expires.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexedNotification {
    #[serde(rename = "objectId", default)]
    pub object_id: Option<String>,
    pub uuid: String,
    #[serde(rename = "onDate", default)]
    pub on_date: Option<StoreDate>,
}

impl From<&StoredNotification> for IndexedNotification {
    fn from(stored: &StoredNotification) -> Self {
        Self {
            object_id: stored.object_id.clone(),
            uuid: stored.uuid.clone(),
            on_date: Some(stored.on_date.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedIndex {
    /// Remote recipe id -> stored recipe.
    pub recipes: HashMap<i64, IndexedRecipe>,
    /// Content identity -> stored offering.
    pub offerings: HashMap<String, IndexedOffering>,
    /// Remote recipe id -> subscriber ids watching it.
    pub subscriptions: HashMap<i64, BTreeSet<String>>,
    /// Content identity -> stored notification.
    pub notifications: HashMap<String, IndexedNotification>,
}

impl PersistedIndex {
    /// Scan all four classes. Any failed page aborts the build.
    pub async fn build(store: &dyn ObjectStore, page_size: usize) -> Result<Self, RemoteError> {
        let mut index = Self::default();

        for recipe in fetch_all::<IndexedRecipe>(store, RECIPE_CLASS, page_size).await? {
            index.recipes.entry(recipe.remote_id).or_insert(recipe);
        }
        for offering in fetch_all::<IndexedOffering>(store, OFFERING_CLASS, page_size).await? {
            index.offerings.entry(offering.uuid.clone()).or_insert(offering);
        }
        for subscription in fetch_all::<StoredSubscription>(store, SUBSCRIPTION_CLASS, page_size).await? {
            index.add_subscription(&subscription.to_subscription());
        }
        for notification in fetch_all::<IndexedNotification>(store, NOTIFICATION_CLASS, page_size).await? {
            index.notifications.entry(notification.uuid.clone()).or_insert(notification);
        }

        info!(
            recipes = index.recipes.len(),
            offerings = index.offerings.len(),
            watched_recipes = index.subscriptions.len(),
            notifications = index.notifications.len(),
            "persisted index built"
        );
        Ok(index)
    }

    pub fn add_subscription(&mut self, subscription: &Subscription) {
        for recipe_id in &subscription.recipes {
            self.subscriptions
                .entry(*recipe_id)
                .or_default()
                .insert(subscription.subscriber.clone());
        }
    }

    pub fn subscribers_for(&self, recipe_id: i64) -> Option<&BTreeSet<String>> {
        self.subscriptions.get(&recipe_id).filter(|set| !set.is_empty())
    }

    pub fn recipe_object_id(&self, remote_id: i64) -> Option<&str> {
        self.recipes.get(&remote_id)?.object_id.as_deref()
    }
}

/// Every object of `class`, decoded as `T`.
///
/// A page shorter than `page_size` is followed by one more request at the next
/// offset; paging only stops on an empty page. Stores that silently cap `limit`
/// below the requested size are therefore still read to the end. Objects that
/// fail to decode are logged and skipped.
pub async fn fetch_all<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    class: &str,
    page_size: usize,
) -> Result<Vec<T>, RemoteError> {
    let page_size = page_size.clamp(1, STORE_MAX_PAGE_SIZE);
    let mut decoded = Vec::new();
    let mut skip = 0usize;
    let mut after_short_page = false;

    loop {
        let page = store.list_page(class, skip, page_size).await?;
        if page.is_empty() {
            break;
        }
        if after_short_page {
            warn!(class, skip, page_size, "store returned objects after a short page; limit is capped server-side");
        }
        after_short_page = page.len() < page_size;
        skip += page.len();

        for object in page {
            let object_id = object_id_of(&object);
            match serde_json::from_value::<T>(object) {
                Ok(value) => decoded.push(value),
                Err(err) => warn!(class, object_id = %object_id, error = %err, "skipping undecodable object"),
            }
        }
    }

    debug!(class, count = decoded.len(), "class scanned");
    Ok(decoded)
}

fn object_id_of(object: &JsonValue) -> String {
    object
        .get("objectId")
        .and_then(JsonValue::as_str)
        .unwrap_or("<none>")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dnh_storage::MemoryObjectStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves at most `cap` objects per page regardless of the requested limit.
    struct CappedStore {
        inner: MemoryObjectStore,
        cap: usize,
        pages: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for CappedStore {
        async fn list_page(&self, class: &str, skip: usize, limit: usize) -> Result<Vec<JsonValue>, RemoteError> {
            self.pages.fetch_add(1, Ordering::SeqCst);
            self.inner.list_page(class, skip, limit.min(self.cap)).await
        }

        async fn create(&self, class: &str, body: JsonValue) -> Result<String, RemoteError> {
            self.inner.create(class, body).await
        }

        async fn delete(&self, class: &str, object_id: &str) -> Result<(), RemoteError> {
            self.inner.delete(class, object_id).await
        }
    }

    fn stored_recipe(remote_id: i64) -> JsonValue {
        json!({ "uuid": format!("r{remote_id}"), "name": "Soup", "dartmouthId": remote_id })
    }

    #[tokio::test]
    async fn pages_through_every_object() {
        let store = MemoryObjectStore::new();
        for id in 0..7 {
            store.insert(RECIPE_CLASS, stored_recipe(id)).await;
        }

        let recipes: Vec<IndexedRecipe> = fetch_all(&store, RECIPE_CLASS, 3).await.expect("scan");
        assert_eq!(recipes.len(), 7);
        assert_eq!(recipes[6].remote_id, 6);
    }

    #[tokio::test]
    async fn server_side_cap_does_not_truncate() {
        let store = CappedStore {
            inner: MemoryObjectStore::new(),
            cap: 2,
            pages: AtomicUsize::new(0),
        };
        for id in 0..5 {
            store.inner.insert(RECIPE_CLASS, stored_recipe(id)).await;
        }

        let recipes: Vec<IndexedRecipe> = fetch_all(&store, RECIPE_CLASS, 10).await.expect("scan");
        assert_eq!(recipes.len(), 5);
        // 2 + 2 + 1 + empty
        assert_eq!(store.pages.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn build_maps_all_four_classes() {
        let store = MemoryObjectStore::new();
        store.insert(RECIPE_CLASS, stored_recipe(752)).await;
        store.insert(RECIPE_CLASS, json!({ "uuid": "dup", "name": "Soup again", "dartmouthId": 752 })).await;
        store.insert(RECIPE_CLASS, json!({ "uuid": "broken", "name": "No id" })).await;
        store
            .insert(
                OFFERING_CLASS,
                json!({ "uuid": "o1", "venueKey": "CYC", "day": 26, "month": 9, "year": 2015,
                        "menuName": "Entrees", "mealName": "Lunch",
                        "recipes": { "__type": "Relation", "className": "Recipe" } }),
            )
            .await;
        for (user, recipes) in [("u1", json!([752, 9])), ("u2", json!([752]))] {
            store
                .insert(
                    SUBSCRIPTION_CLASS,
                    json!({ "User": { "__type": "Pointer", "className": "_User", "objectId": user }, "recipes": recipes }),
                )
                .await;
        }

        let index = PersistedIndex::build(&store, 1000).await.expect("build");

        assert_eq!(index.recipes.len(), 1);
        assert_eq!(index.recipes[&752].uuid.as_deref(), Some("r752"));
        assert!(index.recipe_object_id(752).is_some());
        assert!(index.offerings.contains_key("o1"));
        let watchers: Vec<&str> = index.subscribers_for(752).expect("watched").iter().map(String::as_str).collect();
        assert_eq!(watchers, vec!["u1", "u2"]);
        assert_eq!(index.subscribers_for(9).map(BTreeSet::len), Some(1));
        assert!(index.subscribers_for(1).is_none());
        assert!(index.notifications.is_empty());
    }

    #[tokio::test]
    async fn legacy_rows_still_land_in_the_index() {
        let store = MemoryObjectStore::new();
        store
            .insert(
                RECIPE_CLASS,
                json!({ "uuid": "r10", "name": "Chili", "dartmouthId": 10, "vegetarian": true,
                        "nutrients": { "calories": "210", "calories_p": "11", "fat": "7" } }),
            )
            .await;
        store.insert(RECIPE_CLASS, json!({ "name": "Stew", "dartmouthId": 11 })).await;
        store.insert(OFFERING_CLASS, json!({ "uuid": "o1", "day": "26" })).await;
        store.insert(NOTIFICATION_CLASS, json!({ "uuid": "n1", "seen": "no" })).await;

        let index = PersistedIndex::build(&store, 100).await.expect("build");

        assert_eq!(index.recipes.len(), 2);
        assert!(index.recipe_object_id(10).is_some());
        assert!(index.recipe_object_id(11).is_some());
        assert_eq!(index.recipes[&11].uuid, None);
        assert!(index.offerings.contains_key("o1"));
        assert_eq!(index.notifications["n1"].on_date, None);
    }
}
