//! Content-address identities derived from natural keys.
//!
//! The store's own generated object ids are never used to re-identify an
//! entity; every persisted record carries one of these digests in its `uuid`
//! field instead.

use std::fmt::Display;

use chrono::{Datelike, NaiveDate};
use sha2::{Digest, Sha256};

use crate::RecipeKey;

const FIELD_SEPARATOR: u8 = 0x1f;

/// Hash an ordered sequence of fields into a 64-char lowercase hex digest.
///
/// Fields are joined with the ASCII unit separator so `(1, 11)` and `(11, 1)`
/// never hash the same.
pub fn content_address(fields: &[&dyn Display]) -> String {
    let mut hasher = Sha256::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(field.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn recipe_identity(key: &RecipeKey) -> String {
    content_address(&[
        &key.remote_id,
        &key.menu_id,
        &key.meal_id,
        &key.date.day(),
        &key.date.month(),
        &key.date.year(),
    ])
}

pub fn offering_identity(date: NaiveDate, menu_name: &str, meal_name: &str, venue_key: &str) -> String {
    content_address(&[
        &date.day(),
        &date.month(),
        &date.year(),
        &menu_name,
        &meal_name,
        &venue_key,
    ])
}

pub fn notification_identity(
    date: NaiveDate,
    menu_name: &str,
    meal_name: &str,
    venue_key: &str,
    subscriber: &str,
) -> String {
    content_address(&[
        &date.month(),
        &date.day(),
        &date.year(),
        &menu_name,
        &meal_name,
        &venue_key,
        &subscriber,
    ])
}
