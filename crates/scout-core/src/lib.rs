//! Core domain model for Scout: users, search subscriptions, discovered results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-core";

/// A registered account that owns search subscriptions and receives
/// notifications at `phone_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub phone_number: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for user registration; the password arrives already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub phone_number: String,
}

/// A saved free-text search query belonging to one user.
///
/// `last_checked` is the polling watermark: it marks the most recent completed
/// search attempt and is monotonically non-decreasing, with
/// `last_checked >= created_at` at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub query: String,
}

/// One discovered item for a subscription.
///
/// `external_id` (the item URL at the external source) is the dedup key: no
/// two results for the same subscription may share it. `notified` defaults to
/// false and is terminal once true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub found_at: DateTime<Utc>,
    pub notified: bool,
}

#[derive(Debug, Clone)]
pub struct NewSearchResult {
    pub subscription_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub found_at: DateTime<Utc>,
}

/// One candidate item returned by the match engine, before dedup.
///
/// All three fields are non-empty; adapters drop records that fail that check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub external_id: String,
    pub title: String,
    pub description: String,
}

impl Candidate {
    /// Trims all fields and returns `None` if any ends up empty.
    pub fn validated(external_id: &str, title: &str, description: &str) -> Option<Self> {
        let external_id = external_id.trim();
        let title = title.trim();
        let description = description.trim();
        if external_id.is_empty() || title.is_empty() || description.is_empty() {
            return None;
        }
        Some(Self {
            external_id: external_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
        })
    }
}
