//! Durable storage for users, subscriptions and discovered results.
//!
//! The pipeline and web crates depend only on the [`Store`] trait. `PgStore`
//! is the production implementation; [`MemStore`] backs tests and DB-less
//! development runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{NewSearchResult, NewSubscription, NewUser, SearchResult, Subscription, User};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of the uniqueness-checked result insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(SearchResult),
    /// A result with the same `(subscription_id, external_id)` already exists.
    /// Not an error: the uniqueness constraint is the dedup mechanism.
    Duplicate,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn create_subscription(&self, new: NewSubscription) -> Result<Subscription, StoreError>;
    async fn subscription_by_id(&self, id: Uuid) -> Result<Option<Subscription>, StoreError>;
    async fn subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>, StoreError>;
    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;
    async fn deactivate_subscription(&self, id: Uuid) -> Result<(), StoreError>;

    /// Advances the subscription watermark. The new value never moves the
    /// watermark backwards, whatever `checked_at` is.
    async fn touch_last_checked(
        &self,
        subscription_id: Uuid,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomic insert-if-absent keyed by `(subscription_id, external_id)`.
    async fn insert_result_if_absent(
        &self,
        new: NewSearchResult,
    ) -> Result<InsertOutcome, StoreError>;
    async fn results_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SearchResult>, StoreError>;
    /// Every result not yet delivered, across all subscriptions, oldest first.
    async fn unnotified_results(&self) -> Result<Vec<SearchResult>, StoreError>;
    /// Flips `notified` to true. Terminal: nothing ever flips it back.
    async fn mark_notified(&self, result_id: Uuid) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        phone_number: row.try_get("phone_number")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        query: row.try_get("search_query")?,
        created_at: row.try_get("created_at")?,
        last_checked: row.try_get("last_checked")?,
        active: row.try_get("active")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<SearchResult, sqlx::Error> {
    Ok(SearchResult {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        found_at: row.try_get("found_at")?,
        notified: row.try_get("notified")?,
    })
}

const USER_COLS: &str = "id, email, password_hash, phone_number, active, created_at";
const SUB_COLS: &str = "id, user_id, search_query, created_at, last_checked, active";
const RESULT_COLS: &str =
    "id, subscription_id, external_id, title, description, found_at, notified";

#[async_trait]
impl Store for PgStore {
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            password_hash: new.password_hash,
            phone_number: new.phone_number,
            active: true,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, phone_number, active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.phone_number)
        .bind(user.active)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLS} FROM users WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose().map_err(Into::into)
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose().map_err(Into::into)
    }

    async fn create_subscription(&self, new: NewSubscription) -> Result<Subscription, StoreError> {
        let now = Utc::now();
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            query: new.query,
            created_at: now,
            last_checked: now,
            active: true,
        };
        sqlx::query(
            "INSERT INTO subscriptions (id, user_id, search_query, created_at, last_checked, active) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(&sub.query)
        .bind(sub.created_at)
        .bind(sub.last_checked)
        .bind(sub.active)
        .execute(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn subscription_by_id(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SUB_COLS} FROM subscriptions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(subscription_from_row)
            .transpose()
            .map_err(Into::into)
    }

    async fn subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUB_COLS} FROM subscriptions WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(subscription_from_row)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUB_COLS} FROM subscriptions WHERE active ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(subscription_from_row)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn deactivate_subscription(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscriptions SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_last_checked(
        &self,
        subscription_id: Uuid,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // GREATEST keeps the watermark monotone even if clocks skew.
        sqlx::query(
            "UPDATE subscriptions SET last_checked = GREATEST(last_checked, $2) WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_result_if_absent(
        &self,
        new: NewSearchResult,
    ) -> Result<InsertOutcome, StoreError> {
        let result = SearchResult {
            id: Uuid::new_v4(),
            subscription_id: new.subscription_id,
            external_id: new.external_id,
            title: new.title,
            description: new.description,
            found_at: new.found_at,
            notified: false,
        };
        let done = sqlx::query(
            "INSERT INTO search_results \
             (id, subscription_id, external_id, title, description, found_at, notified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (subscription_id, external_id) DO NOTHING",
        )
        .bind(result.id)
        .bind(result.subscription_id)
        .bind(&result.external_id)
        .bind(&result.title)
        .bind(&result.description)
        .bind(result.found_at)
        .bind(result.notified)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 1 {
            Ok(InsertOutcome::Inserted(result))
        } else {
            Ok(InsertOutcome::Duplicate)
        }
    }

    async fn results_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLS} FROM search_results WHERE subscription_id = $1 ORDER BY found_at"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(result_from_row)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn unnotified_results(&self) -> Result<Vec<SearchResult>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLS} FROM search_results WHERE NOT notified ORDER BY found_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(result_from_row)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn mark_notified(&self, result_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE search_results SET notified = TRUE WHERE id = $1")
            .bind(result_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory [`Store`] with the same semantics as `PgStore`, including the
/// atomic insert-if-absent and the monotone watermark. Single mutex, so every
/// check-then-insert runs under one critical section.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    users: HashMap<Uuid, User>,
    subscriptions: HashMap<Uuid, Subscription>,
    results: Vec<SearchResult>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            password_hash: new.password_hash,
            phone_number: new.phone_number,
            active: true,
            created_at: Utc::now(),
        };
        self.inner.lock().await.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn create_subscription(&self, new: NewSubscription) -> Result<Subscription, StoreError> {
        let now = Utc::now();
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            query: new.query,
            created_at: now,
            last_checked: now,
            active: true,
        };
        self.inner
            .lock()
            .await
            .subscriptions
            .insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn subscription_by_id(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(self.inner.lock().await.subscriptions.get(&id).cloned())
    }

    async fn subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        let mut subs: Vec<_> = inner
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        let mut subs: Vec<_> = inner
            .subscriptions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn deactivate_subscription(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(sub) = self.inner.lock().await.subscriptions.get_mut(&id) {
            sub.active = false;
        }
        Ok(())
    }

    async fn touch_last_checked(
        &self,
        subscription_id: Uuid,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(sub) = self.inner.lock().await.subscriptions.get_mut(&subscription_id) {
            sub.last_checked = sub.last_checked.max(checked_at);
        }
        Ok(())
    }

    async fn insert_result_if_absent(
        &self,
        new: NewSearchResult,
    ) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let exists = inner.results.iter().any(|r| {
            r.subscription_id == new.subscription_id && r.external_id == new.external_id
        });
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }
        let result = SearchResult {
            id: Uuid::new_v4(),
            subscription_id: new.subscription_id,
            external_id: new.external_id,
            title: new.title,
            description: new.description,
            found_at: new.found_at,
            notified: false,
        };
        inner.results.push(result.clone());
        Ok(InsertOutcome::Inserted(result))
    }

    async fn results_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let inner = self.inner.lock().await;
        let mut results: Vec<_> = inner
            .results
            .iter()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.found_at);
        Ok(results)
    }

    async fn unnotified_results(&self) -> Result<Vec<SearchResult>, StoreError> {
        let inner = self.inner.lock().await;
        let mut results: Vec<_> = inner.results.iter().filter(|r| !r.notified).cloned().collect();
        results.sort_by_key(|r| r.found_at);
        Ok(results)
    }

    async fn mark_notified(&self, result_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(result) = inner.results.iter_mut().find(|r| r.id == result_id) {
            result.notified = true;
        }
        Ok(())
    }
}
