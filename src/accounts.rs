use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Account {
    pub api_key: String,
    pub balance: i64,
    pub plan: String,
    pub last_reset: i64,
    pub daily_token_limit: i64,
    pub daily_token_expiration: Option<i64>,
    pub plan_expiration: Option<i64>,
}

impl Account {
    /// Short, log-safe prefix of the key.
    pub fn key_prefix(&self) -> &str {
        key_prefix(&self.api_key)
    }
}

pub fn key_prefix(api_key: &str) -> &str {
    match api_key.char_indices().nth(12) {
        Some((idx, _)) => &api_key[..idx],
        None => api_key,
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub api_key: String,
    pub plan: String,
    pub quota: i64,
    pub plan_expiration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccountStoreError {
    #[error("account not found")]
    NotFound,
    #[error("account already exists")]
    AlreadyExists,
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for AccountStoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::AlreadyExists,
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Every balance mutation is a single atomic statement on the store; callers
/// never read-modify-write a balance.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, api_key: &str) -> Result<Option<Account>, AccountStoreError>;

    async fn create_account(&self, account: NewAccount, now: i64)
    -> Result<Account, AccountStoreError>;

    /// Adds `delta` (negative for spend) and returns the new balance.
    async fn increment_balance(&self, api_key: &str, delta: i64) -> Result<i64, AccountStoreError>;

    /// Restores the balance to `quota` and starts a new period at `now`.
    async fn reset_period(
        &self,
        api_key: &str,
        quota: i64,
        now: i64,
        expires_at: i64,
    ) -> Result<(), AccountStoreError>;

    async fn change_plan(
        &self,
        api_key: &str,
        plan: &str,
        quota: i64,
        plan_expiration: Option<i64>,
    ) -> Result<(), AccountStoreError>;

    /// Accounts whose period started at least `period_secs` before `now`.
    async fn due_for_reset(
        &self,
        now: i64,
        period_secs: i64,
    ) -> Result<Vec<Account>, AccountStoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryAccountStore {
    inner: Arc<DashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get_account(&self, api_key: &str) -> Result<Option<Account>, AccountStoreError> {
        Ok(self.inner.get(api_key).map(|entry| entry.value().clone()))
    }

    async fn create_account(
        &self,
        account: NewAccount,
        now: i64,
    ) -> Result<Account, AccountStoreError> {
        let record = Account {
            api_key: account.api_key.clone(),
            balance: account.quota,
            plan: account.plan,
            last_reset: now,
            daily_token_limit: account.quota,
            daily_token_expiration: None,
            plan_expiration: account.plan_expiration,
        };
        match self.inner.entry(account.api_key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AccountStoreError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn increment_balance(&self, api_key: &str, delta: i64) -> Result<i64, AccountStoreError> {
        let mut entry = self
            .inner
            .get_mut(api_key)
            .ok_or(AccountStoreError::NotFound)?;
        entry.balance = entry.balance.saturating_add(delta);
        Ok(entry.balance)
    }

    async fn reset_period(
        &self,
        api_key: &str,
        quota: i64,
        now: i64,
        expires_at: i64,
    ) -> Result<(), AccountStoreError> {
        let mut entry = self
            .inner
            .get_mut(api_key)
            .ok_or(AccountStoreError::NotFound)?;
        entry.balance = quota;
        entry.daily_token_limit = quota;
        entry.last_reset = now;
        entry.daily_token_expiration = Some(expires_at);
        Ok(())
    }

    async fn change_plan(
        &self,
        api_key: &str,
        plan: &str,
        quota: i64,
        plan_expiration: Option<i64>,
    ) -> Result<(), AccountStoreError> {
        let mut entry = self
            .inner
            .get_mut(api_key)
            .ok_or(AccountStoreError::NotFound)?;
        entry.plan = plan.to_string();
        entry.balance = quota;
        entry.daily_token_limit = quota;
        entry.plan_expiration = plan_expiration;
        Ok(())
    }

    async fn due_for_reset(
        &self,
        now: i64,
        period_secs: i64,
    ) -> Result<Vec<Account>, AccountStoreError> {
        Ok(self
            .inner
            .iter()
            .filter(|entry| entry.last_reset.saturating_add(period_secs) <= now)
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[derive(Clone)]
pub struct SqliteAccountStore {
    pool: Pool<Sqlite>,
}

impl SqliteAccountStore {
    pub async fn connect(dsn: &str) -> Result<Self, String> {
        ensure_sqlite_file(dsn)?;
        let options = dsn
            .parse::<SqliteConnectOptions>()
            .map_err(|err| format!("database_dsn_parse_failed: {err}"))?
            .busy_timeout(Duration::from_secs(5));
        // Every in-memory connection is its own database.
        let pool = if dsn.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options.journal_mode(SqliteJournalMode::Wal))
                .await
        }
        .map_err(|err| err.to_string())?;
        Self::new(pool).await
    }

    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (\
             api_key TEXT PRIMARY KEY NOT NULL,\
             balance INTEGER NOT NULL,\
             plan TEXT NOT NULL,\
             last_reset INTEGER NOT NULL,\
             daily_token_limit INTEGER NOT NULL,\
             daily_token_expiration INTEGER,\
             plan_expiration INTEGER\
             )",
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }
}

const ACCOUNT_COLUMNS: &str = "api_key, balance, plan, last_reset, daily_token_limit, \
                               daily_token_expiration, plan_expiration";

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn get_account(&self, api_key: &str) -> Result<Option<Account>, AccountStoreError> {
        let row = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE api_key = ?"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_account(
        &self,
        account: NewAccount,
        now: i64,
    ) -> Result<Account, AccountStoreError> {
        let row = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (api_key, balance, plan, last_reset, daily_token_limit, plan_expiration) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&account.api_key)
        .bind(account.quota)
        .bind(&account.plan)
        .bind(now)
        .bind(account.quota)
        .bind(account.plan_expiration)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn increment_balance(&self, api_key: &str, delta: i64) -> Result<i64, AccountStoreError> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts SET balance = balance + ? WHERE api_key = ? RETURNING balance",
        )
        .bind(delta)
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        balance.ok_or(AccountStoreError::NotFound)
    }

    async fn reset_period(
        &self,
        api_key: &str,
        quota: i64,
        now: i64,
        expires_at: i64,
    ) -> Result<(), AccountStoreError> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = ?, daily_token_limit = ?, last_reset = ?, \
             daily_token_expiration = ? WHERE api_key = ?",
        )
        .bind(quota)
        .bind(quota)
        .bind(now)
        .bind(expires_at)
        .bind(api_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AccountStoreError::NotFound);
        }
        Ok(())
    }

    async fn change_plan(
        &self,
        api_key: &str,
        plan: &str,
        quota: i64,
        plan_expiration: Option<i64>,
    ) -> Result<(), AccountStoreError> {
        let result = sqlx::query(
            "UPDATE accounts SET plan = ?, balance = ?, daily_token_limit = ?, plan_expiration = ? \
             WHERE api_key = ?",
        )
        .bind(plan)
        .bind(quota)
        .bind(quota)
        .bind(plan_expiration)
        .bind(api_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AccountStoreError::NotFound);
        }
        Ok(())
    }

    async fn due_for_reset(
        &self,
        now: i64,
        period_secs: i64,
    ) -> Result<Vec<Account>, AccountStoreError> {
        let rows = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE last_reset + ? <= ?"
        ))
        .bind(period_secs)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
