use crate::accounts::{Account, AccountStore, AccountStoreError};
use crate::config::{DEFAULT_PLAN, PlanBook, PlanConfig};
use crate::error::{GatewayError, LimitType};
use std::sync::Arc;

pub const RESET_PERIOD_SECS: i64 = 86_400;

/// Authentication, plan bookkeeping and balance checks in front of every
/// dispatched request.
#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<dyn AccountStore>,
    plans: PlanBook,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn AccountStore>, plans: PlanBook) -> Self {
        Self { store, plans }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn plan_for(&self, account: &Account) -> PlanConfig {
        self.plans.resolve(&account.plan).1
    }

    pub async fn authenticate(&self, api_key: &str) -> Result<Account, GatewayError> {
        self.store
            .get_account(api_key)
            .await
            .map_err(store_error)?
            .ok_or_else(|| GatewayError::Unauthorized("Invalid API key".to_string()))
    }

    /// Moves an account whose paid plan has lapsed back to the default plan.
    pub async fn enforce_plan_expiry(
        &self,
        account: Account,
        now: i64,
    ) -> Result<Account, GatewayError> {
        let lapsed = account.plan != DEFAULT_PLAN
            && account.plan_expiration.is_some_and(|exp| now > exp);
        if !lapsed {
            return Ok(account);
        }
        let quota = self.plans.default_plan().tokens_per_day;
        tracing::info!(
            account = %account.key_prefix(),
            from_plan = %account.plan,
            "plan expired, demoting to default"
        );
        self.store
            .change_plan(&account.api_key, DEFAULT_PLAN, quota, None)
            .await
            .map_err(store_error)?;
        self.reload(&account.api_key).await
    }

    /// Starts a fresh period when the daily expiration is unset or has lapsed.
    pub async fn reconcile_daily_reset(
        &self,
        account: Account,
        now: i64,
    ) -> Result<Account, GatewayError> {
        let due = account.daily_token_expiration.is_none_or(|exp| now >= exp);
        if !due {
            return Ok(account);
        }
        let quota = self.plan_for(&account).tokens_per_day;
        self.store
            .reset_period(&account.api_key, quota, now, now + RESET_PERIOD_SECS)
            .await
            .map_err(store_error)?;
        tracing::debug!(account = %account.key_prefix(), quota, "daily quota reset");
        self.reload(&account.api_key).await
    }

    /// Static balance-versus-ceiling comparison in RPM, RPH, RPD order. An
    /// overdrawn account is rejected before any ceiling is consulted.
    pub fn check_limits(&self, account: &Account, plan: &PlanConfig) -> Result<(), GatewayError> {
        if account.balance < 0 {
            return Err(GatewayError::QuotaExceeded(LimitType::Balance));
        }
        for (limit, ceiling) in [
            (LimitType::Rpm, plan.rpm),
            (LimitType::Rph, plan.rph),
            (LimitType::Rpd, plan.rpd),
        ] {
            if account.balance > ceiling {
                return Err(GatewayError::QuotaExceeded(limit));
            }
        }
        Ok(())
    }

    /// Subtracts `amount` tokens atomically and returns the new balance.
    pub async fn debit(&self, api_key: &str, amount: i64) -> Result<i64, GatewayError> {
        let balance = self
            .store
            .increment_balance(api_key, -amount)
            .await
            .map_err(store_error)?;
        metrics::counter!("ozone_billed_tokens_total").increment(amount.max(0) as u64);
        Ok(balance)
    }

    /// Resets every account whose period is over. Returns how many were reset.
    pub async fn reset_sweep(&self, now: i64) -> Result<usize, GatewayError> {
        let due = self
            .store
            .due_for_reset(now, RESET_PERIOD_SECS)
            .await
            .map_err(store_error)?;
        let mut reset = 0usize;
        for account in due {
            let quota = self.plan_for(&account).tokens_per_day;
            match self
                .store
                .reset_period(&account.api_key, quota, now, now + RESET_PERIOD_SECS)
                .await
            {
                Ok(()) => reset += 1,
                Err(AccountStoreError::NotFound) => {}
                Err(err) => return Err(store_error(err)),
            }
        }
        Ok(reset)
    }

    async fn reload(&self, api_key: &str) -> Result<Account, GatewayError> {
        self.store
            .get_account(api_key)
            .await
            .map_err(store_error)?
            .ok_or(GatewayError::AccountNotFound)
    }
}

fn store_error(err: AccountStoreError) -> GatewayError {
    match err {
        AccountStoreError::NotFound => GatewayError::AccountNotFound,
        other => GatewayError::Internal(other.to_string()),
    }
}
