//! Daily output-token budget per caller
//!
//! Consumption is keyed by UTC date; a stored date older than today reads as
//! zero, so rollover needs no background timer.

use crate::runtime::BudgetStore;
use chrono::{NaiveDate, Utc};

/// Outcome of a budget check. Both variants carry the caller's remaining tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Allowed(u64),
    Denied(u64),
}

pub struct TokenBudgetTracker<S: BudgetStore> {
    store: S,
    cap: u64,
}

impl<S: BudgetStore> TokenBudgetTracker<S> {
    pub fn new(store: S, cap: u64) -> Self {
        Self { store, cap }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Tokens consumed today by the caller
    pub async fn consumed_on(&self, caller_id: &str, today: NaiveDate) -> Result<u64, String> {
        let budget = self.store.get_budget(caller_id).await?;
        Ok(budget
            .filter(|b| b.date_utc == today)
            .map_or(0, |b| b.output_tokens_consumed))
    }

    pub async fn remaining_on(&self, caller_id: &str, today: NaiveDate) -> Result<u64, String> {
        let consumed = self.consumed_on(caller_id, today).await?;
        Ok(self.cap.saturating_sub(consumed))
    }

    pub async fn remaining(&self, caller_id: &str) -> Result<u64, String> {
        self.remaining_on(caller_id, today_utc()).await
    }

    /// Admit a request whose output is bounded by `ceiling` tokens.
    ///
    /// The reservation is advisory: nothing is recorded until [`Self::commit`],
    /// so concurrent requests from one caller may both pass and overshoot slightly.
    pub async fn check_and_reserve_on(
        &self,
        caller_id: &str,
        ceiling: u64,
        today: NaiveDate,
    ) -> Result<BudgetDecision, String> {
        let remaining = self.remaining_on(caller_id, today).await?;
        if remaining == 0 || ceiling > remaining {
            tracing::info!(caller_id, ceiling, remaining, "Daily token budget exceeded");
            return Ok(BudgetDecision::Denied(remaining));
        }
        Ok(BudgetDecision::Allowed(remaining))
    }

    pub async fn check_and_reserve(
        &self,
        caller_id: &str,
        ceiling: u64,
    ) -> Result<BudgetDecision, String> {
        self.check_and_reserve_on(caller_id, ceiling, today_utc())
            .await
    }

    /// Record actual consumption; returns the caller's remaining budget afterwards
    pub async fn commit_on(
        &self,
        caller_id: &str,
        actual_output_tokens: u64,
        today: NaiveDate,
    ) -> Result<u64, String> {
        let consumed = self
            .store
            .add_consumed(caller_id, today, actual_output_tokens)
            .await?;
        tracing::debug!(caller_id, actual_output_tokens, consumed, "Committed token usage");
        Ok(self.cap.saturating_sub(consumed))
    }

    pub async fn commit(&self, caller_id: &str, actual_output_tokens: u64) -> Result<u64, String> {
        self.commit_on(caller_id, actual_output_tokens, today_utc())
            .await
    }
}

fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}
