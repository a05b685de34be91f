//! Bounded retry counters
//!
//! Patch operations and metric values each carry a `RetryBudget`. The counter only
//! ever goes down: a failure consumes one attempt, a success zeroes it, and an empty
//! budget is terminal.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Remaining attempts plus the error that consumed the last one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    /// Attempts left before the owning operation is abandoned
    #[serde(default)]
    pub attempts_remaining: u32,
    /// Message of the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of consuming an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetState {
    /// More attempts remain
    Retry,
    /// The final attempt was consumed
    Exhausted,
}

impl RetryBudget {
    /// Budget with `attempts` tries
    #[inline]
    #[must_use]
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts_remaining: attempts,
            last_error: None,
        }
    }

    /// Budget that never runs (stability-only patch operations)
    #[inline]
    #[must_use]
    pub fn spent() -> Self {
        Self::new(0)
    }

    /// Whether another attempt is allowed
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.attempts_remaining > 0
    }

    /// Record a successful attempt, closing the budget
    pub fn succeed(&mut self) {
        self.attempts_remaining = 0;
        self.last_error = None;
    }

    /// Record a failed attempt
    pub fn fail(&mut self, error: impl Into<String>) -> BudgetState {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        self.last_error = Some(error.into());
        if self.attempts_remaining == 0 {
            BudgetState::Exhausted
        } else {
            BudgetState::Retry
        }
    }
}
