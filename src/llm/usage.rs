//! Token accounting and caller-side quota checks.

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::model::LlmModel;

/// Token counters for one logical call (or a sum of calls).
///
/// `total_tokens` is always `input_tokens + output_tokens`; the only ways to
/// build a value keep that true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Sum of both.
    pub total_tokens: u64,
}

impl Usage {
    /// Creates a usage triple.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    /// Returns `true` if nothing was consumed.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.input_tokens.saturating_add(rhs.input_tokens),
            self.output_tokens.saturating_add(rhs.output_tokens),
        )
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Usage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Caller-side quota consulted before each gateway call.
#[async_trait]
pub trait UsageLimiter: Send + Sync {
    /// Returns `false` when the caller may not spend more tokens on `model`.
    async fn allows(&self, model: LlmModel) -> bool;

    /// Records usage after a call finishes (successfully or not).
    async fn record(&self, model: LlmModel, usage: Usage);
}

/// Fixed token budget shared by every call in a run.
#[derive(Debug)]
pub struct TokenBudget {
    limit: u64,
    spent: AtomicU64,
}

impl TokenBudget {
    /// Creates a budget of `limit` total tokens.
    #[must_use]
    pub const fn new(limit: u64) -> Self {
        Self {
            limit,
            spent: AtomicU64::new(0),
        }
    }

    /// Tokens spent so far.
    #[must_use]
    pub fn spent(&self) -> u64 {
        self.spent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UsageLimiter for TokenBudget {
    async fn allows(&self, _model: LlmModel) -> bool {
        self.spent() < self.limit
    }

    async fn record(&self, _model: LlmModel, usage: Usage) {
        self.spent.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_keeps_total() {
        let mut usage = Usage::new(10, 5);
        usage += Usage::new(3, 2);
        assert_eq!(usage, Usage::new(13, 7));
        assert_eq!(usage.total_tokens, 20);
    }

    #[test]
    fn test_sum() {
        let total: Usage = [Usage::new(1, 1), Usage::new(2, 2)].into_iter().sum();
        assert_eq!(total.total_tokens, 6);
        assert!(Usage::default().is_zero());
    }

    #[tokio::test]
    async fn test_token_budget() {
        let budget = TokenBudget::new(100);
        assert!(budget.allows(LlmModel::Gpt4o).await);
        budget.record(LlmModel::Gpt4o, Usage::new(80, 20)).await;
        assert_eq!(budget.spent(), 100);
        assert!(!budget.allows(LlmModel::Gpt4o).await);
    }
}
