// database/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::transaction::{Transaction, TransactionStatus, TransactionUpdate};

/// Durable mapping from correlation ids to transaction state.
///
/// Both the initiator and the callback reconciler treat this as the single source of truth.
/// `compare_and_set_status` is the only way an existing record changes.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persists a freshly accepted transaction.
    ///
    /// Fails with `DuplicateTransaction` when the checkout request id is already known or when
    /// another open transaction holds the same account reference.
    async fn create(&self, txn: Transaction) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Transaction>>;

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Transaction>>;

    async fn find_open_by_account_reference(
        &self,
        account_reference: &str,
    ) -> Result<Option<Transaction>>;

    /// Atomically applies `update` if the stored status still equals `expected`.
    ///
    /// Returns `false` when the status moved underneath the caller, or when `update` is not a
    /// legal forward transition from `expected`.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: TransactionStatus,
        update: TransactionUpdate,
    ) -> Result<bool>;

    async fn list_pending_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>>;
}
