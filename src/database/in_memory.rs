// database/in_memory.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::database::store::TransactionStore;
use crate::errors::{AppError, Result};
use crate::models::transaction::{Transaction, TransactionStatus, TransactionUpdate};

/// Process-local transaction store.
///
/// Every mutation runs under the write lock, which is what makes the compare-and-set atomic.
/// Used when no `DATABASE_URL` is configured and throughout the tests.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<String, Transaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transactions.read().await.is_empty()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(&self, txn: Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;

        let conflict = transactions.values().find(|existing| {
            existing.id == txn.id
                || existing.checkout_request_id == txn.checkout_request_id
                || (txn.status.is_open()
                    && existing.status.is_open()
                    && existing.account_reference == txn.account_reference)
        });
        if let Some(existing) = conflict {
            return Err(AppError::DuplicateTransaction(format!(
                "conflicts with transaction {} ({})",
                existing.id, existing.checkout_request_id
            )));
        }

        transactions.insert(txn.id.clone(), txn);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(id).cloned())
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .find(|txn| txn.checkout_request_id == checkout_request_id)
            .cloned())
    }

    async fn find_open_by_account_reference(
        &self,
        account_reference: &str,
    ) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .find(|txn| txn.account_reference == account_reference && txn.status.is_open())
            .cloned())
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: TransactionStatus,
        update: TransactionUpdate,
    ) -> Result<bool> {
        if !expected.can_transition_to(update.status) {
            warn!("Refusing transition {} -> {} for {}", expected, update.status, id);
            return Ok(false);
        }

        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(id) {
            Some(txn) if txn.status == expected => {
                update.apply_to(txn, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|txn| txn.status == TransactionStatus::Pending && txn.created_at < cutoff)
            .cloned()
            .collect())
    }
}
