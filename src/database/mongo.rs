// database/mongo.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, DateTime as BsonDateTime, Document},
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
    Collection, Database, IndexModel,
};
use tracing::{info, warn};

use crate::database::store::TransactionStore;
use crate::errors::{AppError, Result};
use crate::models::transaction::{Transaction, TransactionStatus, TransactionUpdate};

const COLLECTION: &str = "mpesa_transactions";
const DUPLICATE_KEY: i32 = 11000;

/// MongoDB-backed store.
///
/// Uniqueness of `checkout_request_id`, and of `account_reference` among pending rows, is
/// enforced by indexes. The compare-and-set is a single `update_one` filtered on the expected
/// status, so the server decides the race.
#[derive(Clone)]
pub struct MongoTransactionStore {
    collection: Collection<Transaction>,
}

impl MongoTransactionStore {
    pub async fn new(db: &Database) -> Result<Self> {
        let store = MongoTransactionStore {
            collection: db.collection(COLLECTION),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let checkout_index = IndexModel::builder()
            .keys(doc! { "checkout_request_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("checkout_request_id_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        // Only pending rows are open once persisted
        let open_reference_index = IndexModel::builder()
            .keys(doc! { "account_reference": 1 })
            .options(
                IndexOptions::builder()
                    .name("open_account_reference_unique".to_string())
                    .unique(true)
                    .partial_filter_expression(
                        doc! { "status": TransactionStatus::Pending.as_str() },
                    )
                    .build(),
            )
            .build();

        let stale_index = IndexModel::builder()
            .keys(doc! { "status": 1, "created_at": 1 })
            .build();

        for index in [checkout_index, open_reference_index, stale_index] {
            self.collection.create_index(index).await?;
        }

        info!("Indexes ensured on {}", COLLECTION);
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl TransactionStore for MongoTransactionStore {
    async fn create(&self, txn: Transaction) -> Result<()> {
        match self.collection.insert_one(&txn).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(AppError::DuplicateTransaction(format!(
                "checkout {} / reference {}",
                txn.checkout_request_id, txn.account_reference
            ))),
            Err(e) => Err(AppError::MongoDB(e)),
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Transaction>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .collection
            .find_one(doc! { "checkout_request_id": checkout_request_id })
            .await?)
    }

    async fn find_open_by_account_reference(
        &self,
        account_reference: &str,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .collection
            .find_one(doc! {
                "account_reference": account_reference,
                "status": TransactionStatus::Pending.as_str(),
            })
            .await?)
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

        let filter = doc! { "_id": id, "status": expected.as_str() };
        let changes = doc! {
            "$set": {
                "status": update.status.as_str(),
                "result_code": update.result_code,
                "result_description": update.result_description,
                "receipt_number": update.receipt_number,
                "provider_transaction_time": update.provider_transaction_time,
                "paid_amount": update.paid_amount,
                "payer_phone": update.payer_phone,
                "updated_at": BsonDateTime::from_chrono(Utc::now()),
            }
        };

        let result = self.collection.update_one(filter, changes).await?;
        Ok(result.matched_count == 1)
    }

    async fn list_pending_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let cursor = self.collection.find(stale_pending_filter(cutoff)).await?;
        Ok(cursor.try_collect().await?)
    }
}

fn stale_pending_filter(cutoff: DateTime<Utc>) -> Document {
    doc! {
        "status": TransactionStatus::Pending.as_str(),
        "created_at": { "$lt": BsonDateTime::from_chrono(cutoff) },
    }
}
