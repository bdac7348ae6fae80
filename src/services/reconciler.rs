// services/reconciler.rs
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::database::TransactionStore;
use crate::errors::{AppError, Result};
use crate::models::callback::{MpesaCallback, StkCallback};
use crate::models::transaction::{Transaction, TransactionStatus, TransactionUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The pending transaction moved to this status.
    Applied(TransactionStatus),
    /// Already resolved, or another handler won the race.
    Duplicate,
    /// No transaction carries this checkout request id.
    Orphan,
    /// A store failure was logged and swallowed.
    Deferred,
}

/// Applies STK callbacks to stored transactions.
///
/// Safe to invoke any number of times with the same payload: the only write is a
/// compare-and-set from `Pending`.
pub struct CallbackReconciler {
    store: Arc<dyn TransactionStore>,
    lookup_retries: u32,
    lookup_delay: Duration,
}

impl CallbackReconciler {
    pub fn new(store: Arc<dyn TransactionStore>, lookup_retries: u32, lookup_delay: Duration) -> Self {
        CallbackReconciler {
            store,
            lookup_retries,
            lookup_delay,
        }
    }

    /// Only an unparsable payload is an error; every business outcome is `Ok`.
    pub async fn handle_callback(&self, raw: &[u8]) -> Result<CallbackOutcome> {
        let callback: MpesaCallback = serde_json::from_slice(raw).map_err(|e| {
            warn!("Rejecting malformed M-Pesa callback: {}", e);
            AppError::callback_parse(e.to_string())
        })?;
        let stk = callback.body.stk_callback;

        info!(
            "Received M-Pesa callback {} / {}: {} {}",
            stk.checkout_request_id, stk.merchant_request_id, stk.result_code, stk.result_desc
        );

        match self.reconcile(&stk).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    "Failed to reconcile callback {}: {}",
                    stk.checkout_request_id, e
                );
                Ok(CallbackOutcome::Deferred)
            }
        }
    }

    async fn reconcile(&self, stk: &StkCallback) -> Result<CallbackOutcome> {
        let txn = match self.lookup(&stk.checkout_request_id).await? {
            Some(txn) => txn,
            None => {
                warn!(
                    "Orphan callback: no transaction for {} (merchant {})",
                    stk.checkout_request_id, stk.merchant_request_id
                );
                return Ok(CallbackOutcome::Orphan);
            }
        };

        if txn.status != TransactionStatus::Pending {
            info!(
                "Duplicate callback for {}: already {}",
                txn.checkout_request_id, txn.status
            );
            return Ok(CallbackOutcome::Duplicate);
        }

        let update = build_update(stk, &txn);
        let target = update.status;

        if self
            .store
            .compare_and_set_status(&txn.id, TransactionStatus::Pending, update)
            .await?
        {
            info!("Transaction {} is now {}", txn.checkout_request_id, target);
            Ok(CallbackOutcome::Applied(target))
        } else {
            info!(
                "Lost race resolving {}, treating as duplicate",
                txn.checkout_request_id
            );
            Ok(CallbackOutcome::Duplicate)
        }
    }

    /// The callback can beat the initiator's write in a distributed deployment, so a miss is
    /// retried a few times before it counts as an orphan.
    async fn lookup(&self, checkout_request_id: &str) -> Result<Option<Transaction>> {
        let mut attempt = 0;
        loop {
            if let Some(txn) = self
                .store
                .find_by_checkout_request_id(checkout_request_id)
                .await?
            {
                return Ok(Some(txn));
            }
            if attempt >= self.lookup_retries {
                return Ok(None);
            }
            attempt += 1;
            tokio::time::sleep(self.lookup_delay).await;
        }
    }
}

fn build_update(stk: &StkCallback, txn: &Transaction) -> TransactionUpdate {
    if !stk.is_success() {
        return TransactionUpdate::failed(stk.result_code, stk.result_desc.clone());
    }

    let details = stk.payment_details();
    if let Some(paid) = details.amount {
        if paid != txn.amount {
            warn!(
                "Amount mismatch on {}: expected {}, paid {}",
                txn.checkout_request_id, txn.amount, paid
            );
        }
    }
    if details.receipt_number.is_none() {
        warn!("Success callback for {} has no receipt number", txn.checkout_request_id);
    }

    TransactionUpdate::success(
        stk.result_code,
        stk.result_desc.clone(),
        details.receipt_number,
        details.transaction_date,
        details.amount,
        details.phone_number,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryTransactionStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn reconciler(store: &InMemoryTransactionStore) -> CallbackReconciler {
        CallbackReconciler::new(Arc::new(store.clone()), 0, Duration::ZERO)
    }

    async fn pending(store: &InMemoryTransactionStore, checkout: &str) -> Transaction {
        let mut txn = Transaction::initiated("254712345678", 1300, "ORDER-42", "Food order");
        txn.accept(checkout, "29115-34620561-1").unwrap();
        store.create(txn.clone()).await.unwrap();
        txn
    }

    fn success_payload(checkout: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": { "Item": [
                    { "Name": "MpesaReceiptNumber", "Value": "QAX1234" },
                    { "Name": "Amount", "Value": 1300 },
                    { "Name": "TransactionDate", "Value": 20240307090502u64 },
                    { "Name": "PhoneNumber", "Value": 254712345678u64 }
                ]}
            }}
        }))
        .unwrap()
    }

    fn failure_payload(checkout: &str, code: i64, desc: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout,
                "ResultCode": code,
                "ResultDesc": desc
            }}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn success_callback_resolves_pending_transaction() {
        let store = InMemoryTransactionStore::new();
        let txn = pending(&store, "ws_CO_1").await;

        let outcome = reconciler(&store)
            .handle_callback(&success_payload("ws_CO_1"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Applied(TransactionStatus::Success));

        let stored = store.find_by_id(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Success);
        assert_eq!(stored.receipt_number.as_deref(), Some("QAX1234"));
        assert_eq!(stored.paid_amount, Some(1300));
        assert_eq!(stored.provider_transaction_time.as_deref(), Some("20240307090502"));
        assert_eq!(stored.payer_phone.as_deref(), Some("254712345678"));
        assert_eq!(stored.result_code, Some(0));
    }

    #[tokio::test]
    async fn failure_callback_stores_description_verbatim() {
        let store = InMemoryTransactionStore::new();
        let txn = pending(&store, "ws_CO_1").await;

        let outcome = reconciler(&store)
            .handle_callback(&failure_payload("ws_CO_1", 1032, "Request cancelled by user"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Applied(TransactionStatus::Failed));

        let stored = store.find_by_id(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.result_code, Some(1032));
        assert_eq!(stored.result_description.as_deref(), Some("Request cancelled by user"));
        assert!(stored.receipt_number.is_none());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let store = InMemoryTransactionStore::new();
        let txn = pending(&store, "ws_CO_1").await;
        let reconciler = reconciler(&store);

        let payload = success_payload("ws_CO_1");
        let first = reconciler.handle_callback(&payload).await.unwrap();
        let after_first = store.find_by_id(&txn.id).await.unwrap().unwrap();
        let second = reconciler.handle_callback(&payload).await.unwrap();
        let after_second = store.find_by_id(&txn.id).await.unwrap().unwrap();

        assert_eq!(first, CallbackOutcome::Applied(TransactionStatus::Success));
        assert_eq!(second, CallbackOutcome::Duplicate);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn terminal_transaction_ignores_conflicting_callbacks() {
        let store = InMemoryTransactionStore::new();
        let txn = pending(&store, "ws_CO_1").await;
        let reconciler = reconciler(&store);

        reconciler
            .handle_callback(&failure_payload("ws_CO_1", 1032, "Request cancelled by user"))
            .await
            .unwrap();
        let resolved = store.find_by_id(&txn.id).await.unwrap().unwrap();

        let later = reconciler.handle_callback(&success_payload("ws_CO_1")).await.unwrap();
        assert_eq!(later, CallbackOutcome::Duplicate);
        assert_eq!(store.find_by_id(&txn.id).await.unwrap().unwrap(), resolved);
    }

    #[tokio::test]
    async fn concurrent_duplicates_apply_once() {
        let store = InMemoryTransactionStore::new();
        pending(&store, "ws_CO_1").await;
        let reconciler = Arc::new(reconciler(&store));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    reconciler
                        .handle_callback(&success_payload("ws_CO_1"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                CallbackOutcome::Applied(_) => applied += 1,
                CallbackOutcome::Duplicate => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn orphan_callback_is_acknowledged_without_mutation() {
        let store = InMemoryTransactionStore::new();
        let txn = pending(&store, "ws_CO_1").await;

        let outcome = reconciler(&store)
            .handle_callback(&success_payload("ws_CO_unknown"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Orphan);
        assert_eq!(store.find_by_id(&txn.id).await.unwrap().unwrap(), txn);
    }

    #[tokio::test]
    async fn late_create_is_found_by_lookup_retry() {
        let store = InMemoryTransactionStore::new();
        let reconciler = CallbackReconciler::new(
            Arc::new(store.clone()),
            5,
            Duration::from_millis(20),
        );

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pending(&writer, "ws_CO_late").await;
        });

        let outcome = reconciler
            .handle_callback(&success_payload("ws_CO_late"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Applied(TransactionStatus::Success));
    }

    #[tokio::test]
    async fn unparsable_payloads_are_parse_errors() {
        let store = InMemoryTransactionStore::new();
        let reconciler = reconciler(&store);

        for raw in [
            b"not json".to_vec(),
            b"{}".to_vec(),
            br#"{"Body":{}}"#.to_vec(),
            br#"{"Body":{"stkCallback":{"CheckoutRequestID":"ws_CO_1","ResultCode":0}}}"#.to_vec(),
        ] {
            assert!(matches!(
                reconciler.handle_callback(&raw).await,
                Err(AppError::CallbackParseError(_))
            ));
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl TransactionStore for BrokenStore {
        async fn create(&self, _txn: Transaction) -> Result<()> {
            Err(AppError::provider_request("unused"))
        }
        async fn find_by_id(&self, _id: &str) -> Result<Option<Transaction>> {
            Ok(None)
        }
        async fn find_by_checkout_request_id(&self, _id: &str) -> Result<Option<Transaction>> {
            Err(AppError::DuplicateTransaction("store offline".into()))
        }
        async fn find_open_by_account_reference(&self, _r: &str) -> Result<Option<Transaction>> {
            Ok(None)
        }
        async fn compare_and_set_status(
            &self,
            _id: &str,
            _expected: TransactionStatus,
            _update: TransactionUpdate,
        ) -> Result<bool> {
            Ok(false)
        }
        async fn list_pending_created_before(&self, _c: DateTime<Utc>) -> Result<Vec<Transaction>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn store_failures_are_absorbed() {
        let reconciler = CallbackReconciler::new(Arc::new(BrokenStore), 0, Duration::ZERO);
        let outcome = reconciler
            .handle_callback(&success_payload("ws_CO_1"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Deferred);
    }
}
