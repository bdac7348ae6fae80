use std::sync::Arc;

use crate::config::AppConfig;
use crate::database::TransactionStore;
use crate::errors::Result;
use crate::services::mpesa_service::MpesaService;
use crate::services::payment_service::{PaymentService, PushSettings};
use crate::services::reconciler::CallbackReconciler;
use crate::services::token_service::TokenManager;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TransactionStore>,
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<CallbackReconciler>,
    pub environment: String,
    /// Non-secret configuration summary reported by the M-Pesa health endpoint.
    pub config_info: serde_json::Value,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        payments: Arc<PaymentService>,
        reconciler: Arc<CallbackReconciler>,
    ) -> Self {
        AppState {
            store,
            payments,
            reconciler,
            environment: "sandbox".to_string(),
            config_info: serde_json::Value::Null,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_config_info(mut self, config_info: serde_json::Value) -> Self {
        self.config_info = config_info;
        self
    }

    /// Wires the Daraja client, token cache, initiator and reconciler around `store`.
    pub fn from_config(config: &AppConfig, store: Arc<dyn TransactionStore>) -> Result<Self> {
        let mpesa_service = Arc::new(MpesaService::new(config)?);
        let tokens = Arc::new(TokenManager::new(
            mpesa_service.clone(),
            config.token_retry_backoff,
        ));

        let payments = Arc::new(PaymentService::new(
            store.clone(),
            tokens,
            mpesa_service,
            PushSettings::from(config),
        ));
        let reconciler = Arc::new(CallbackReconciler::new(
            store.clone(),
            config.callback_lookup_retries,
            config.callback_lookup_delay,
        ));

        Ok(AppState::new(store, payments, reconciler)
            .with_environment(&config.mpesa_environment)
            .with_config_info(config.get_config_info()))
    }
}
