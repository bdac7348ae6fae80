pub mod mpesa_service;
pub mod payment_service;
pub mod phone;
pub mod reconciler;
pub mod timeout_sweep;
pub mod token_service;

#[cfg(test)]
pub(crate) mod test_support;
