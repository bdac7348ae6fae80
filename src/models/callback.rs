// models/callback.rs
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Envelope of the STK push result webhook: `{ "Body": { "stkCallback": { .. } } }`.
#[derive(Debug, Deserialize)]
pub struct MpesaCallback {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,

    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,

    #[serde(rename = "ResultCode", deserialize_with = "int_or_numeric_string")]
    pub result_code: i64,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    // Unnamed items are kept but never match a lookup
    #[serde(rename = "Name", default)]
    pub name: String,

    // Balance is sent without a value
    #[serde(rename = "Value", default)]
    pub value: Value,
}

/// Success metadata resolved by item name. The provider does not fix item order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PaymentDetails {
    pub amount: Option<i64>,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<String>,
    pub phone_number: Option<String>,
}

impl CallbackMetadata {
    pub fn value_of(&self, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .map(|item| &item.value)
            .filter(|value| !value.is_null())
    }

    pub fn payment_details(&self) -> PaymentDetails {
        PaymentDetails {
            amount: self.value_of("Amount").and_then(value_as_i64),
            receipt_number: self.value_of("MpesaReceiptNumber").and_then(value_as_string),
            transaction_date: self.value_of("TransactionDate").and_then(value_as_string),
            phone_number: self.value_of("PhoneNumber").and_then(value_as_string),
        }
    }
}

impl StkCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    pub fn payment_details(&self) -> PaymentDetails {
        self.callback_metadata
            .as_ref()
            .map(CallbackMetadata::payment_details)
            .unwrap_or_default()
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_or_numeric_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("ResultCode is not numeric: {}", s))),
    }
}
