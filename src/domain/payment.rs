//! Payment requests screened by the compliance pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A payment submitted for screening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Payment reference (generated as `TXN-<timestamp>-<hex>` when absent)
    #[serde(default = "default_payment_id")]
    pub payment_id: String,

    /// Name of the receiving party
    pub beneficiary_name: String,

    /// Amount in `currency` units; must be positive
    pub amount: f64,

    /// ISO 4217 code
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Requested execution time
    #[serde(default = "Utc::now")]
    pub timestamp_utc: DateTime<Utc>,

    /// Originating legal entity
    #[serde(default = "default_entity")]
    pub entity: String,

    /// Debited account
    #[serde(default = "default_account_id")]
    pub account_id: String,

    /// Payment rail
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Free text supplied by the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeform_notes: Option<String>,
}

fn default_payment_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
    format!("TXN-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_entity() -> String {
    "BankSubsidiary_TR".to_string()
}

fn default_account_id() -> String {
    "ACC-BAN-001".to_string()
}

fn default_channel() -> String {
    "SWIFT".to_string()
}

impl PaymentRequest {
    /// Create a request with default entity, account and channel
    pub fn new(beneficiary_name: impl Into<String>, amount: f64) -> Self {
        Self {
            payment_id: default_payment_id(),
            beneficiary_name: beneficiary_name.into(),
            amount,
            currency: default_currency(),
            timestamp_utc: Utc::now(),
            entity: default_entity(),
            account_id: default_account_id(),
            channel: default_channel(),
            freeform_notes: None,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = entity.into();
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.freeform_notes = Some(notes.into());
        self
    }

    /// Trim names and uppercase the currency code
    pub fn normalized(mut self) -> Self {
        self.beneficiary_name = self.beneficiary_name.trim().to_string();
        self.currency = self.currency.trim().to_uppercase();
        self.channel = self.channel.trim().to_uppercase();
        self
    }

    /// Check the invariants intake relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.beneficiary_name.trim().is_empty() {
            return Err(ValidationError::EmptyBeneficiary);
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ValidationError::NonPositiveAmount(self.amount));
        }
        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::InvalidCurrency(self.currency.clone()));
        }
        Ok(())
    }

    /// Payment context sent to agents alongside their prompt
    pub fn to_context(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// One-line description, e.g. "USD 250,000.00 to ACME Trading LLC"
    pub fn describe(&self) -> String {
        format!(
            "{} {} to {}",
            self.currency,
            format_amount(self.amount),
            self.beneficiary_name
        )
    }
}

/// Why a payment was rejected at intake
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Beneficiary name cannot be empty")]
    EmptyBeneficiary,

    #[error("Amount must be greater than zero (got {0})")]
    NonPositiveAmount(f64),

    #[error("Currency must be a three-letter code (got '{0}')")]
    InvalidCurrency(String),
}

/// Format with thousands separators and two decimals
pub fn format_amount(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (whole, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, frac)
}
