use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

/// What the payment authority is asked to approve
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequest {
    pub donation_id: Uuid,
    pub request_id: Uuid,
    pub payer_id: Uuid,
    pub amount: i64,
    pub currency: String,
}

/// Outcome of an authorization. A decline is a normal business result,
/// not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentResult {
    Authorized { transaction_id: String },
    Declined { reason: String },
}

impl PaymentResult {
    pub fn is_authorized(&self) -> bool {
        matches!(self, PaymentResult::Authorized { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment authority unreachable: {0}")]
    Unavailable(String),
    #[error("Payment authority rejected request: {0}")]
    Rejected(String),
}

/// External collaborator that approves or declines a charge. Never sees
/// card data; the core only keeps the returned transaction id.
#[async_trait]
pub trait PaymentAuthority: Send + Sync {
    async fn authorize(&self, request: &PaymentRequest) -> Result<PaymentResult, PaymentError>;
}

/// In-process authority for tests and local runs
pub struct MockPaymentAuthority {
    approve: AtomicBool,
    offline: AtomicBool,
}

impl MockPaymentAuthority {
    pub fn approving() -> Self {
        Self {
            approve: AtomicBool::new(true),
            offline: AtomicBool::new(false),
        }
    }

    pub fn declining() -> Self {
        Self {
            approve: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_approve(&self, approve: bool) {
        self.approve.store(approve, Ordering::SeqCst);
    }

    /// Simulate a transport failure on every call
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Opaque 96-bit token in hex
    pub fn issue_token() -> String {
        let bytes: [u8; 12] = rand::random();
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        format!("txn_{}", hex)
    }
}

impl Default for MockPaymentAuthority {
    fn default() -> Self {
        Self::approving()
    }
}

#[async_trait]
impl PaymentAuthority for MockPaymentAuthority {
    async fn authorize(&self, request: &PaymentRequest) -> Result<PaymentResult, PaymentError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PaymentError::Unavailable("mock authority offline".to_string()));
        }
        if request.amount < 0 {
            return Err(PaymentError::Rejected(format!(
                "negative amount {}",
                request.amount
            )));
        }

        debug!(
            donation_id = %request.donation_id,
            amount = request.amount,
            "Mock authorization"
        );
        if self.approve.load(Ordering::SeqCst) {
            Ok(PaymentResult::Authorized {
                transaction_id: Self::issue_token(),
            })
        } else {
            Ok(PaymentResult::Declined {
                reason: "card declined".to_string(),
            })
        }
    }
}
