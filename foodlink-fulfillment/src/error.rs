use foodlink_catalog::PricingError;
use foodlink_core::models::DonationStatus;
use foodlink_core::payment::PaymentError;
use foodlink_core::repository::{EntityKind, StoreError};
use foodlink_core::CoreError;
use uuid::Uuid;

/// Everything a fulfillment operation can report.
///
/// `Validation`, `Conflict`, `Expired` and `PaymentFailed` are ordinary
/// business outcomes. `Integrity` means stored state broke an invariant; it
/// is always logged on the `foodlink::integrity` target before it is
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    /// Malformed or mismatched input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The actor may not perform this operation on this record
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: Uuid },

    /// Lost a claim race. Never retried.
    #[error("Someone else just claimed this donation")]
    AlreadyClaimed {
        donation_id: Uuid,
        status: DonationStatus,
        claimant_request_id: Option<Uuid>,
    },

    /// Lost a race on any other transition. Re-read and decide.
    #[error("Conflict on {entity} {id}: {detail}")]
    Conflict {
        entity: EntityKind,
        id: Uuid,
        detail: String,
    },

    /// Spoil deadline passed
    #[error("Donation {0} is no longer available")]
    Expired(Uuid),

    /// The payment authority declined. The claim has already been released.
    #[error("Payment declined for donation {donation_id}: {reason}")]
    PaymentFailed { donation_id: Uuid, reason: String },

    /// The authority took the payment but the claim moved before it could
    /// be recorded. Carries the transaction so it can be refunded.
    #[error("Payment {transaction_id} for donation {donation_id} was authorized but not recorded: {cause}")]
    UnrecordedPayment {
        donation_id: Uuid,
        transaction_id: String,
        #[source]
        cause: Box<FulfillmentError>,
    },

    /// The payment authority could not be reached. Nothing was changed.
    #[error("Payment authority unavailable: {0}")]
    PaymentUnavailable(String),

    #[error("Invalid transition: {entity} cannot take '{event}' while {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        event: String,
    },

    /// Stored state violates an invariant
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl FulfillmentError {
    /// Whether re-reading state and trying again can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FulfillmentError::Conflict { .. }
                | FulfillmentError::PaymentUnavailable(_)
                | FulfillmentError::Store(_)
        )
    }

    pub fn not_found(entity: EntityKind, id: Uuid) -> Self {
        FulfillmentError::NotFound { entity, id }
    }

    /// Log an invariant violation for operators and build the error
    pub fn integrity(donation_id: Uuid, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::error!(
            target: "foodlink::integrity",
            donation_id = %donation_id,
            detail = %detail,
            "Integrity violation, state left unchanged"
        );
        FulfillmentError::Integrity(format!("donation {}: {}", donation_id, detail))
    }
}

impl From<StoreError> for FulfillmentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { entity, id, detail } => {
                FulfillmentError::Conflict { entity, id, detail }
            }
            StoreError::NotFound { entity, id } => FulfillmentError::NotFound { entity, id },
            StoreError::Duplicate { entity, id } => {
                FulfillmentError::Conflict {
                    entity,
                    id,
                    detail: "record already exists".to_string(),
                }
            }
            StoreError::Corrupt(detail) => FulfillmentError::Integrity(detail),
            StoreError::Backend(detail) => FulfillmentError::Store(detail),
        }
    }
}

impl From<CoreError> for FulfillmentError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::ValidationError(msg) => FulfillmentError::Validation(msg),
            CoreError::InvalidTransition { entity, from, event } => {
                FulfillmentError::InvalidTransition { entity, from, event }
            }
        }
    }
}

impl From<PricingError> for FulfillmentError {
    fn from(e: PricingError) -> Self {
        FulfillmentError::Validation(e.to_string())
    }
}

impl From<PaymentError> for FulfillmentError {
    fn from(e: PaymentError) -> Self {
        match e {
            PaymentError::Unavailable(msg) => FulfillmentError::PaymentUnavailable(msg),
            PaymentError::Rejected(msg) => FulfillmentError::Validation(msg),
        }
    }
}

pub type FulfillmentResult<T> = Result<T, FulfillmentError>;
