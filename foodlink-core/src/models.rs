use chrono::{DateTime, Utc};
use foodlink_catalog::{FoodCategory, PriceBreakdown, Priceable, PricingEngine, PricingInput, Quantity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::location::Location;
use crate::{CoreError, CoreResult};

macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(CoreError::ValidationError(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

/// Donation status in the fulfillment lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonationStatus {
    Available,
    Claimed,
    AwaitingPickup,
    InTransit,
    Delivered,
    Billed,
    Expired,
}

status_strings!(DonationStatus {
    Available => "AVAILABLE",
    Claimed => "CLAIMED",
    AwaitingPickup => "AWAITING_PICKUP",
    InTransit => "IN_TRANSIT",
    Delivered => "DELIVERED",
    Billed => "BILLED",
    Expired => "EXPIRED",
});

impl DonationStatus {
    /// Statuses that read as `Expired` once the spoil deadline has passed.
    pub const LAPSING: [DonationStatus; 4] = [
        DonationStatus::Available,
        DonationStatus::Claimed,
        DonationStatus::AwaitingPickup,
        DonationStatus::InTransit,
    ];

    pub fn lapses_at_deadline(&self) -> bool {
        !matches!(
            self,
            DonationStatus::Delivered | DonationStatus::Billed | DonationStatus::Expired
        )
    }

    /// Statuses in which a claimant request must be linked.
    pub fn holds_claim(&self) -> bool {
        matches!(
            self,
            DonationStatus::Claimed
                | DonationStatus::AwaitingPickup
                | DonationStatus::InTransit
                | DonationStatus::Delivered
                | DonationStatus::Billed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
}

status_strings!(RequestStatus {
    Pending => "PENDING",
    Claimed => "CLAIMED",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

status_strings!(Urgency {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Offered,
    Accepted,
    Declined,
    Completed,
}

status_strings!(AssignmentStatus {
    Offered => "OFFERED",
    Accepted => "ACCEPTED",
    Declined => "DECLINED",
    Completed => "COMPLETED",
});

/// Why an assignment ended up declined. Kept for audit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeclineReason {
    /// A partner turned the offer down or backed out before pickup
    PartnerDeclined,
    /// The platform pulled the offer (claim released, donation expired)
    OfferWithdrawn,
}

status_strings!(DeclineReason {
    PartnerDeclined => "PARTNER_DECLINED",
    OfferWithdrawn => "OFFER_WITHDRAWN",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

status_strings!(BillStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Refunded => "REFUNDED",
});

/// A perishable lot offered by a donor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Donation {
    pub id: Uuid,
    pub donor_id: Uuid,
    pub title: String,
    pub category: FoodCategory,
    pub quantity: Quantity,
    pub listed_value: i64,
    pub location: Location,
    pub spoil_deadline: DateTime<Utc>,
    pub status: DonationStatus,
    pub claimant_request_id: Option<Uuid>,
    pub assigned_partner_id: Option<Uuid>,
    /// Bumped by the store on every persisted change
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Donation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        donor_id: Uuid,
        title: impl Into<String>,
        category: FoodCategory,
        quantity: Quantity,
        listed_value: i64,
        location: Location,
        spoil_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        if !quantity.is_positive() {
            return Err(CoreError::ValidationError(format!(
                "donation quantity must be positive, got {}",
                quantity
            )));
        }
        if listed_value <= 0 {
            return Err(CoreError::ValidationError(format!(
                "listed value must be positive, got {}",
                listed_value
            )));
        }
        if spoil_deadline <= now {
            return Err(CoreError::ValidationError(
                "spoil deadline must be after creation time".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            donor_id,
            title: title.into(),
            category,
            quantity,
            listed_value,
            location,
            spoil_deadline,
            status: DonationStatus::Available,
            claimant_request_id: None,
            assigned_partner_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.spoil_deadline
    }

    /// Status as every operation must see it: past the deadline, anything
    /// not yet delivered reads as `Expired` even before the sweeper runs.
    pub fn effective_status(&self, now: DateTime<Utc>) -> DonationStatus {
        if self.is_past_deadline(now) && self.status.lapses_at_deadline() {
            DonationStatus::Expired
        } else {
            self.status
        }
    }

    /// Copy with lazy expiry applied to `status`.
    pub fn observed(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.effective_status(now);
        self
    }
}

impl Priceable for Donation {
    fn pricing_input(&self) -> PricingInput {
        PricingInput {
            listed_value: self.listed_value,
            quantity: self.quantity.amount,
            category: self.category,
            spoil_deadline: self.spoil_deadline,
        }
    }
}

/// A recipient's ask for food
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoodRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub category: FoodCategory,
    pub quantity: Quantity,
    pub urgency: Urgency,
    pub location: Location,
    pub status: RequestStatus,
    pub donation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FoodRequest {
    pub fn new(
        requester_id: Uuid,
        category: FoodCategory,
        quantity: Quantity,
        urgency: Urgency,
        location: Location,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        if !quantity.is_positive() {
            return Err(CoreError::ValidationError(format!(
                "requested quantity must be positive, got {}",
                quantity
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            requester_id,
            category,
            quantity,
            urgency,
            location,
            status: RequestStatus::Pending,
            donation_id: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Offer/acceptance record binding a delivery partner to a donation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryAssignment {
    pub id: Uuid,
    pub donation_id: Uuid,
    /// Accepting partner, or for declined offers the partner who declined
    pub partner_id: Option<Uuid>,
    pub status: AssignmentStatus,
    pub decline_reason: Option<DeclineReason>,
    pub offered_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryAssignment {
    /// Open offer, visible to every eligible partner
    pub fn offer(donation_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            donation_id,
            partner_id: None,
            status: AssignmentStatus::Offered,
            decline_reason: None,
            offered_at: now,
            responded_at: None,
            completed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, AssignmentStatus::Offered | AssignmentStatus::Accepted)
    }
}

/// Charge for one fulfilled claim. Amounts never change after issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bill {
    pub id: Uuid,
    pub donation_id: Uuid,
    pub request_id: Uuid,
    pub donor_id: Uuid,
    pub receiver_id: Uuid,
    pub original_value: i64,
    pub final_price: i64,
    pub platform_fee_fraction: f64,
    pub platform_fee: i64,
    pub donor_payout: i64,
    pub breakdown: PriceBreakdown,
    pub transaction_id: String,
    pub status: BillStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bill {
    pub fn issue(
        donation: &Donation,
        request: &FoodRequest,
        breakdown: PriceBreakdown,
        pricing: &PricingEngine,
        transaction_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let platform_fee = pricing.platform_fee(breakdown.final_price);
        Self {
            id: Uuid::new_v4(),
            donation_id: donation.id,
            request_id: request.id,
            donor_id: donation.donor_id,
            receiver_id: request.requester_id,
            original_value: donation.listed_value,
            final_price: breakdown.final_price,
            platform_fee_fraction: pricing.config().platform_fee_fraction,
            platform_fee,
            donor_payout: breakdown.final_price - platform_fee,
            breakdown,
            transaction_id: transaction_id.into(),
            status: BillStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}
