use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationClaimedEvent {
    pub donation_id: Uuid,
    pub request_id: Uuid,
    pub requester_id: Uuid,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOfferedEvent {
    pub donation_id: Uuid,
    pub assignment_id: Uuid,
    pub pickup_location: String,
    pub spoil_deadline: DateTime<Utc>,
    pub offered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAcceptedEvent {
    pub donation_id: Uuid,
    pub assignment_id: Uuid,
    pub partner_id: Uuid,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryDeclinedEvent {
    pub donation_id: Uuid,
    pub assignment_id: Uuid,
    pub partner_id: Option<Uuid>,
    pub reason: String,
    pub declined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickupStartedEvent {
    pub donation_id: Uuid,
    pub partner_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryCompletedEvent {
    pub donation_id: Uuid,
    pub request_id: Uuid,
    pub partner_id: Uuid,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillFinalizedEvent {
    pub bill_id: Uuid,
    pub donation_id: Uuid,
    pub request_id: Uuid,
    pub final_price: i64,
    pub platform_fee: i64,
    pub transaction_id: String,
    pub finalized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationReleasedEvent {
    pub donation_id: Uuid,
    pub request_id: Uuid,
    pub reason: String,
    pub released_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationExpiredEvent {
    pub donation_id: Uuid,
    pub previous_status: String,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationSettledEvent {
    pub donation_id: Uuid,
    pub bill_id: Uuid,
    pub settled_at: DateTime<Utc>,
}

/// Every event the fulfillment core can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    DonationClaimed(DonationClaimedEvent),
    DeliveryOffered(DeliveryOfferedEvent),
    DeliveryAccepted(DeliveryAcceptedEvent),
    DeliveryDeclined(DeliveryDeclinedEvent),
    PickupStarted(PickupStartedEvent),
    DeliveryCompleted(DeliveryCompletedEvent),
    BillFinalized(BillFinalizedEvent),
    DonationReleased(DonationReleasedEvent),
    DonationExpired(DonationExpiredEvent),
    DonationSettled(DonationSettledEvent),
}

impl DomainEvent {
    /// The donation this event belongs to. Ordering is only guaranteed per donation.
    pub fn donation_id(&self) -> Uuid {
        match self {
            DomainEvent::DonationClaimed(e) => e.donation_id,
            DomainEvent::DeliveryOffered(e) => e.donation_id,
            DomainEvent::DeliveryAccepted(e) => e.donation_id,
            DomainEvent::DeliveryDeclined(e) => e.donation_id,
            DomainEvent::PickupStarted(e) => e.donation_id,
            DomainEvent::DeliveryCompleted(e) => e.donation_id,
            DomainEvent::BillFinalized(e) => e.donation_id,
            DomainEvent::DonationReleased(e) => e.donation_id,
            DomainEvent::DonationExpired(e) => e.donation_id,
            DomainEvent::DonationSettled(e) => e.donation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::DonationClaimed(_) => "donation_claimed",
            DomainEvent::DeliveryOffered(_) => "delivery_offered",
            DomainEvent::DeliveryAccepted(_) => "delivery_accepted",
            DomainEvent::DeliveryDeclined(_) => "delivery_declined",
            DomainEvent::PickupStarted(_) => "pickup_started",
            DomainEvent::DeliveryCompleted(_) => "delivery_completed",
            DomainEvent::BillFinalized(_) => "bill_finalized",
            DomainEvent::DonationReleased(_) => "donation_released",
            DomainEvent::DonationExpired(_) => "donation_expired",
            DomainEvent::DonationSettled(_) => "donation_settled",
        }
    }

    /// One topic per event type, e.g. `foodlink.delivery_offered`.
    pub fn topic(&self) -> String {
        format!("foodlink.{}", self.name())
    }
}

/// An event as it leaves the outbox.
///
/// `sequence` is the donation version the event was recorded at. Recording
/// an event bumps that version, so sequences are unique per donation and
/// consumers reading several topics can restore order and drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub donation_id: Uuid,
    pub sequence: i64,
    pub recorded_at: DateTime<Utc>,
    pub event: DomainEvent,
}

impl EventEnvelope {
    pub fn new(event: DomainEvent, sequence: i64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            donation_id: event.donation_id(),
            sequence,
            recorded_at,
            event,
        }
    }

    /// Deduplication key for idempotent consumers.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.donation_id, self.sequence, self.event.name())
    }
}
