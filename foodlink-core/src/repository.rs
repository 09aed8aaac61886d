//! Storage contract.
//!
//! All writes go through [`EntityStore::commit`], which applies a
//! [`UnitOfWork`] all-or-nothing. Every change in a unit carries its own
//! guard (expected status, expected references); the store checks each guard
//! against the state left by the previous changes in the same unit and
//! rejects the whole unit on the first miss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foodlink_catalog::FoodCategory;
use foodlink_shared::{DomainEvent, EventEnvelope};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::lifecycle::{AssignmentEvent, BillEvent, DonationEvent, RequestEvent};
use crate::models::{
    AssignmentStatus, Bill, BillStatus, DeclineReason, DeliveryAssignment, Donation,
    DonationStatus, FoodRequest, RequestStatus,
};
use crate::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Donation,
    Request,
    Assignment,
    Bill,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Donation => "donation",
            EntityKind::Request => "request",
            EntityKind::Assignment => "assignment",
            EntityKind::Bill => "bill",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A guard did not hold. The caller lost a race and must re-read.
    #[error("Conflict on {entity} {id}: {detail}")]
    Conflict {
        entity: EntityKind,
        id: Uuid,
        detail: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: Uuid },

    #[error("{entity} {id} already exists")]
    Duplicate { entity: EntityKind, id: Uuid },

    /// Stored data could not be decoded into a record
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(entity: EntityKind, id: Uuid, detail: impl Into<String>) -> Self {
        StoreError::Conflict {
            entity,
            id,
            detail: detail.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Guard on a nullable reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expect {
    Any,
    Vacant,
    Held(Uuid),
}

impl Expect {
    pub fn admits(&self, current: Option<Uuid>) -> bool {
        match self {
            Expect::Any => true,
            Expect::Vacant => current.is_none(),
            Expect::Held(id) => current == Some(*id),
        }
    }
}

/// Write to a nullable reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assign {
    Keep,
    Set(Uuid),
    Clear,
}

impl Assign {
    pub fn apply(&self, slot: &mut Option<Uuid>) {
        match self {
            Assign::Keep => {}
            Assign::Set(id) => *slot = Some(*id),
            Assign::Clear => *slot = None,
        }
    }
}

/// Guard on a donation's spoil deadline, evaluated at the unit's timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadlineGuard {
    Any,
    /// Deadline not yet passed
    Live,
    /// Deadline already passed
    Lapsed,
}

impl DeadlineGuard {
    pub fn admits(&self, spoil_deadline: DateTime<Utc>, at: DateTime<Utc>) -> bool {
        match self {
            DeadlineGuard::Any => true,
            DeadlineGuard::Live => at <= spoil_deadline,
            DeadlineGuard::Lapsed => at > spoil_deadline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationChange {
    pub id: Uuid,
    pub from: DonationStatus,
    pub to: DonationStatus,
    pub claimant: Expect,
    pub partner: Expect,
    pub deadline: DeadlineGuard,
    pub set_claimant: Assign,
    pub set_partner: Assign,
}

impl DonationChange {
    /// Change driven by the donation transition table. Anything but `Expire`
    /// from a lapsing status also requires the deadline not to have passed.
    pub fn transition(id: Uuid, from: DonationStatus, event: DonationEvent) -> CoreResult<Self> {
        let to = from.next(event)?;
        let deadline = if event == DonationEvent::Expire {
            DeadlineGuard::Lapsed
        } else if from.lapses_at_deadline() {
            DeadlineGuard::Live
        } else {
            DeadlineGuard::Any
        };
        Ok(Self {
            id,
            from,
            to,
            claimant: Expect::Any,
            partner: Expect::Any,
            deadline,
            set_claimant: Assign::Keep,
            set_partner: Assign::Keep,
        })
    }

    /// Reference-only change that leaves the status where it is
    pub fn in_place(id: Uuid, status: DonationStatus) -> Self {
        Self {
            id,
            from: status,
            to: status,
            claimant: Expect::Any,
            partner: Expect::Any,
            deadline: if status.lapses_at_deadline() {
                DeadlineGuard::Live
            } else {
                DeadlineGuard::Any
            },
            set_claimant: Assign::Keep,
            set_partner: Assign::Keep,
        }
    }

    pub fn expect_claimant(mut self, expect: Expect) -> Self {
        self.claimant = expect;
        self
    }

    pub fn expect_partner(mut self, expect: Expect) -> Self {
        self.partner = expect;
        self
    }

    pub fn set_claimant(mut self, assign: Assign) -> Self {
        self.set_claimant = assign;
        self
    }

    pub fn set_partner(mut self, assign: Assign) -> Self {
        self.set_partner = assign;
        self
    }

    /// Why the guard fails against `current`, if it does
    pub fn check(&self, current: &Donation, at: DateTime<Utc>) -> Result<(), String> {
        if current.status != self.from {
            return Err(format!("status is {}, expected {}", current.status, self.from));
        }
        if !self.claimant.admits(current.claimant_request_id) {
            return Err(format!(
                "claimant is {:?}, expected {:?}",
                current.claimant_request_id, self.claimant
            ));
        }
        if !self.partner.admits(current.assigned_partner_id) {
            return Err(format!(
                "partner is {:?}, expected {:?}",
                current.assigned_partner_id, self.partner
            ));
        }
        if !self.deadline.admits(current.spoil_deadline, at) {
            return Err(match self.deadline {
                DeadlineGuard::Lapsed => "spoil deadline not reached".to_string(),
                _ => "spoil deadline passed".to_string(),
            });
        }
        Ok(())
    }

    pub fn apply(&self, donation: &mut Donation, at: DateTime<Utc>) {
        donation.status = self.to;
        self.set_claimant.apply(&mut donation.claimant_request_id);
        self.set_partner.apply(&mut donation.assigned_partner_id);
        donation.version += 1;
        donation.updated_at = at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestChange {
    pub id: Uuid,
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub donation: Expect,
    pub set_donation: Assign,
}

impl RequestChange {
    pub fn transition(id: Uuid, from: RequestStatus, event: RequestEvent) -> CoreResult<Self> {
        Ok(Self {
            id,
            from,
            to: from.next(event)?,
            donation: Expect::Any,
            set_donation: Assign::Keep,
        })
    }

    pub fn expect_donation(mut self, expect: Expect) -> Self {
        self.donation = expect;
        self
    }

    pub fn set_donation(mut self, assign: Assign) -> Self {
        self.set_donation = assign;
        self
    }

    pub fn check(&self, current: &FoodRequest) -> Result<(), String> {
        if current.status != self.from {
            return Err(format!("status is {}, expected {}", current.status, self.from));
        }
        if !self.donation.admits(current.donation_id) {
            return Err(format!(
                "linked donation is {:?}, expected {:?}",
                current.donation_id, self.donation
            ));
        }
        Ok(())
    }

    pub fn apply(&self, request: &mut FoodRequest, at: DateTime<Utc>) {
        request.status = self.to;
        self.set_donation.apply(&mut request.donation_id);
        request.updated_at = at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentChange {
    pub id: Uuid,
    pub from: AssignmentStatus,
    pub to: AssignmentStatus,
    pub partner: Expect,
    pub set_partner: Assign,
    pub reason: Option<DeclineReason>,
}

impl AssignmentChange {
    pub fn transition(
        id: Uuid,
        from: AssignmentStatus,
        event: AssignmentEvent,
    ) -> CoreResult<Self> {
        let reason = match event {
            AssignmentEvent::Decline => Some(DeclineReason::PartnerDeclined),
            AssignmentEvent::Withdraw => Some(DeclineReason::OfferWithdrawn),
            _ => None,
        };
        Ok(Self {
            id,
            from,
            to: from.next(event)?,
            partner: Expect::Any,
            set_partner: Assign::Keep,
            reason,
        })
    }

    pub fn expect_partner(mut self, expect: Expect) -> Self {
        self.partner = expect;
        self
    }

    pub fn set_partner(mut self, assign: Assign) -> Self {
        self.set_partner = assign;
        self
    }

    pub fn check(&self, current: &DeliveryAssignment) -> Result<(), String> {
        if current.status != self.from {
            return Err(format!("status is {}, expected {}", current.status, self.from));
        }
        if !self.partner.admits(current.partner_id) {
            return Err(format!(
                "partner is {:?}, expected {:?}",
                current.partner_id, self.partner
            ));
        }
        Ok(())
    }

    pub fn apply(&self, assignment: &mut DeliveryAssignment, at: DateTime<Utc>) {
        assignment.status = self.to;
        self.set_partner.apply(&mut assignment.partner_id);
        match self.to {
            AssignmentStatus::Accepted => assignment.responded_at = Some(at),
            AssignmentStatus::Declined => {
                assignment.responded_at = Some(at);
                assignment.decline_reason = self.reason;
            }
            AssignmentStatus::Completed => assignment.completed_at = Some(at),
            AssignmentStatus::Offered => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillChange {
    pub id: Uuid,
    pub from: BillStatus,
    pub to: BillStatus,
}

impl BillChange {
    pub fn transition(id: Uuid, from: BillStatus, event: BillEvent) -> CoreResult<Self> {
        Ok(Self {
            id,
            from,
            to: from.next(event)?,
        })
    }

    pub fn check(&self, current: &Bill) -> Result<(), String> {
        if current.status != self.from {
            return Err(format!("status is {}, expected {}", current.status, self.from));
        }
        Ok(())
    }

    pub fn apply(&self, bill: &mut Bill, at: DateTime<Utc>) {
        bill.status = self.to;
        bill.updated_at = at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Donation(DonationChange),
    Request(RequestChange),
    Assignment(AssignmentChange),
    Bill(BillChange),
    NewAssignment(DeliveryAssignment),
    NewBill(Bill),
    /// Outbox write. Sequenced against the donation the event names.
    Emit(DomainEvent),
}

/// Ordered list of guarded changes applied all-or-nothing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub at: DateTime<Utc>,
    pub changes: Vec<Change>,
}

impl UnitOfWork {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            changes: Vec::new(),
        }
    }

    pub fn donation(mut self, change: DonationChange) -> Self {
        self.changes.push(Change::Donation(change));
        self
    }

    pub fn request(mut self, change: RequestChange) -> Self {
        self.changes.push(Change::Request(change));
        self
    }

    pub fn assignment(mut self, change: AssignmentChange) -> Self {
        self.changes.push(Change::Assignment(change));
        self
    }

    pub fn bill(mut self, change: BillChange) -> Self {
        self.changes.push(Change::Bill(change));
        self
    }

    pub fn insert_assignment(mut self, assignment: DeliveryAssignment) -> Self {
        self.changes.push(Change::NewAssignment(assignment));
        self
    }

    pub fn insert_bill(mut self, bill: Bill) -> Self {
        self.changes.push(Change::NewBill(bill));
        self
    }

    pub fn emit(mut self, event: DomainEvent) -> Self {
        self.changes.push(Change::Emit(event));
        self
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// What a successful commit wrote
#[derive(Debug, Clone, Default)]
pub struct Committed {
    /// Post-commit state of every donation the unit touched
    pub donations: Vec<Donation>,
    pub events: Vec<EventEnvelope>,
}

impl Committed {
    pub fn donation(&self, id: Uuid) -> Option<&Donation> {
        self.donations.iter().rev().find(|d| d.id == id)
    }
}

/// Outbox row awaiting publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Global outbox position. Positions are allocated before commit, so a
    /// lower position can become visible after a higher one.
    pub position: i64,
    pub envelope: EventEnvelope,
}

#[derive(Debug, Clone, Default)]
pub struct DonationFilter {
    pub statuses: Option<Vec<DonationStatus>>,
    pub category: Option<FoodCategory>,
    pub donor_id: Option<Uuid>,
    pub partner_id: Option<Uuid>,
    /// Only donations whose deadline is strictly before this instant
    pub deadline_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DonationFilter {
    pub fn matches(&self, d: &Donation) -> bool {
        self.statuses.as_ref().map_or(true, |s| s.contains(&d.status))
            && self.category.map_or(true, |c| c == d.category)
            && self.donor_id.map_or(true, |id| id == d.donor_id)
            && self.partner_id.map_or(true, |id| d.assigned_partner_id == Some(id))
            && self.deadline_before.map_or(true, |t| d.spoil_deadline < t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub statuses: Option<Vec<RequestStatus>>,
    pub category: Option<FoodCategory>,
    pub requester_id: Option<Uuid>,
    pub donation_id: Option<Uuid>,
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub fn matches(&self, r: &FoodRequest) -> bool {
        self.statuses.as_ref().map_or(true, |s| s.contains(&r.status))
            && self.category.map_or(true, |c| c == r.category)
            && self.requester_id.map_or(true, |id| id == r.requester_id)
            && self.donation_id.map_or(true, |id| r.donation_id == Some(id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub donation_id: Option<Uuid>,
    pub statuses: Option<Vec<AssignmentStatus>>,
    pub partner_id: Option<Uuid>,
}

impl AssignmentFilter {
    pub fn for_donation(donation_id: Uuid) -> Self {
        Self {
            donation_id: Some(donation_id),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[AssignmentStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, a: &DeliveryAssignment) -> bool {
        self.donation_id.map_or(true, |id| id == a.donation_id)
            && self.statuses.as_ref().map_or(true, |s| s.contains(&a.status))
            && self.partner_id.map_or(true, |id| a.partner_id == Some(id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BillFilter {
    pub donation_id: Option<Uuid>,
    pub statuses: Option<Vec<BillStatus>>,
    pub receiver_id: Option<Uuid>,
}

impl BillFilter {
    pub fn for_donation(donation_id: Uuid) -> Self {
        Self {
            donation_id: Some(donation_id),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[BillStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, b: &Bill) -> bool {
        self.donation_id.map_or(true, |id| id == b.donation_id)
            && self.statuses.as_ref().map_or(true, |s| s.contains(&b.status))
            && self.receiver_id.map_or(true, |id| id == b.receiver_id)
    }
}

/// Durable home of every record. The only shared mutable state in the
/// system.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_donation(&self, donation: &Donation) -> StoreResult<()>;

    async fn insert_request(&self, request: &FoodRequest) -> StoreResult<()>;

    async fn donation(&self, id: Uuid) -> StoreResult<Option<Donation>>;

    async fn request(&self, id: Uuid) -> StoreResult<Option<FoodRequest>>;

    async fn assignment(&self, id: Uuid) -> StoreResult<Option<DeliveryAssignment>>;

    async fn bill(&self, id: Uuid) -> StoreResult<Option<Bill>>;

    async fn donations(&self, filter: &DonationFilter) -> StoreResult<Vec<Donation>>;

    async fn requests(&self, filter: &RequestFilter) -> StoreResult<Vec<FoodRequest>>;

    async fn assignments(&self, filter: &AssignmentFilter) -> StoreResult<Vec<DeliveryAssignment>>;

    async fn bills(&self, filter: &BillFilter) -> StoreResult<Vec<Bill>>;

    /// Apply every change in `unit` or none of them.
    ///
    /// Guards are checked in order against the state produced by earlier
    /// changes in the same unit. The first miss yields `Conflict` (or
    /// `NotFound` when the record is absent) and nothing is written.
    /// Each donation change and each emitted event bumps the named
    /// donation's `version`; an event's sequence is the version it bumped to.
    async fn commit(&self, unit: UnitOfWork) -> StoreResult<Committed>;

    /// Oldest unpublished outbox rows, in position order
    async fn pending_events(&self, limit: usize) -> StoreResult<Vec<OutboxEntry>>;

    /// Mark exactly the listed rows as published
    async fn mark_published(&self, positions: &[i64]) -> StoreResult<()>;
}
