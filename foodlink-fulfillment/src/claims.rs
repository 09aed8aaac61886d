//! Guarded transitions across donations, requests, assignments and bills.
//!
//! The coordinator keeps no state. Each operation turns a snapshot the
//! caller has already read and authorized into one [`UnitOfWork`] whose
//! guards encode that snapshot, then commits it. If anything moved in the
//! meantime the store rejects the whole unit and nothing is written.

use chrono::{DateTime, Utc};
use foodlink_catalog::{PriceBreakdown, PricingEngine};
use foodlink_core::lifecycle::{
    AssignmentEvent, BillEvent, DonationEvent, RequestEvent,
};
use foodlink_core::models::{
    AssignmentStatus, Bill, BillStatus, DeliveryAssignment, Donation, DonationStatus, FoodRequest,
};
use foodlink_core::repository::{
    Assign, AssignmentChange, AssignmentFilter, BillChange, BillFilter, Committed, DonationChange,
    EntityKind, EntityStore, Expect, RequestChange, StoreError, UnitOfWork,
};
use foodlink_shared::models::events::{
    BillFinalizedEvent, DeliveryAcceptedEvent, DeliveryCompletedEvent, DeliveryDeclinedEvent,
    DeliveryOfferedEvent, DonationClaimedEvent, DonationExpiredEvent, DonationReleasedEvent,
    DonationSettledEvent, PickupStartedEvent,
};
use foodlink_shared::DomainEvent;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FulfillmentError, FulfillmentResult};

/// Why a claim went back to `Available`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    PaymentDeclined,
    RequesterCancelled,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::PaymentDeclined => "PAYMENT_DECLINED",
            ReleaseReason::RequesterCancelled => "REQUESTER_CANCELLED",
        }
    }
}

/// What a successful payment confirmation created
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub donation: Donation,
    pub bill: Bill,
    pub assignment: DeliveryAssignment,
}

/// Open and accepted assignments for a donation, read before unwinding it
#[derive(Debug, Clone, Default)]
struct Dependents {
    request: Option<FoodRequest>,
    pending_bills: Vec<Bill>,
    open_assignments: Vec<DeliveryAssignment>,
}

pub struct ClaimCoordinator {
    store: Arc<dyn EntityStore>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// `Available -> Claimed` for the donation and `Pending -> Claimed` for
    /// the request, linked to each other. A lost race is reported with the
    /// state the winner left behind.
    pub async fn claim(
        &self,
        donation: &Donation,
        request: &FoodRequest,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<Donation> {
        let unit = UnitOfWork::new(at)
            .donation(
                DonationChange::transition(donation.id, donation.status, DonationEvent::Claim)?
                    .expect_claimant(Expect::Vacant)
                    .set_claimant(Assign::Set(request.id)),
            )
            .request(
                RequestChange::transition(request.id, request.status, RequestEvent::Claim)?
                    .expect_donation(Expect::Vacant)
                    .set_donation(Assign::Set(donation.id)),
            )
            .emit(DomainEvent::DonationClaimed(DonationClaimedEvent {
                donation_id: donation.id,
                request_id: request.id,
                requester_id: request.requester_id,
                claimed_at: at,
            }));

        match self.store.commit(unit).await {
            Ok(committed) => {
                info!(
                    donation_id = %donation.id,
                    request_id = %request.id,
                    "Donation claimed"
                );
                Self::committed_donation(&committed, donation.id)
            }
            Err(StoreError::Conflict {
                entity: EntityKind::Donation,
                ..
            }) => Err(self.lost_claim(donation.id, at).await),
            Err(e) => Err(e.into()),
        }
    }

    async fn lost_claim(&self, donation_id: Uuid, at: DateTime<Utc>) -> FulfillmentError {
        let current = match self.store.donation(donation_id).await {
            Ok(Some(d)) => d.observed(at),
            Ok(None) => return FulfillmentError::not_found(EntityKind::Donation, donation_id),
            Err(e) => return e.into(),
        };

        if current.status == DonationStatus::Expired {
            return FulfillmentError::Expired(donation_id);
        }

        warn!(
            donation_id = %donation_id,
            status = %current.status,
            claimant = ?current.claimant_request_id,
            "Claim lost to a concurrent claimant"
        );
        FulfillmentError::AlreadyClaimed {
            donation_id,
            status: current.status,
            claimant_request_id: current.claimant_request_id,
        }
    }

    /// Payment succeeded: `Claimed -> AwaitingPickup`, request in progress,
    /// bill issued from `breakdown`, and an open delivery offer broadcast.
    pub async fn confirm(
        &self,
        donation: &Donation,
        request: &FoodRequest,
        breakdown: PriceBreakdown,
        pricing: &PricingEngine,
        transaction_id: &str,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<Confirmation> {
        let bill = Bill::issue(donation, request, breakdown, pricing, transaction_id, at);
        let offer = DeliveryAssignment::offer(donation.id, at);

        let unit = UnitOfWork::new(at)
            .donation(
                DonationChange::transition(
                    donation.id,
                    donation.status,
                    DonationEvent::ConfirmPayment,
                )?
                .expect_claimant(Expect::Held(request.id)),
            )
            .request(
                RequestChange::transition(request.id, request.status, RequestEvent::Begin)?
                    .expect_donation(Expect::Held(donation.id)),
            )
            .insert_bill(bill.clone())
            .insert_assignment(offer.clone())
            .emit(Self::offered_event(donation, &offer, at));

        let committed = self.store.commit(unit).await?;
        info!(
            donation_id = %donation.id,
            bill_id = %bill.id,
            final_price = bill.final_price,
            assignment_id = %offer.id,
            "Payment confirmed, delivery offered"
        );

        Ok(Confirmation {
            donation: Self::committed_donation(&committed, donation.id)?,
            bill,
            assignment: offer,
        })
    }

    /// Back to `Available`: claimant and partner cleared, request pending
    /// again, pending bill refunded, open offers withdrawn.
    pub async fn release(
        &self,
        donation: &Donation,
        reason: ReleaseReason,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<Donation> {
        let dependents = self.dependents(donation).await?;
        let request = dependents.request.clone().ok_or_else(|| {
            FulfillmentError::Validation(format!("donation {} has no claimant", donation.id))
        })?;

        let mut unit = UnitOfWork::new(at).donation(
            DonationChange::transition(donation.id, donation.status, DonationEvent::Release)?
                .expect_claimant(Expect::Held(request.id))
                .expect_partner(Self::expect_current(donation.assigned_partner_id))
                .set_claimant(Assign::Clear)
                .set_partner(Assign::Clear),
        );
        unit = Self::unwind(unit, donation, &dependents)?;
        unit = unit.emit(DomainEvent::DonationReleased(DonationReleasedEvent {
            donation_id: donation.id,
            request_id: request.id,
            reason: reason.as_str().to_string(),
            released_at: at,
        }));

        let committed = self.store.commit(unit).await?;
        warn!(
            donation_id = %donation.id,
            request_id = %request.id,
            reason = reason.as_str(),
            "Claim released"
        );
        Self::committed_donation(&committed, donation.id)
    }

    /// `Offered -> Accepted` for one partner. The donation's partner slot
    /// must be empty, so two accepts on different offers cannot both land.
    pub async fn assign_partner(
        &self,
        donation: &Donation,
        assignment: &DeliveryAssignment,
        partner_id: Uuid,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<DeliveryAssignment> {
        let unit = Self::accept_unit(donation, assignment, partner_id, at)?;
        self.store.commit(unit).await?;
        info!(
            donation_id = %donation.id,
            assignment_id = %assignment.id,
            partner_id = %partner_id,
            "Delivery accepted"
        );

        let mut accepted = assignment.clone();
        accepted.status = AssignmentStatus::Accepted;
        accepted.partner_id = Some(partner_id);
        accepted.responded_at = Some(at);
        Ok(accepted)
    }

    /// Every unit touches the donation row first so that writers queue on
    /// the same lock before they reach assignments.
    fn accept_unit(
        donation: &Donation,
        assignment: &DeliveryAssignment,
        partner_id: Uuid,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<UnitOfWork> {
        Ok(UnitOfWork::new(at)
            .donation(
                DonationChange::in_place(donation.id, donation.status)
                    .expect_partner(Expect::Vacant)
                    .set_partner(Assign::Set(partner_id)),
            )
            .assignment(
                AssignmentChange::transition(assignment.id, assignment.status, AssignmentEvent::Accept)?
                    .expect_partner(Expect::Vacant)
                    .set_partner(Assign::Set(partner_id)),
            )
            .emit(DomainEvent::DeliveryAccepted(DeliveryAcceptedEvent {
                donation_id: donation.id,
                assignment_id: assignment.id,
                partner_id,
                accepted_at: at,
            })))
    }

    /// Decline an offer, or back out of an accepted one. Either way a fresh
    /// offer is broadcast in the same unit. Returns the new offer.
    pub async fn decline(
        &self,
        donation: &Donation,
        assignment: &DeliveryAssignment,
        partner_id: Uuid,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<DeliveryAssignment> {
        let reoffer = DeliveryAssignment::offer(donation.id, at);
        let unit = Self::decline_unit(donation, assignment, partner_id, &reoffer, at)?;

        self.store.commit(unit).await?;
        warn!(
            donation_id = %donation.id,
            assignment_id = %assignment.id,
            partner_id = %partner_id,
            reoffer_id = %reoffer.id,
            "Delivery declined, offer re-broadcast"
        );
        Ok(reoffer)
    }

    fn decline_unit(
        donation: &Donation,
        assignment: &DeliveryAssignment,
        partner_id: Uuid,
        reoffer: &DeliveryAssignment,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<UnitOfWork> {
        let change =
            AssignmentChange::transition(assignment.id, assignment.status, AssignmentEvent::Decline)?;

        let unit = if assignment.status == AssignmentStatus::Accepted {
            UnitOfWork::new(at)
                .donation(
                    DonationChange::in_place(donation.id, donation.status)
                        .expect_partner(Expect::Held(partner_id))
                        .set_partner(Assign::Clear),
                )
                .assignment(change.expect_partner(Expect::Held(partner_id)))
        } else {
            // Record who declined the open offer
            UnitOfWork::new(at)
                .donation(
                    DonationChange::in_place(donation.id, donation.status)
                        .expect_partner(Self::expect_current(donation.assigned_partner_id)),
                )
                .assignment(
                    change
                        .expect_partner(Expect::Vacant)
                        .set_partner(Assign::Set(partner_id)),
                )
        };

        Ok(unit
            .insert_assignment(reoffer.clone())
            .emit(DomainEvent::DeliveryDeclined(DeliveryDeclinedEvent {
                donation_id: donation.id,
                assignment_id: assignment.id,
                partner_id: Some(partner_id),
                reason: "PARTNER_DECLINED".to_string(),
                declined_at: at,
            }))
            .emit(Self::offered_event(donation, reoffer, at)))
    }

    /// `AwaitingPickup -> InTransit`, only by the assigned partner
    pub async fn start_pickup(
        &self,
        donation: &Donation,
        partner_id: Uuid,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<Donation> {
        let unit = UnitOfWork::new(at)
            .donation(
                DonationChange::transition(donation.id, donation.status, DonationEvent::StartPickup)?
                    .expect_partner(Expect::Held(partner_id)),
            )
            .emit(DomainEvent::PickupStarted(PickupStartedEvent {
                donation_id: donation.id,
                partner_id,
                started_at: at,
            }));

        let committed = self.store.commit(unit).await?;
        info!(donation_id = %donation.id, partner_id = %partner_id, "Pickup started");
        Self::committed_donation(&committed, donation.id)
    }

    /// `InTransit -> Delivered` with request, bill and assignment closed in
    /// the same unit.
    pub async fn complete(
        &self,
        donation: &Donation,
        request: &FoodRequest,
        bill: &Bill,
        assignment: &DeliveryAssignment,
        partner_id: Uuid,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<Donation> {
        let unit = UnitOfWork::new(at)
            .donation(
                DonationChange::transition(donation.id, donation.status, DonationEvent::Deliver)?
                    .expect_claimant(Expect::Held(request.id))
                    .expect_partner(Expect::Held(partner_id)),
            )
            .request(
                RequestChange::transition(request.id, request.status, RequestEvent::Complete)?
                    .expect_donation(Expect::Held(donation.id)),
            )
            .bill(BillChange::transition(bill.id, bill.status, BillEvent::Finalize)?)
            .assignment(
                AssignmentChange::transition(
                    assignment.id,
                    assignment.status,
                    AssignmentEvent::Complete,
                )?
                .expect_partner(Expect::Held(partner_id)),
            )
            .emit(DomainEvent::DeliveryCompleted(DeliveryCompletedEvent {
                donation_id: donation.id,
                request_id: request.id,
                partner_id,
                delivered_at: at,
            }))
            .emit(DomainEvent::BillFinalized(BillFinalizedEvent {
                bill_id: bill.id,
                donation_id: donation.id,
                request_id: request.id,
                final_price: bill.final_price,
                platform_fee: bill.platform_fee,
                transaction_id: bill.transaction_id.clone(),
                finalized_at: at,
            }));

        let committed = self.store.commit(unit).await?;
        info!(
            donation_id = %donation.id,
            bill_id = %bill.id,
            final_price = bill.final_price,
            "Delivery completed, bill finalized"
        );
        Self::committed_donation(&committed, donation.id)
    }

    /// `Delivered -> Billed`
    pub async fn settle(
        &self,
        donation: &Donation,
        bill: &Bill,
        at: DateTime<Utc>,
    ) -> FulfillmentResult<Donation> {
        let unit = UnitOfWork::new(at)
            .donation(DonationChange::transition(
                donation.id,
                donation.status,
                DonationEvent::Settle,
            )?)
            .emit(DomainEvent::DonationSettled(DonationSettledEvent {
                donation_id: donation.id,
                bill_id: bill.id,
                settled_at: at,
            }));

        let committed = self.store.commit(unit).await?;
        info!(donation_id = %donation.id, bill_id = %bill.id, "Donation settled");
        Self::committed_donation(&committed, donation.id)
    }

    /// Persist lazy expiry. Guarded on the exact status and references that
    /// were read, so it never overwrites a transition that landed since.
    pub async fn expire(&self, donation: &Donation, at: DateTime<Utc>) -> FulfillmentResult<Donation> {
        let dependents = self.dependents(donation).await?;

        let mut unit = UnitOfWork::new(at).donation(
            DonationChange::transition(donation.id, donation.status, DonationEvent::Expire)?
                .expect_claimant(Self::expect_current(donation.claimant_request_id))
                .expect_partner(Self::expect_current(donation.assigned_partner_id))
                .set_claimant(Assign::Clear)
                .set_partner(Assign::Clear),
        );
        unit = Self::unwind(unit, donation, &dependents)?;
        unit = unit.emit(DomainEvent::DonationExpired(DonationExpiredEvent {
            donation_id: donation.id,
            previous_status: donation.status.as_str().to_string(),
            expired_at: at,
        }));

        let committed = self.store.commit(unit).await?;
        info!(
            donation_id = %donation.id,
            previous_status = %donation.status,
            "Donation expired"
        );
        Self::committed_donation(&committed, donation.id)
    }

    async fn dependents(&self, donation: &Donation) -> FulfillmentResult<Dependents> {
        let Some(request_id) = donation.claimant_request_id else {
            // Unclaimed donations still may have stale open offers
            let open_assignments = self.open_assignments(donation.id).await?;
            return Ok(Dependents {
                open_assignments,
                ..Default::default()
            });
        };

        let request = self
            .store
            .request(request_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Request, request_id))?;
        let pending_bills = self
            .store
            .bills(&BillFilter::for_donation(donation.id).with_statuses(&[BillStatus::Pending]))
            .await?;
        let open_assignments = self.open_assignments(donation.id).await?;

        Ok(Dependents {
            request: Some(request),
            pending_bills,
            open_assignments,
        })
    }

    async fn open_assignments(&self, donation_id: Uuid) -> FulfillmentResult<Vec<DeliveryAssignment>> {
        Ok(self
            .store
            .assignments(
                &AssignmentFilter::for_donation(donation_id)
                    .with_statuses(&[AssignmentStatus::Offered, AssignmentStatus::Accepted]),
            )
            .await?)
    }

    /// Detach request, bills and assignments from a donation that is
    /// leaving the claimed part of its lifecycle.
    fn unwind(
        mut unit: UnitOfWork,
        donation: &Donation,
        dependents: &Dependents,
    ) -> FulfillmentResult<UnitOfWork> {
        if let Some(request) = &dependents.request {
            unit = unit.request(
                RequestChange::transition(request.id, request.status, RequestEvent::Release)?
                    .expect_donation(Expect::Held(donation.id))
                    .set_donation(Assign::Clear),
            );
        }
        for bill in &dependents.pending_bills {
            unit = unit.bill(BillChange::transition(bill.id, bill.status, BillEvent::Refund)?);
        }
        for assignment in &dependents.open_assignments {
            unit = unit.assignment(
                AssignmentChange::transition(
                    assignment.id,
                    assignment.status,
                    AssignmentEvent::Withdraw,
                )?
                .expect_partner(Self::expect_current(assignment.partner_id)),
            );
        }
        Ok(unit)
    }

    fn expect_current(reference: Option<Uuid>) -> Expect {
        match reference {
            Some(id) => Expect::Held(id),
            None => Expect::Vacant,
        }
    }

    fn offered_event(
        donation: &Donation,
        offer: &DeliveryAssignment,
        at: DateTime<Utc>,
    ) -> DomainEvent {
        DomainEvent::DeliveryOffered(DeliveryOfferedEvent {
            donation_id: donation.id,
            assignment_id: offer.id,
            pickup_location: donation.location.label.clone(),
            spoil_deadline: donation.spoil_deadline,
            offered_at: at,
        })
    }

    fn committed_donation(committed: &Committed, id: Uuid) -> FulfillmentResult<Donation> {
        committed
            .donation(id)
            .cloned()
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Donation, id))
    }
}
