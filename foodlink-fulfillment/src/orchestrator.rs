use chrono::{DateTime, Utc};
use foodlink_catalog::{PriceBreakdown, PricingEngine};
use foodlink_core::clock::Clock;
use foodlink_core::identity::{Actor, Role};
use foodlink_core::lifecycle::{AssignmentEvent, DonationEvent};
use foodlink_core::models::{
    AssignmentStatus, Bill, BillStatus, DeliveryAssignment, Donation, DonationStatus, FoodRequest,
    RequestStatus,
};
use foodlink_core::payment::{PaymentAuthority, PaymentRequest, PaymentResult};
use foodlink_core::repository::{AssignmentFilter, BillFilter, EntityKind, EntityStore};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::claims::{ClaimCoordinator, Confirmation, ReleaseReason};
use crate::error::{FulfillmentError, FulfillmentResult};

pub const DEFAULT_CURRENCY: &str = "INR";

/// Sequences claim, payment, delivery assignment, delivery and billing.
///
/// Every operation reads, checks the actor and the current state, then
/// hands one guarded unit to the [`ClaimCoordinator`]. No lock is held
/// across the store or the payment authority.
pub struct FulfillmentOrchestrator {
    store: Arc<dyn EntityStore>,
    coordinator: ClaimCoordinator,
    pricing: PricingEngine,
    clock: Arc<dyn Clock>,
    currency: String,
}

impl FulfillmentOrchestrator {
    pub fn new(store: Arc<dyn EntityStore>, pricing: PricingEngine, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator: ClaimCoordinator::new(store.clone()),
            store,
            pricing,
            clock,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    /// Donation as of now, with lazy expiry applied
    pub async fn donation(&self, donation_id: Uuid) -> FulfillmentResult<Donation> {
        let now = self.clock.now();
        Ok(self.load_donation(donation_id).await?.observed(now))
    }

    pub async fn request(&self, request_id: Uuid) -> FulfillmentResult<FoodRequest> {
        self.load_request(request_id).await
    }

    /// Current price of a donation, as a requester would be charged now
    pub async fn quote(&self, donation_id: Uuid) -> FulfillmentResult<PriceBreakdown> {
        let now = self.clock.now();
        let donation = self.live_donation(donation_id, now).await?;
        Ok(self.pricing.compute_price(&donation, now)?)
    }

    /// Reserve an available donation for a pending request
    pub async fn claim_donation(
        &self,
        actor: &Actor,
        request_id: Uuid,
        donation_id: Uuid,
    ) -> FulfillmentResult<Donation> {
        let now = self.clock.now();

        let request = self.load_request(request_id).await?;
        if !actor.acts_for(Role::Requester, request.requester_id) {
            return Err(FulfillmentError::Forbidden(format!(
                "actor {} does not own request {}",
                actor.id, request_id
            )));
        }
        if request.status != RequestStatus::Pending {
            return Err(FulfillmentError::Validation(format!(
                "request {} is {}, only PENDING requests can claim",
                request_id, request.status
            )));
        }

        let donation = self.live_donation(donation_id, now).await?;
        if donation.status != DonationStatus::Available {
            return Err(FulfillmentError::AlreadyClaimed {
                donation_id,
                status: donation.status,
                claimant_request_id: donation.claimant_request_id,
            });
        }
        if donation.category != request.category {
            return Err(FulfillmentError::Validation(format!(
                "category mismatch: donation is {}, request wants {}",
                donation.category, request.category
            )));
        }
        if !donation.quantity.covers(&request.quantity) {
            return Err(FulfillmentError::Validation(format!(
                "donation offers {}, request needs {}",
                donation.quantity, request.quantity
            )));
        }

        self.coordinator.claim(&donation, &request, now).await
    }

    /// Apply the payment authority's verdict. Success opens the delivery
    /// offer; a decline releases the claim and reports `PaymentFailed`.
    /// The bill is priced now.
    pub async fn confirm_payment(
        &self,
        actor: &Actor,
        donation_id: Uuid,
        payment: PaymentResult,
    ) -> FulfillmentResult<Confirmation> {
        self.apply_payment(actor, donation_id, payment, None).await
    }

    /// Quote, authorize with no lock held, then confirm at the quoted price
    /// so the bill equals the authorized amount.
    pub async fn authorize_and_confirm(
        &self,
        actor: &Actor,
        donation_id: Uuid,
        authority: &dyn PaymentAuthority,
    ) -> FulfillmentResult<Confirmation> {
        let now = self.clock.now();
        let (donation, request) = self.claimed_pair(actor, donation_id, now).await?;
        let quote = self.pricing.compute_price(&donation, now)?;

        let payment_request = PaymentRequest {
            donation_id,
            request_id: request.id,
            payer_id: request.requester_id,
            amount: quote.final_price,
            currency: self.currency.clone(),
        };

        let verdict = authority.authorize(&payment_request).await.map_err(|e| {
            warn!(donation_id = %donation_id, error = %e, "Payment authority call failed");
            FulfillmentError::from(e)
        })?;

        let transaction_id = match &verdict {
            PaymentResult::Authorized { transaction_id } => Some(transaction_id.clone()),
            PaymentResult::Declined { .. } => None,
        };
        let outcome = self.apply_payment(actor, donation_id, verdict, Some(quote)).await;
        match (outcome, transaction_id) {
            (Err(cause), Some(transaction_id)) => {
                error!(
                    target: "foodlink::payments",
                    donation_id = %donation_id,
                    transaction_id = %transaction_id,
                    amount = payment_request.amount,
                    error = %cause,
                    "Authorized payment could not be recorded"
                );
                Err(FulfillmentError::UnrecordedPayment {
                    donation_id,
                    transaction_id,
                    cause: Box::new(cause),
                })
            }
            (outcome, _) => outcome,
        }
    }

    async fn apply_payment(
        &self,
        actor: &Actor,
        donation_id: Uuid,
        payment: PaymentResult,
        quote: Option<PriceBreakdown>,
    ) -> FulfillmentResult<Confirmation> {
        let now = self.clock.now();
        let (donation, request) = self.claimed_pair(actor, donation_id, now).await?;

        match payment {
            PaymentResult::Authorized { transaction_id } => {
                let breakdown = match quote {
                    Some(quote) => quote,
                    None => self.pricing.compute_price(&donation, now)?,
                };
                self.coordinator
                    .confirm(&donation, &request, breakdown, &self.pricing, &transaction_id, now)
                    .await
            }
            PaymentResult::Declined { reason } => {
                self.coordinator
                    .release(&donation, ReleaseReason::PaymentDeclined, now)
                    .await?;
                Err(FulfillmentError::PaymentFailed {
                    donation_id,
                    reason,
                })
            }
        }
    }

    /// A partner takes an open offer. Does not start transit.
    pub async fn accept_delivery(
        &self,
        actor: &Actor,
        assignment_id: Uuid,
        partner_id: Uuid,
    ) -> FulfillmentResult<DeliveryAssignment> {
        let now = self.clock.now();
        Self::require_partner(actor, partner_id)?;

        let assignment = self.load_assignment(assignment_id).await?;
        if assignment.status == AssignmentStatus::Accepted {
            return Err(FulfillmentError::Conflict {
                entity: EntityKind::Assignment,
                id: assignment_id,
                detail: "offer already accepted".to_string(),
            });
        }
        assignment.status.next(AssignmentEvent::Accept)?;

        let donation = self.live_donation(assignment.donation_id, now).await?;
        if donation.status != DonationStatus::AwaitingPickup {
            return Err(FulfillmentError::InvalidTransition {
                entity: "donation",
                from: donation.status.to_string(),
                event: "AcceptDelivery".to_string(),
            });
        }
        if donation.assigned_partner_id.is_some() {
            return Err(FulfillmentError::Conflict {
                entity: EntityKind::Donation,
                id: donation.id,
                detail: "donation already has a delivery partner".to_string(),
            });
        }

        self.coordinator
            .assign_partner(&donation, &assignment, partner_id, now)
            .await
    }

    /// A partner turns down an offer or backs out of one they accepted.
    /// The donation stays `AwaitingPickup` and a fresh offer goes out.
    pub async fn decline_delivery(
        &self,
        actor: &Actor,
        assignment_id: Uuid,
        partner_id: Uuid,
    ) -> FulfillmentResult<DeliveryAssignment> {
        let now = self.clock.now();
        Self::require_partner(actor, partner_id)?;

        let assignment = self.load_assignment(assignment_id).await?;
        assignment.status.next(AssignmentEvent::Decline)?;
        if assignment.status == AssignmentStatus::Accepted
            && assignment.partner_id != Some(partner_id)
        {
            return Err(FulfillmentError::Forbidden(format!(
                "assignment {} was accepted by another partner",
                assignment_id
            )));
        }

        let donation = self.live_donation(assignment.donation_id, now).await?;
        if donation.status != DonationStatus::AwaitingPickup {
            return Err(FulfillmentError::InvalidTransition {
                entity: "donation",
                from: donation.status.to_string(),
                event: "DeclineDelivery".to_string(),
            });
        }

        self.coordinator
            .decline(&donation, &assignment, partner_id, now)
            .await
    }

    /// Explicit `AwaitingPickup -> InTransit` by the assigned partner
    pub async fn begin_pickup(
        &self,
        actor: &Actor,
        donation_id: Uuid,
        partner_id: Uuid,
    ) -> FulfillmentResult<Donation> {
        let now = self.clock.now();
        Self::require_partner(actor, partner_id)?;

        let donation = self.live_donation(donation_id, now).await?;
        donation.status.next(DonationEvent::StartPickup)?;
        if donation.assigned_partner_id != Some(partner_id) {
            return Err(FulfillmentError::Forbidden(format!(
                "partner {} is not assigned to donation {}",
                partner_id, donation_id
            )));
        }

        self.coordinator.start_pickup(&donation, partner_id, now).await
    }

    /// `InTransit -> Delivered`; closes the request, bill and assignment
    pub async fn complete_delivery(&self, actor: &Actor, donation_id: Uuid) -> FulfillmentResult<Donation> {
        let now = self.clock.now();
        let donation = self.live_donation(donation_id, now).await?;
        donation.status.next(DonationEvent::Deliver)?;

        let partner_id = donation.assigned_partner_id.ok_or_else(|| {
            FulfillmentError::integrity(donation_id, "in transit without an assigned partner")
        })?;
        if !actor.acts_for(Role::DeliveryPartner, partner_id) {
            return Err(FulfillmentError::Forbidden(format!(
                "actor {} is not the partner delivering {}",
                actor.id, donation_id
            )));
        }

        let request = self.claimant_of(&donation).await?;

        let mut bills = self
            .store
            .bills(&BillFilter::for_donation(donation_id).with_statuses(&[BillStatus::Pending]))
            .await?;
        let bill = match bills.len() {
            1 => bills.remove(0),
            0 => return Err(FulfillmentError::integrity(donation_id, "no pending bill at delivery")),
            n => {
                return Err(FulfillmentError::integrity(
                    donation_id,
                    format!("{} pending bills at delivery", n),
                ))
            }
        };

        let accepted = self
            .store
            .assignments(
                &AssignmentFilter::for_donation(donation_id)
                    .with_statuses(&[AssignmentStatus::Accepted]),
            )
            .await?;
        let assignment = match accepted.as_slice() {
            [one] if one.partner_id == Some(partner_id) => one.clone(),
            [] => {
                return Err(FulfillmentError::integrity(
                    donation_id,
                    "no accepted assignment at delivery",
                ))
            }
            _ => {
                return Err(FulfillmentError::integrity(
                    donation_id,
                    format!(
                        "accepted assignments do not match partner {} ({} found)",
                        partner_id,
                        accepted.len()
                    ),
                ))
            }
        };

        self.coordinator
            .complete(&donation, &request, &bill, &assignment, partner_id, now)
            .await
    }

    /// `Delivered -> Billed` once the bill is `Completed`
    pub async fn settle(&self, actor: &Actor, donation_id: Uuid) -> FulfillmentResult<Donation> {
        let now = self.clock.now();
        let donation = self.load_donation(donation_id).await?.observed(now);
        if !actor.acts_for(Role::Donor, donation.donor_id) {
            return Err(FulfillmentError::Forbidden(format!(
                "actor {} may not settle donation {}",
                actor.id, donation_id
            )));
        }
        donation.status.next(DonationEvent::Settle)?;

        let bill = self.completed_bill(donation_id).await?;
        self.coordinator.settle(&donation, &bill, now).await
    }

    /// The requester walks away before transit. Any pending bill is
    /// refunded and open offers withdrawn.
    pub async fn release_claim(&self, actor: &Actor, donation_id: Uuid) -> FulfillmentResult<Donation> {
        let now = self.clock.now();
        let donation = self.live_donation(donation_id, now).await?;
        donation.status.next(DonationEvent::Release)?;

        let request = self.claimant_of(&donation).await?;
        if !actor.acts_for(Role::Requester, request.requester_id) {
            return Err(FulfillmentError::Forbidden(format!(
                "actor {} does not own the claim on {}",
                actor.id, donation_id
            )));
        }

        info!(donation_id = %donation_id, request_id = %request.id, "Requester releasing claim");
        self.coordinator
            .release(&donation, ReleaseReason::RequesterCancelled, now)
            .await
    }

    async fn claimed_pair(
        &self,
        actor: &Actor,
        donation_id: Uuid,
        now: DateTime<Utc>,
    ) -> FulfillmentResult<(Donation, FoodRequest)> {
        let donation = self.live_donation(donation_id, now).await?;
        donation.status.next(DonationEvent::ConfirmPayment)?;

        let request = self.claimant_of(&donation).await?;
        if !actor.acts_for(Role::Requester, request.requester_id) {
            return Err(FulfillmentError::Forbidden(format!(
                "actor {} does not own the claim on {}",
                actor.id, donation_id
            )));
        }
        Ok((donation, request))
    }

    async fn completed_bill(&self, donation_id: Uuid) -> FulfillmentResult<Bill> {
        let bills = self
            .store
            .bills(&BillFilter::for_donation(donation_id).with_statuses(&[BillStatus::Completed]))
            .await?;
        bills
            .into_iter()
            .next()
            .ok_or_else(|| FulfillmentError::integrity(donation_id, "delivered without a completed bill"))
    }

    async fn claimant_of(&self, donation: &Donation) -> FulfillmentResult<FoodRequest> {
        let request_id = donation.claimant_request_id.ok_or_else(|| {
            FulfillmentError::integrity(
                donation.id,
                format!("{} without a claimant request", donation.status),
            )
        })?;
        let request = self.store.request(request_id).await?.ok_or_else(|| {
            FulfillmentError::integrity(donation.id, format!("claimant request {} missing", request_id))
        })?;
        if request.donation_id != Some(donation.id) {
            return Err(FulfillmentError::integrity(
                donation.id,
                format!("request {} is not linked back to the donation", request_id),
            ));
        }
        Ok(request)
    }

    /// Loads a donation and rejects it if its deadline has passed
    async fn live_donation(
        &self,
        donation_id: Uuid,
        now: DateTime<Utc>,
    ) -> FulfillmentResult<Donation> {
        let donation = self.load_donation(donation_id).await?;
        if donation.effective_status(now) == DonationStatus::Expired {
            return Err(FulfillmentError::Expired(donation_id));
        }
        Ok(donation)
    }

    async fn load_donation(&self, id: Uuid) -> FulfillmentResult<Donation> {
        self.store
            .donation(id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Donation, id))
    }

    async fn load_request(&self, id: Uuid) -> FulfillmentResult<FoodRequest> {
        self.store
            .request(id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Request, id))
    }

    async fn load_assignment(&self, id: Uuid) -> FulfillmentResult<DeliveryAssignment> {
        self.store
            .assignment(id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Assignment, id))
    }

    fn require_partner(actor: &Actor, partner_id: Uuid) -> FulfillmentResult<()> {
        if actor.acts_for(Role::DeliveryPartner, partner_id) {
            Ok(())
        } else {
            Err(FulfillmentError::Forbidden(format!(
                "actor {} cannot act as partner {}",
                actor.id, partner_id
            )))
        }
    }
}
