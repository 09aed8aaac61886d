mod common;

use async_trait::async_trait;
use chrono::Duration;
use common::{requester_of, Harness};
use foodlink_catalog::{FoodCategory, Quantity, QuantityUnit};
use foodlink_core::identity::Actor;
use foodlink_core::location::Location;
use foodlink_core::models::{
    AssignmentStatus, BillStatus, DeclineReason, Donation, DonationStatus, FoodRequest,
    RequestStatus, Urgency,
};
use foodlink_core::payment::{
    MockPaymentAuthority, PaymentAuthority, PaymentError, PaymentRequest, PaymentResult,
};
use foodlink_core::repository::{AssignmentFilter, BillFilter, EntityStore};
use foodlink_fulfillment::{Confirmation, FulfillmentError, FulfillmentOrchestrator};
use std::sync::Arc;
use uuid::Uuid;

async fn claimed_and_paid(h: &Harness) -> (Confirmation, FoodRequest) {
    let donation = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    let confirmation = h
        .orchestrator
        .authorize_and_confirm(&requester, donation.id, &MockPaymentAuthority::approving())
        .await
        .unwrap();
    (confirmation, request)
}

#[tokio::test]
async fn test_full_fulfillment_flow_through_settlement() {
    let h = Harness::new();
    let donation = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);
    let partner_id = Uuid::new_v4();
    let partner = Actor::partner(partner_id);

    let claimed = h
        .orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    assert_eq!(claimed.status, DonationStatus::Claimed);
    assert_eq!(claimed.claimant_request_id, Some(request.id));
    let linked = h.orchestrator.request(request.id).await.unwrap();
    assert_eq!(linked.status, RequestStatus::Claimed);
    assert_eq!(linked.donation_id, Some(donation.id));

    let confirmation = h
        .orchestrator
        .authorize_and_confirm(&requester, donation.id, &MockPaymentAuthority::approving())
        .await
        .unwrap();
    assert_eq!(confirmation.donation.status, DonationStatus::AwaitingPickup);
    assert_eq!(confirmation.bill.final_price, 850);
    assert_eq!(confirmation.bill.platform_fee, 43);
    assert_eq!(confirmation.bill.donor_payout, 807);
    assert_eq!(confirmation.bill.status, BillStatus::Pending);
    assert!(confirmation.bill.transaction_id.starts_with("txn_"));
    assert_eq!(confirmation.assignment.status, AssignmentStatus::Offered);
    assert_eq!(
        h.orchestrator.request(request.id).await.unwrap().status,
        RequestStatus::InProgress
    );

    let accepted = h
        .orchestrator
        .accept_delivery(&partner, confirmation.assignment.id, partner_id)
        .await
        .unwrap();
    assert_eq!(accepted.status, AssignmentStatus::Accepted);
    let waiting = h.orchestrator.donation(donation.id).await.unwrap();
    assert_eq!(waiting.status, DonationStatus::AwaitingPickup);
    assert_eq!(waiting.assigned_partner_id, Some(partner_id));

    let in_transit = h
        .orchestrator
        .begin_pickup(&partner, donation.id, partner_id)
        .await
        .unwrap();
    assert_eq!(in_transit.status, DonationStatus::InTransit);

    h.clock.advance(Duration::hours(2));
    let delivered = h
        .orchestrator
        .complete_delivery(&partner, donation.id)
        .await
        .unwrap();
    assert_eq!(delivered.status, DonationStatus::Delivered);

    let bill = h.store.bill(confirmation.bill.id).await.unwrap().unwrap();
    assert_eq!(bill.status, BillStatus::Completed);
    assert_eq!(bill.final_price, 850, "bill is not re-priced at delivery");
    assert_eq!(
        h.orchestrator.request(request.id).await.unwrap().status,
        RequestStatus::Completed
    );
    let assignment = h.store.assignment(accepted.id).await.unwrap().unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Completed);
    assert!(assignment.completed_at.is_some());

    let settled = h
        .orchestrator
        .settle(&Actor::donor(donation.donor_id), donation.id)
        .await
        .unwrap();
    assert_eq!(settled.status, DonationStatus::Billed);

    let events = h.store.pending_events(100).await.unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.envelope.event.name()).collect();
    assert_eq!(
        names,
        vec![
            "donation_claimed",
            "delivery_offered",
            "delivery_accepted",
            "pickup_started",
            "delivery_completed",
            "bill_finalized",
            "donation_settled",
        ]
    );
    assert!(events
        .windows(2)
        .all(|w| w[0].envelope.sequence < w[1].envelope.sequence
            && w[0].position < w[1].position));
    assert_eq!(events[0].envelope.sequence, 2);
    assert_eq!(
        events.last().unwrap().envelope.sequence,
        settled.version,
        "last event sequence is the donation's final version"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_exactly_one_winner() {
    let h = Harness::new();
    let donation = h.donation().await;

    let mut requests = Vec::new();
    for _ in 0..8 {
        requests.push(h.request().await);
    }

    let mut handles = Vec::new();
    for request in &requests {
        let orchestrator = h.orchestrator.clone();
        let actor = requester_of(request);
        let request_id = request.id;
        let donation_id = donation.id;
        handles.push(tokio::spawn(async move {
            (
                request_id,
                orchestrator
                    .claim_donation(&actor, request_id, donation_id)
                    .await,
            )
        }));
    }

    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for handle in handles {
        let (request_id, result) = handle.await.unwrap();
        match result {
            Ok(_) => winners.push(request_id),
            Err(e) => losers.push(e),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 7);
    let winner = winners[0];
    for err in &losers {
        match err {
            FulfillmentError::AlreadyClaimed {
                status,
                claimant_request_id,
                ..
            } => {
                assert_eq!(*status, DonationStatus::Claimed);
                assert_eq!(*claimant_request_id, Some(winner));
            }
            other => panic!("expected AlreadyClaimed, got {:?}", other),
        }
    }

    // Losing requests are untouched
    for request in requests.iter().filter(|r| r.id != winner) {
        let current = h.orchestrator.request(request.id).await.unwrap();
        assert_eq!(current.status, RequestStatus::Pending);
        assert_eq!(current.donation_id, None);
    }
    let events = h.store.pending_events(100).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_declined_payment_releases_claim_without_bill() {
    let h = Harness::new();
    let donation = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .confirm_payment(
            &requester,
            donation.id,
            PaymentResult::Declined {
                reason: "insufficient funds".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::PaymentFailed { ref reason, .. } if reason == "insufficient funds"));

    let current = h.orchestrator.donation(donation.id).await.unwrap();
    assert_eq!(current.status, DonationStatus::Available);
    assert_eq!(current.claimant_request_id, None);
    let current_request = h.orchestrator.request(request.id).await.unwrap();
    assert_eq!(current_request.status, RequestStatus::Pending);
    assert_eq!(current_request.donation_id, None);
    assert!(h
        .store
        .bills(&BillFilter::for_donation(donation.id))
        .await
        .unwrap()
        .is_empty());

    let names: Vec<&str> = h
        .store
        .pending_events(100)
        .await
        .unwrap()
        .iter()
        .map(|e| e.envelope.event.name())
        .collect();
    assert_eq!(names, vec!["donation_claimed", "donation_released"]);
}

#[tokio::test]
async fn test_declining_authority_releases_claim() {
    let h = Harness::new();
    let donation = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .authorize_and_confirm(&requester, donation.id, &MockPaymentAuthority::declining())
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::PaymentFailed { .. }));
    assert_eq!(
        h.orchestrator.donation(donation.id).await.unwrap().status,
        DonationStatus::Available
    );

    // The donation is claimable again
    let other = h.request().await;
    h.orchestrator
        .claim_donation(&requester_of(&other), other.id, donation.id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_authority_changes_nothing() {
    let h = Harness::new();
    let donation = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);
    let authority = MockPaymentAuthority::approving();
    authority.set_offline(true);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .authorize_and_confirm(&requester, donation.id, &authority)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::PaymentUnavailable(_)));
    assert!(err.is_recoverable());

    let current = h.orchestrator.donation(donation.id).await.unwrap();
    assert_eq!(current.status, DonationStatus::Claimed);
    assert_eq!(current.claimant_request_id, Some(request.id));
    assert!(h
        .store
        .bills(&BillFilter::for_donation(donation.id))
        .await
        .unwrap()
        .is_empty());

    authority.set_offline(false);
    let confirmation = h
        .orchestrator
        .authorize_and_confirm(&requester, donation.id, &authority)
        .await
        .unwrap();
    assert_eq!(confirmation.donation.status, DonationStatus::AwaitingPickup);
}

#[tokio::test]
async fn test_read_after_deadline_is_expired_before_any_sweep() {
    let h = Harness::new();
    let donation = h
        .donation_with(FoodCategory::CookedFood, 20.0, 600, Duration::hours(3))
        .await;
    let request = h
        .request_with(FoodCategory::CookedFood, 10.0, Urgency::High)
        .await;

    h.clock.advance(Duration::hours(3) + Duration::seconds(1));

    let seen = h.orchestrator.donation(donation.id).await.unwrap();
    assert_eq!(seen.status, DonationStatus::Expired);
    let stored = h.store.donation(donation.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DonationStatus::Available, "not persisted yet");

    let err = h
        .orchestrator
        .claim_donation(&requester_of(&request), request.id, donation.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Expired(id) if id == donation.id));
    assert!(matches!(
        h.orchestrator.quote(donation.id).await,
        Err(FulfillmentError::Expired(_))
    ));
}

#[tokio::test]
async fn test_payment_after_deadline_is_rejected_as_expired() {
    let h = Harness::new();
    let donation = h
        .donation_with(FoodCategory::PackagedFood, 10.0, 1000, Duration::hours(2))
        .await;
    let request = h.request().await;
    let requester = requester_of(&request);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    h.clock.advance(Duration::hours(3));

    let err = h
        .orchestrator
        .confirm_payment(
            &requester,
            donation.id,
            PaymentResult::Authorized {
                transaction_id: "txn_late".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Expired(_)));
    assert!(h
        .store
        .bills(&BillFilter::for_donation(donation.id))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_quote_decays_toward_the_deadline() {
    let h = Harness::new();
    let donation = h.donation().await;

    assert_eq!(h.orchestrator.quote(donation.id).await.unwrap().final_price, 850);
    h.clock.advance(Duration::hours(71));
    assert_eq!(h.orchestrator.quote(donation.id).await.unwrap().final_price, 85);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_leave_one_accepted_assignment() {
    let h = Harness::new();
    let (confirmation, _) = claimed_and_paid(&h).await;
    let donation_id = confirmation.donation.id;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let orchestrator = h.orchestrator.clone();
        let partner_id = Uuid::new_v4();
        let assignment_id = confirmation.assignment.id;
        handles.push(tokio::spawn(async move {
            orchestrator
                .accept_delivery(&Actor::partner(partner_id), assignment_id, partner_id)
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(
                matches!(e, FulfillmentError::Conflict { .. }),
                "unexpected error {:?}",
                e
            ),
        }
    }
    assert_eq!(accepted, 1);

    let rows = h
        .store
        .assignments(
            &AssignmentFilter::for_donation(donation_id)
                .with_statuses(&[AssignmentStatus::Accepted]),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let donation = h.orchestrator.donation(donation_id).await.unwrap();
    assert_eq!(donation.assigned_partner_id, rows[0].partner_id);
}

#[tokio::test]
async fn test_decline_rebroadcasts_a_fresh_offer() {
    let h = Harness::new();
    let (confirmation, _) = claimed_and_paid(&h).await;
    let donation_id = confirmation.donation.id;
    let first_partner = Uuid::new_v4();

    let reoffer = h
        .orchestrator
        .decline_delivery(
            &Actor::partner(first_partner),
            confirmation.assignment.id,
            first_partner,
        )
        .await
        .unwrap();
    assert_eq!(reoffer.status, AssignmentStatus::Offered);
    assert_ne!(reoffer.id, confirmation.assignment.id);

    let declined = h
        .store
        .assignment(confirmation.assignment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(declined.status, AssignmentStatus::Declined);
    assert_eq!(declined.decline_reason, Some(DeclineReason::PartnerDeclined));
    assert_eq!(declined.partner_id, Some(first_partner));

    let donation = h.orchestrator.donation(donation_id).await.unwrap();
    assert_eq!(donation.status, DonationStatus::AwaitingPickup);
    assert_eq!(donation.assigned_partner_id, None);

    // The declined offer is terminal
    let second_partner = Uuid::new_v4();
    let err = h
        .orchestrator
        .accept_delivery(
            &Actor::partner(second_partner),
            confirmation.assignment.id,
            second_partner,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::InvalidTransition { .. }));

    h.orchestrator
        .accept_delivery(&Actor::partner(second_partner), reoffer.id, second_partner)
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator
            .donation(donation_id)
            .await
            .unwrap()
            .assigned_partner_id,
        Some(second_partner)
    );
}

#[tokio::test]
async fn test_partner_backing_out_frees_the_slot() {
    let h = Harness::new();
    let (confirmation, _) = claimed_and_paid(&h).await;
    let donation_id = confirmation.donation.id;
    let partner_id = Uuid::new_v4();
    let partner = Actor::partner(partner_id);

    h.orchestrator
        .accept_delivery(&partner, confirmation.assignment.id, partner_id)
        .await
        .unwrap();

    // Another partner cannot back out of someone else's acceptance
    let stranger = Uuid::new_v4();
    let err = h
        .orchestrator
        .decline_delivery(&Actor::partner(stranger), confirmation.assignment.id, stranger)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Forbidden(_)));

    let reoffer = h
        .orchestrator
        .decline_delivery(&partner, confirmation.assignment.id, partner_id)
        .await
        .unwrap();
    let donation = h.orchestrator.donation(donation_id).await.unwrap();
    assert_eq!(donation.status, DonationStatus::AwaitingPickup);
    assert_eq!(donation.assigned_partner_id, None);

    let open = h
        .store
        .assignments(
            &AssignmentFilter::for_donation(donation_id)
                .with_statuses(&[AssignmentStatus::Offered, AssignmentStatus::Accepted]),
        )
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, reoffer.id);
}

#[tokio::test]
async fn test_release_claim_refunds_and_withdraws() {
    let h = Harness::new();
    let (confirmation, request) = claimed_and_paid(&h).await;
    let donation_id = confirmation.donation.id;

    let released = h
        .orchestrator
        .release_claim(&requester_of(&request), donation_id)
        .await
        .unwrap();
    assert_eq!(released.status, DonationStatus::Available);
    assert_eq!(released.claimant_request_id, None);
    assert_eq!(released.assigned_partner_id, None);

    let bill = h.store.bill(confirmation.bill.id).await.unwrap().unwrap();
    assert_eq!(bill.status, BillStatus::Refunded);
    let offer = h
        .store
        .assignment(confirmation.assignment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(offer.status, AssignmentStatus::Declined);
    assert_eq!(offer.decline_reason, Some(DeclineReason::OfferWithdrawn));

    let request = h.orchestrator.request(request.id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.donation_id, None);
}

#[tokio::test]
async fn test_release_is_refused_once_in_transit() {
    let h = Harness::new();
    let (confirmation, request) = claimed_and_paid(&h).await;
    let donation_id = confirmation.donation.id;
    let partner_id = Uuid::new_v4();
    let partner = Actor::partner(partner_id);

    h.orchestrator
        .accept_delivery(&partner, confirmation.assignment.id, partner_id)
        .await
        .unwrap();
    h.orchestrator
        .begin_pickup(&partner, donation_id, partner_id)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .release_claim(&requester_of(&request), donation_id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_out_of_order_operations_are_invalid_transitions() {
    let h = Harness::new();
    let (confirmation, _) = claimed_and_paid(&h).await;
    let donation_id = confirmation.donation.id;
    let partner_id = Uuid::new_v4();

    let err = h
        .orchestrator
        .complete_delivery(&Actor::partner(partner_id), donation_id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::InvalidTransition { .. }));

    let err = h
        .orchestrator
        .settle(&Actor::donor(confirmation.donation.donor_id), donation_id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::InvalidTransition { .. }));

    // Pickup needs an accepted partner first
    let err = h
        .orchestrator
        .begin_pickup(&Actor::partner(partner_id), donation_id, partner_id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Forbidden(_)));
}

#[tokio::test]
async fn test_actors_are_checked() {
    let h = Harness::new();
    let donation = h.donation().await;
    let request = h.request().await;

    let stranger = Actor::requester(Uuid::new_v4());
    let err = h
        .orchestrator
        .claim_donation(&stranger, request.id, donation.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Forbidden(_)));

    let as_partner = Actor::partner(request.requester_id);
    let err = h
        .orchestrator
        .claim_donation(&as_partner, request.id, donation.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Forbidden(_)));

    // Operators may act for anyone
    h.orchestrator
        .claim_donation(&Actor::operator(Uuid::new_v4()), request.id, donation.id)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .confirm_payment(
            &stranger,
            donation.id,
            PaymentResult::Authorized {
                transaction_id: "txn_x".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Forbidden(_)));
}

#[tokio::test]
async fn test_claim_validates_category_and_quantity() {
    let h = Harness::new();
    let donation = h.donation().await;

    let wrong_category = h
        .request_with(FoodCategory::CookedFood, 5.0, Urgency::High)
        .await;
    let err = h
        .orchestrator
        .claim_donation(&requester_of(&wrong_category), wrong_category.id, donation.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Validation(_)));

    let too_much = h
        .request_with(FoodCategory::PackagedFood, 11.0, Urgency::High)
        .await;
    let err = h
        .orchestrator
        .claim_donation(&requester_of(&too_much), too_much.id, donation.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Validation(_)));

    assert_eq!(
        h.orchestrator.donation(donation.id).await.unwrap().status,
        DonationStatus::Available
    );
}

#[tokio::test]
async fn test_request_cannot_hold_two_donations() {
    let h = Harness::new();
    let first = h.donation().await;
    let second = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);

    h.orchestrator
        .claim_donation(&requester, request.id, first.id)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .claim_donation(&requester, request.id, second.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Validation(_)));
    assert_eq!(
        h.orchestrator.donation(second.id).await.unwrap().status,
        DonationStatus::Available
    );
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let h = Harness::new();
    let request = h.request().await;

    let err = h
        .orchestrator
        .claim_donation(&requester_of(&request), request.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::NotFound { .. }));

    let err = h.orchestrator.donation(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, FulfillmentError::NotFound { .. }));
}

/// Approves the charge, but the requester cancels while it is in flight
struct CancellingAuthority {
    orchestrator: Arc<FulfillmentOrchestrator>,
    requester: Actor,
}

#[async_trait]
impl PaymentAuthority for CancellingAuthority {
    async fn authorize(&self, request: &PaymentRequest) -> Result<PaymentResult, PaymentError> {
        self.orchestrator
            .release_claim(&self.requester, request.donation_id)
            .await
            .map_err(|e| PaymentError::Unavailable(e.to_string()))?;
        Ok(PaymentResult::Authorized {
            transaction_id: "txn_in_flight".to_string(),
        })
    }
}

#[tokio::test]
async fn test_authorized_payment_that_cannot_be_recorded_keeps_its_transaction() {
    let h = Harness::new();
    let donation = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    let authority = CancellingAuthority {
        orchestrator: h.orchestrator.clone(),
        requester,
    };
    let err = h
        .orchestrator
        .authorize_and_confirm(&requester, donation.id, &authority)
        .await
        .unwrap_err();

    match &err {
        FulfillmentError::UnrecordedPayment {
            donation_id,
            transaction_id,
            cause,
        } => {
            assert_eq!(*donation_id, donation.id);
            assert_eq!(transaction_id, "txn_in_flight");
            assert!(matches!(**cause, FulfillmentError::InvalidTransition { .. }));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.to_string().contains("txn_in_flight"));
    assert!(!err.is_recoverable());
    assert!(h
        .store
        .bills(&BillFilter::for_donation(donation.id))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_delivery_without_a_bill_is_an_integrity_error() {
    let h = Harness::new();
    let now = h.now();
    let partner_id = Uuid::new_v4();

    let mut request = FoodRequest::new(
        Uuid::new_v4(),
        FoodCategory::PackagedFood,
        Quantity::new(5.0, QuantityUnit::Packets),
        Urgency::High,
        Location::new("Shelter"),
        now,
    )
    .unwrap();
    let mut donation = Donation::new(
        Uuid::new_v4(),
        "Biscuit cartons",
        FoodCategory::PackagedFood,
        Quantity::new(10.0, QuantityUnit::Packets),
        1000,
        Location::new("Shelter"),
        now + Duration::hours(24),
        now,
    )
    .unwrap();
    donation.status = DonationStatus::InTransit;
    donation.claimant_request_id = Some(request.id);
    donation.assigned_partner_id = Some(partner_id);
    request.status = RequestStatus::InProgress;
    request.donation_id = Some(donation.id);
    h.store.insert_donation(&donation).await.unwrap();
    h.store.insert_request(&request).await.unwrap();

    let err = h
        .orchestrator
        .complete_delivery(&Actor::partner(partner_id), donation.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::Integrity(_)), "{:?}", err);

    let stored = h.store.donation(donation.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DonationStatus::InTransit);
    let stored_request = h.store.request(request.id).await.unwrap().unwrap();
    assert_eq!(stored_request.status, RequestStatus::InProgress);
}
