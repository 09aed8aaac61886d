mod common;

use chrono::Duration;
use common::{requester_of, Harness};
use foodlink_catalog::{FoodCategory, Quantity, QuantityUnit};
use foodlink_core::clock::ManualClock;
use foodlink_core::identity::Actor;
use foodlink_core::location::Location;
use foodlink_core::models::{
    AssignmentStatus, BillStatus, DeclineReason, Donation, DonationStatus, RequestStatus,
    Urgency,
};
use foodlink_core::payment::MockPaymentAuthority;
use foodlink_core::repository::EntityStore;
use foodlink_fulfillment::{ExpirySweeper, FulfillmentError, OutboxRelay, RetryPolicy, SweepReport};
use foodlink_store::BroadcastEventSink;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

fn sweeper(h: &Harness) -> ExpirySweeper {
    ExpirySweeper::new(
        h.store.clone(),
        h.clock.clone(),
        RetryPolicy::new(3, StdDuration::from_millis(1)),
        50,
    )
}

#[tokio::test]
async fn test_sweep_persists_expiry_of_unclaimed_donation() {
    let h = Harness::new();
    let due = h.donation_with(FoodCategory::PackagedFood, 5.0, 400, Duration::hours(1)).await;
    let fresh = h.donation().await;

    h.clock.advance(Duration::hours(2));
    let report = sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            expired: 1,
            skipped: 0,
            failed: 0,
            deferred: 0,
        }
    );

    let stored = h.store.donation(due.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DonationStatus::Expired);
    let untouched = h.store.donation(fresh.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, DonationStatus::Available);

    let events = h.store.pending_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].envelope.event.name(), "donation_expired");

    // Idempotent: nothing left to expire
    let again = sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(again, SweepReport::default());
}

#[tokio::test]
async fn test_sweep_unwinds_a_paid_claim() {
    let h = Harness::new();
    let donation = h
        .donation_with(FoodCategory::PackagedFood, 10.0, 1000, Duration::hours(4))
        .await;
    let request = h.request_with(FoodCategory::PackagedFood, 5.0, Urgency::Medium).await;
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

    h.clock.advance(Duration::hours(5));
    let report = sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(report.expired, 1);

    let stored = h.store.donation(donation.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DonationStatus::Expired);
    assert_eq!(stored.claimant_request_id, None);

    let request = h.store.request(request.id).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.donation_id, None);

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
}

#[tokio::test]
async fn test_sweep_leaves_delivered_donations_alone() {
    let h = Harness::new();
    let donation = h
        .donation_with(FoodCategory::PackagedFood, 10.0, 1000, Duration::hours(4))
        .await;
    let request = h.request_with(FoodCategory::PackagedFood, 5.0, Urgency::Medium).await;
    let requester = requester_of(&request);
    let partner_id = Uuid::new_v4();
    let partner = Actor::partner(partner_id);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    let confirmation = h
        .orchestrator
        .authorize_and_confirm(&requester, donation.id, &MockPaymentAuthority::approving())
        .await
        .unwrap();
    h.orchestrator
        .accept_delivery(&partner, confirmation.assignment.id, partner_id)
        .await
        .unwrap();
    h.orchestrator
        .begin_pickup(&partner, donation.id, partner_id)
        .await
        .unwrap();
    h.orchestrator
        .complete_delivery(&partner, donation.id)
        .await
        .unwrap();

    h.clock.advance(Duration::hours(10));
    assert_eq!(sweeper(&h).sweep_once().await.unwrap(), SweepReport::default());
    assert_eq!(
        h.orchestrator.donation(donation.id).await.unwrap().status,
        DonationStatus::Delivered
    );
}

#[tokio::test]
async fn test_sweep_respects_batch_size() {
    let h = Harness::new();
    for _ in 0..3 {
        h.donation_with(FoodCategory::PackagedFood, 5.0, 400, Duration::hours(1))
            .await;
    }
    h.clock.advance(Duration::hours(2));

    let small = ExpirySweeper::new(
        h.store.clone(),
        h.clock.clone(),
        RetryPolicy::default(),
        2,
    );
    assert_eq!(small.sweep_once().await.unwrap().expired, 2);
    assert_eq!(small.sweep_once().await.unwrap().expired, 1);
}

#[tokio::test]
async fn test_relay_drains_outbox_into_broadcast_sink() {
    let h = Harness::new();
    let donation = h.donation().await;
    let request = h.request().await;
    let requester = requester_of(&request);

    let sink = Arc::new(BroadcastEventSink::new(16));
    let mut rx = sink.subscribe();
    let relay = OutboxRelay::new(h.store.clone(), sink.clone(), 10);

    h.orchestrator
        .claim_donation(&requester, request.id, donation.id)
        .await
        .unwrap();
    h.orchestrator
        .authorize_and_confirm(&requester, donation.id, &MockPaymentAuthority::approving())
        .await
        .unwrap();

    assert_eq!(relay.relay_once().await.unwrap(), 2);
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.event.topic(), "foodlink.donation_claimed");
    assert_eq!(second.event.topic(), "foodlink.delivery_offered");
    assert_eq!(first.donation_id, donation.id);
    assert!(first.sequence < second.sequence);

    assert_eq!(relay.relay_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweeper_loop_stops_on_shutdown() {
    let h = Harness::new();
    let due = h.donation_with(FoodCategory::PackagedFood, 5.0, 400, Duration::hours(1)).await;
    h.clock.advance(Duration::hours(2));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(Arc::new(sweeper(&h)).run(StdDuration::from_millis(10), rx));
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    tx.send(true).unwrap();
    task.await.unwrap();

    let stored = h.store.donation(due.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DonationStatus::Expired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_racing_a_claim_never_strands_the_request() {
    for _ in 0..25 {
        let h = Harness::new();
        let donation = h
            .donation_with(FoodCategory::PackagedFood, 10.0, 1000, Duration::hours(2))
            .await;
        let request = h.request().await;
        let requester = requester_of(&request);

        // The claimant still sees the donation as live; the sweeper is
        // already past its deadline.
        let late_clock = Arc::new(ManualClock::new(common::start_time() + Duration::hours(3)));
        let sweeper = ExpirySweeper::new(
            h.store.clone(),
            late_clock,
            RetryPolicy::new(5, StdDuration::from_millis(1)),
            50,
        );

        let orchestrator = h.orchestrator.clone();
        let (request_id, donation_id) = (request.id, donation.id);
        let claim = tokio::spawn(async move {
            orchestrator
                .claim_donation(&requester, request_id, donation_id)
                .await
        });
        let sweep = tokio::spawn(async move { sweeper.sweep_once().await });

        let claimed = claim.await.unwrap();
        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.failed, 0);
        if let Err(e) = &claimed {
            assert!(
                matches!(
                    e,
                    FulfillmentError::Expired(_)
                        | FulfillmentError::AlreadyClaimed { .. }
                        | FulfillmentError::Conflict { .. }
                ),
                "unexpected claim error {:?}",
                e
            );
        }

        let stored = h.store.donation(donation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DonationStatus::Expired);
        assert_eq!(stored.claimant_request_id, None);
        let stored_request = h.store.request(request.id).await.unwrap().unwrap();
        assert_eq!(stored_request.status, RequestStatus::Pending);
        assert_eq!(stored_request.donation_id, None);

        let names: Vec<&str> = h
            .store
            .pending_events(10)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.envelope.donation_id == donation.id)
            .map(|e| e.envelope.event.name())
            .collect();
        if claimed.is_ok() {
            assert_eq!(names, vec!["donation_claimed", "donation_expired"]);
        } else {
            assert_eq!(names, vec!["donation_expired"]);
        }
    }
}

#[tokio::test]
async fn test_failing_row_is_deferred_instead_of_blocking_the_batch() {
    let h = Harness::new();
    let now = h.now();

    // Claimed by a request that no longer exists: every expiry attempt fails.
    let mut broken = Donation::new(
        Uuid::new_v4(),
        "Orphaned crates",
        FoodCategory::PackagedFood,
        Quantity::new(5.0, QuantityUnit::Packets),
        400,
        Location::new("Depot"),
        now + Duration::hours(1),
        now - Duration::hours(1),
    )
    .unwrap();
    broken.status = DonationStatus::Claimed;
    broken.claimant_request_id = Some(Uuid::new_v4());
    h.store.insert_donation(&broken).await.unwrap();
    let healthy = h.donation_with(FoodCategory::PackagedFood, 5.0, 400, Duration::hours(1)).await;
    h.clock.advance(Duration::hours(2));

    let single = ExpirySweeper::new(
        h.store.clone(),
        h.clock.clone(),
        RetryPolicy::new(2, StdDuration::from_millis(1)),
        1,
    );
    let first = single.sweep_once().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.expired, 0);

    let second = single.sweep_once().await.unwrap();
    assert_eq!(second.deferred, 1);
    assert_eq!(second.expired, 1);
    assert_eq!(
        h.store.donation(healthy.id).await.unwrap().unwrap().status,
        DonationStatus::Expired
    );

    // Once the backoff runs out the broken row is tried again
    h.clock.advance(Duration::minutes(2));
    let third = single.sweep_once().await.unwrap();
    assert_eq!(third.failed, 1);
    assert_eq!(third.deferred, 0);
}
