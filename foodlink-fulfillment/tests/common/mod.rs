#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use foodlink_catalog::{FoodCategory, PricingEngine, Quantity, QuantityUnit};
use foodlink_core::clock::ManualClock;
use foodlink_core::identity::Actor;
use foodlink_core::location::Location;
use foodlink_core::models::{Donation, FoodRequest, Urgency};
use foodlink_core::repository::EntityStore;
use foodlink_fulfillment::FulfillmentOrchestrator;
use foodlink_store::InMemoryEntityStore;
use std::sync::Arc;
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<InMemoryEntityStore>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Arc<FulfillmentOrchestrator>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryEntityStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let orchestrator = Arc::new(FulfillmentOrchestrator::new(
            store.clone(),
            PricingEngine::default(),
            clock.clone(),
        ));
        Self {
            store,
            clock,
            orchestrator,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use foodlink_core::clock::Clock;
        self.clock.now()
    }

    /// 10 packets of packaged food worth 1000, spoiling in 72h
    pub async fn donation(&self) -> Donation {
        self.donation_with(FoodCategory::PackagedFood, 10.0, 1000, Duration::hours(72))
            .await
    }

    pub async fn donation_with(
        &self,
        category: FoodCategory,
        amount: f64,
        listed_value: i64,
        spoils_in: Duration,
    ) -> Donation {
        let now = self.now();
        let donation = Donation::new(
            Uuid::new_v4(),
            "Biscuit cartons",
            category,
            Quantity::new(amount, QuantityUnit::Packets),
            listed_value,
            Location::with_point("Andheri depot", 19.1197, 72.8468),
            now + spoils_in,
            now,
        )
        .unwrap();
        self.store.insert_donation(&donation).await.unwrap();
        donation
    }

    pub async fn request(&self) -> FoodRequest {
        self.request_with(FoodCategory::PackagedFood, 5.0, Urgency::Medium)
            .await
    }

    pub async fn request_with(
        &self,
        category: FoodCategory,
        amount: f64,
        urgency: Urgency,
    ) -> FoodRequest {
        let request = FoodRequest::new(
            Uuid::new_v4(),
            category,
            Quantity::new(amount, QuantityUnit::Packets),
            urgency,
            Location::with_point("Jogeshwari shelter", 19.1360, 72.8490),
            self.now(),
        )
        .unwrap();
        self.store.insert_request(&request).await.unwrap();
        request
    }
}

pub fn requester_of(request: &FoodRequest) -> Actor {
    Actor::requester(request.requester_id)
}
