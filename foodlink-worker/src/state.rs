use foodlink_catalog::{PricingConfig, PricingEngine, PricingError};
use foodlink_core::clock::Clock;
use foodlink_core::events::EventSink;
use foodlink_core::repository::EntityStore;
use foodlink_fulfillment::{ExpirySweeper, FulfillmentOrchestrator, MatchFinder, OutboxRelay, RetryPolicy};
use foodlink_store::Config;
use std::sync::Arc;
use std::time::Duration;

/// Everything wired from one `Config`. The orchestrator and match finder
/// are what an embedding API calls; the sweeper and relay run as loops.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub orchestrator: Arc<FulfillmentOrchestrator>,
    pub matches: Arc<MatchFinder>,
    pub sweeper: Arc<ExpirySweeper>,
    pub relay: Arc<OutboxRelay>,
    pub sweep_interval: Duration,
    pub relay_interval: Duration,
}

impl AppState {
    pub fn build(
        config: &Config,
        store: Arc<dyn EntityStore>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PricingError> {
        let rules = &config.business_rules;
        let pricing = PricingEngine::new(PricingConfig {
            platform_fee_fraction: rules.platform_fee_fraction,
        })?;

        let orchestrator = FulfillmentOrchestrator::new(store.clone(), pricing.clone(), clock.clone())
            .with_currency(rules.currency.clone());
        let matches = MatchFinder::new(store.clone(), pricing, rules.match_radius_km);

        let retry = RetryPolicy::new(
            config.sweeper.max_attempts,
            Duration::from_millis(config.sweeper.base_delay_ms),
        );
        let sweeper = ExpirySweeper::new(store.clone(), clock, retry, config.sweeper.batch_size);
        let relay = OutboxRelay::new(store.clone(), sink, config.relay.batch_size);

        Ok(Self {
            store,
            orchestrator: Arc::new(orchestrator),
            matches: Arc::new(matches),
            sweeper: Arc::new(sweeper),
            relay: Arc::new(relay),
            sweep_interval: Duration::from_secs(config.sweeper.interval_secs),
            relay_interval: Duration::from_millis(config.relay.interval_ms),
        })
    }
}
