pub mod claims;
pub mod error;
pub mod expiry;
pub mod matching;
pub mod orchestrator;
pub mod relay;
pub mod retry;

pub use claims::{ClaimCoordinator, Confirmation, ReleaseReason};
pub use error::{FulfillmentError, FulfillmentResult};
pub use expiry::{ExpirySweeper, SweepReport};
pub use matching::{DonationMatch, MatchFinder, RequestMatch};
pub use orchestrator::FulfillmentOrchestrator;
pub use relay::OutboxRelay;
pub use retry::RetryPolicy;
