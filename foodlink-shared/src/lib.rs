pub mod models;

pub use models::events::{DomainEvent, EventEnvelope};
