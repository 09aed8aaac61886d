pub mod app_config;
pub mod database;
pub mod events;
pub mod memory_repo;
pub mod postgres_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use events::BroadcastEventSink;
#[cfg(feature = "kafka")]
pub use events::KafkaEventSink;
pub use memory_repo::InMemoryEntityStore;
pub use postgres_repo::PostgresEntityStore;
