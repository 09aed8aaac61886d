pub mod state;
pub mod worker;

pub use state::AppState;
pub use worker::{start_background_workers, Workers};
