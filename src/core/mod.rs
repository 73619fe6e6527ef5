pub mod agent_id;
pub mod amount;
pub mod balance_sheet;
pub mod config;
pub mod error;
pub mod intent;
pub mod snapshot;
