//! Round orchestration, application of intents and the exogenous
//! environment (topology, market).

pub mod market;
pub mod metrics;
pub mod parallel;
pub mod round;
pub mod runner;
pub mod settlement;
pub mod topology;
