//! Per-agent probabilistic state estimation and the utility model that
//! scores actions against it.

pub mod channel;
pub mod observation;
pub mod state;
pub mod utility;
