//! Boundary contracts: ingress validation, snapshot broadcast and the
//! durable intent log.

pub mod ingress;
pub mod intent_log;
pub mod publish;
