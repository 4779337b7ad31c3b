//! Pool placement: on-disk layout, in-container supervisor client and the
//! pool manager itself.

pub mod layout;
pub mod manager;
pub mod supervisor;

pub use manager::{PoolConnection, PoolManager, PoolManagerStats, ReconcileReport};
