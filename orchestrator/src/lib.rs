//! Multi-tenant orchestrator for trading-bot workers.
//!
//! Runs large numbers of isolated bot processes inside a small number of
//! shared pool containers, keeping memory cost roughly flat in the number
//! of containers rather than bots. The [`Mapper`] is the uniform surface an
//! API front-end talks to; the [`PoolManager`] owns placement state; the
//! [`HealthMonitor`] reconciles observed health with bounded recovery; the
//! [`MigrationEngine`] moves legacy dedicated bots into pools.
//!
//! Everything is constructed explicitly ([`Orchestrator::init`]) with the
//! container driver injected, so the whole control plane runs against an
//! in-memory runtime in tests.

pub mod config;
pub mod core;
pub mod errors;
pub mod health;
pub mod mapper;
pub mod migration;
pub mod pool;
pub mod store;

pub use config::{HostMode, Settings};
pub use errors::SvcError;
pub use health::HealthMonitor;
pub use mapper::{Connection, Mapper, Placement};
pub use migration::MigrationEngine;
pub use pool::PoolManager;

use std::sync::Arc;

use runtime::ContainerRuntime;

/// The wired control plane: manager, mapper and monitor sharing one driver.
pub struct Orchestrator {
    /// Placement state owner.
    pub manager: Arc<PoolManager>,
    /// Caller-facing façade.
    pub mapper: Arc<Mapper>,
    /// Periodic health reconciler.
    pub monitor: Arc<HealthMonitor>,
}

impl Orchestrator {
    /// Construct and wire the components and start the health timer.
    pub fn init(
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let manager = PoolManager::init(settings.clone(), runtime.clone());
        let mapper = Arc::new(Mapper::new(
            manager.clone(),
            runtime.clone(),
            settings.clone(),
        ));
        let monitor = HealthMonitor::new(manager.clone(), runtime, settings);
        monitor.start();
        Self {
            manager,
            mapper,
            monitor,
        }
    }

    /// Stop the health timer and persist placement state.
    pub async fn shutdown(&self) {
        self.monitor.shutdown();
        self.manager.shutdown().await;
    }
}
