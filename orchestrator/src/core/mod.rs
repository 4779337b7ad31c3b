//! Identifiers and placement state for the bot-pool control plane.

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// String newtype identifiers. Keys that carry meaning (`instanceId`
/// uniqueness, `poolId` naming, pool ownership) are first-class types so the
/// maps over them cannot be mixed up.
macro_rules! impl_string_id {
    ($Name:ident, $Doc:literal) => {
        #[doc = $Doc]
        #[derive(
            Serialize,
            Deserialize,
            Debug,
            Clone,
            Eq,
            PartialEq,
            Ord,
            PartialOrd,
            Hash,
            Default,
        )]
        pub struct $Name(String);

        impl std::fmt::Display for $Name {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $Name {
            /// View as a plain string slice.
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
            /// Whether the identifier is empty.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $Name {
            fn from(id: &str) -> Self {
                $Name(id.to_string())
            }
        }
        impl From<String> for $Name {
            fn from(id: String) -> Self {
                $Name(id)
            }
        }
        impl From<&$Name> for $Name {
            fn from(id: &$Name) -> Self {
                id.clone()
            }
        }
    };
}

impl_string_id!(InstanceId, "Unique identifier of one bot instance");
impl_string_id!(UserId, "Owner of bots and pools");
impl_string_id!(PoolId, "Identifier of a shared pool container");

impl PoolId {
    /// Pool id `{userId}-pool-{number}`.
    pub fn for_user(user: &UserId, number: u32) -> Self {
        PoolId(format!("{}-pool-{}", user, number))
    }

    /// The numeric suffix of the pool id.
    pub fn number(&self) -> u32 {
        self.0
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

/// Pool container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Running,
    Stopped,
    Failed,
}

/// Per-bot placement lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

/// Last-observed resource usage of a pool container.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub memory_mb: f64,
    pub cpu_pct: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A shared container owned by one user, hosting up to `max_bots` bots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: PoolId,
    pub container_name: String,
    pub user_id: UserId,
    pub max_bots: usize,
    /// Floor of the contiguous port range `[base_port, base_port+max_bots)`.
    pub base_port: u16,
    /// Hosted bots, ordered by insertion.
    pub bots: Vec<InstanceId>,
    pub status: PoolStatus,
    #[serde(default)]
    pub metrics: PoolMetrics,
    pub created_at: DateTime<Utc>,
    /// On-disk layout root of this pool.
    pub workdir: PathBuf,
}

impl Pool {
    /// Whether another bot fits.
    pub fn has_capacity(&self) -> bool {
        self.bots.len() < self.max_bots
    }

    /// One past the last port of the pool's range.
    pub fn port_end(&self) -> u16 {
        self.base_port + self.max_bots as u16
    }

    /// Whether `port` belongs to this pool's range.
    pub fn owns_port(&self, port: u16) -> bool {
        port >= self.base_port && port < self.port_end()
    }
}

/// The placement of one bot inside one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub instance_id: InstanceId,
    pub pool_id: PoolId,
    pub user_id: UserId,
    pub slot_index: usize,
    pub port: u16,
    pub status: SlotStatus,
    pub host: String,
}

/// Basic credentials for a bot's HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotAuth {
    pub username: String,
    pub password: String,
}

/// The per-bot `config.json` kept in the bot's instance directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_balance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BotAuth>,
    /// Container name of a dedicated (non-pooled) bot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

/// The whole placement state, reflected to `.container-pool-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    pub pools: BTreeMap<PoolId, Pool>,
    pub bot_mapping: BTreeMap<InstanceId, Slot>,
    pub next_pool_id: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
            bot_mapping: BTreeMap::new(),
            next_pool_id: 1,
            updated_at: Utc::now(),
        }
    }
}

impl PoolState {
    /// A user's pools ordered by pool number, which equals insertion order
    /// since numbering is monotone per user.
    pub fn user_pools(&self, user: &UserId) -> Vec<&Pool> {
        let mut pools: Vec<&Pool> = self
            .pools
            .values()
            .filter(|p| &p.user_id == user)
            .collect();
        pools.sort_by_key(|p| p.id.number());
        pools
    }

    /// Next pool number for a user: one past the highest existing.
    pub fn next_pool_number(&self, user: &UserId) -> u32 {
        self.user_pools(user)
            .iter()
            .map(|p| p.id.number())
            .max()
            .map(|n| n + 1)
            .unwrap_or(1)
    }

    /// Ports used by the slots of one pool.
    pub fn used_ports(&self, pool: &Pool) -> Vec<u16> {
        pool.bots
            .iter()
            .filter_map(|id| self.bot_mapping.get(id))
            .map(|slot| slot.port)
            .collect()
    }

    /// Smallest free port in a pool's range, if any.
    pub fn free_port(&self, pool: &Pool) -> Option<u16> {
        let used = self.used_ports(pool);
        (pool.base_port..pool.port_end()).find(|p| !used.contains(p))
    }

    /// Cross-checks between pools, slots and ports. Violations indicate a
    /// placement bug; the manager asserts this after every commit in debug
    /// builds.
    pub fn consistency_errors(&self) -> Vec<String> {
        let mut errors = vec![];
        let mut seen = std::collections::HashSet::new();
        for pool in self.pools.values() {
            if pool.bots.len() > pool.max_bots {
                errors.push(format!(
                    "pool '{}' holds {} bots over capacity {}",
                    pool.id,
                    pool.bots.len(),
                    pool.max_bots
                ));
            }
            let mut ports = std::collections::HashSet::new();
            for id in &pool.bots {
                if !seen.insert(id.clone()) {
                    errors.push(format!(
                        "instance '{}' appears in more than one pool",
                        id
                    ));
                }
                match self.bot_mapping.get(id) {
                    None => errors.push(format!(
                        "instance '{}' in pool '{}' has no slot",
                        id, pool.id
                    )),
                    Some(slot) => {
                        if slot.pool_id != pool.id {
                            errors.push(format!(
                                "slot of '{}' points at pool '{}', hosted by '{}'",
                                id, slot.pool_id, pool.id
                            ));
                        }
                        if !pool.owns_port(slot.port) {
                            errors.push(format!(
                                "port {} of '{}' outside range of pool '{}'",
                                slot.port, id, pool.id
                            ));
                        }
                        if !ports.insert(slot.port) {
                            errors.push(format!(
                                "port {} duplicated in pool '{}'",
                                slot.port, pool.id
                            ));
                        }
                    }
                }
            }
        }
        for (id, slot) in &self.bot_mapping {
            match self.pools.get(&slot.pool_id) {
                None => errors.push(format!(
                    "slot of '{}' references unknown pool '{}'",
                    id, slot.pool_id
                )),
                Some(pool) => {
                    if !pool.bots.contains(id) {
                        errors.push(format!(
                            "slot of '{}' not in population of pool '{}'",
                            id, slot.pool_id
                        ));
                    }
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_numbering() {
        let user = UserId::from("alice");
        let id = PoolId::for_user(&user, 3);
        assert_eq!(id.as_str(), "alice-pool-3");
        assert_eq!(id.number(), 3);
    }

    #[test]
    fn next_pool_number_skips_to_max() {
        let user = UserId::from("bob");
        let mut state = PoolState::default();
        assert_eq!(state.next_pool_number(&user), 1);
        for n in [1u32, 4] {
            let id = PoolId::for_user(&user, n);
            state.pools.insert(
                id.clone(),
                Pool {
                    id,
                    container_name: format!("bob-pool-{}", n),
                    user_id: user.clone(),
                    max_bots: 3,
                    base_port: 9000,
                    bots: vec![],
                    status: PoolStatus::Running,
                    metrics: Default::default(),
                    created_at: Utc::now(),
                    workdir: PathBuf::from("/tmp"),
                },
            );
        }
        assert_eq!(state.next_pool_number(&user), 5);
    }

    #[test]
    fn free_port_picks_smallest_gap() {
        let user = UserId::from("carol");
        let pool_id = PoolId::for_user(&user, 1);
        let mut state = PoolState::default();
        let mut pool = Pool {
            id: pool_id.clone(),
            container_name: "carol-pool-1".into(),
            user_id: user.clone(),
            max_bots: 3,
            base_port: 9000,
            bots: vec![],
            status: PoolStatus::Running,
            metrics: Default::default(),
            created_at: Utc::now(),
            workdir: PathBuf::from("/tmp"),
        };
        for (i, port) in [(0usize, 9000u16), (1, 9002)] {
            let id = InstanceId::from(format!("b{}", i));
            pool.bots.push(id.clone());
            state.bot_mapping.insert(
                id.clone(),
                Slot {
                    instance_id: id,
                    pool_id: pool_id.clone(),
                    user_id: user.clone(),
                    slot_index: i,
                    port,
                    status: SlotStatus::Running,
                    host: "localhost".into(),
                },
            );
        }
        assert_eq!(state.free_port(&pool), Some(9001));
        state.pools.insert(pool_id, pool);
        assert!(state.consistency_errors().is_empty());
    }
}
