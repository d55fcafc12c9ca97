use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Opaque identifier of a fetchable contract (token address or pool address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage key of one record of a pool bundle.
    pub fn slot(&self, slot: PoolSlot) -> EntityKey {
        EntityKey(format!("{}/{}", self.0, slot.suffix()))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    SingleBalance,
    PoolBundle,
}

/// Admission order into a batch. Declared high first so `Ord` sorts high before low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Why a task was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Attempt {
    /// Requested by an observer.
    #[default]
    First,
    /// Automatic follow-up after a transient failure or a grant copy.
    Retry,
    /// Fresh fetch confirming that a newly issued grant actually works.
    Verify,
}

impl Attempt {
    pub fn is_first(self) -> bool {
        self == Attempt::First
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub entity: EntityKey,
    pub kind: TaskKind,
    /// Free-text origin tag, only used for tracing.
    pub origin: String,
    pub priority: Priority,
    pub attempt: Attempt,
    /// Set on tasks that only publish the outcome of a background recovery branch.
    pub report: Option<RecoveryReport>,
}

/// Failure found by a background recovery branch, written by the task that owns the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub slot: EntityKey,
    pub message: String,
}

impl FetchTask {
    pub fn new(entity: EntityKey, kind: TaskKind, origin: impl Into<String>, priority: Priority) -> Self {
        Self {
            entity,
            kind,
            origin: origin.into(),
            priority,
            attempt: Attempt::First,
            report: None,
        }
    }

    /// Follow-up of this task, admitted ahead of ordinary work.
    pub fn follow_up(&self, attempt: Attempt, origin: &str) -> Self {
        Self {
            entity: self.entity.clone(),
            kind: self.kind,
            origin: origin.to_string(),
            priority: Priority::High,
            attempt,
            report: None,
        }
    }

    /// Follow-up that records `message` on `slot` instead of querying.
    pub fn reporting(&self, slot: EntityKey, message: impl Into<String>) -> Self {
        Self {
            report: Some(RecoveryReport {
                slot,
                message: message.into(),
            }),
            ..self.follow_up(Attempt::Retry, "recovery-report")
        }
    }

    pub fn dedup_key(&self) -> (EntityKey, TaskKind) {
        (self.entity.clone(), self.kind)
    }

    /// Record consulted for the staleness window.
    pub fn record_key(&self) -> EntityKey {
        match self.kind {
            TaskKind::SingleBalance => self.entity.clone(),
            TaskKind::PoolBundle => self.entity.slot(PoolSlot::Lp),
        }
    }

    /// Every record this task writes.
    pub fn record_keys(&self) -> Vec<EntityKey> {
        match self.kind {
            TaskKind::SingleBalance => vec![self.entity.clone()],
            TaskKind::PoolBundle => PoolSlot::ALL.iter().map(|slot| self.entity.slot(*slot)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolSlot {
    Tvl,
    Lp,
    Staked,
}

impl PoolSlot {
    pub const ALL: [PoolSlot; 3] = [PoolSlot::Tvl, PoolSlot::Lp, PoolSlot::Staked];

    fn suffix(self) -> &'static str {
        match self {
            PoolSlot::Tvl => "tvl",
            PoolSlot::Lp => "lp",
            PoolSlot::Staked => "staked",
        }
    }
}

/// Per-entity state shown next to a balance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BalanceRecord {
    /// `None` means never fetched; `Some("0")` is a real zero.
    pub value: Option<String>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<Instant>,
    pub updated_at: Option<DateTime<Utc>>,
    pub needs_authorization: bool,
    /// Automatic grant recovery already ran for this entity during the session.
    pub already_attempted_recovery: bool,
}

impl BalanceRecord {
    pub const UNFETCHED: &'static str = "-";

    pub fn display_value(&self) -> &str {
        self.value.as_deref().unwrap_or(Self::UNFETCHED)
    }

    pub fn is_erroring(&self) -> bool {
        self.error.is_some() || self.needs_authorization
    }
}

/// Broadcast to observers after every write.
#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub entity: EntityKey,
    pub record: BalanceRecord,
}

/// Static metadata of a token or pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub symbol: String,
    pub decimals: u8,
    pub staking_contract: Option<String>,
    /// Set for pools: the LP token minted by the pool.
    pub lp_token: Option<String>,
}

/// Convert a base-unit integer string into a decimal string with trailing zeros trimmed.
pub fn format_amount(raw: &str, decimals: u8) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits = raw.trim_start_matches('0');
    let decimals = decimals as usize;
    if digits.is_empty() {
        return Some("0".to_string());
    }

    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals - digits.len() + 1), digits)
    } else {
        digits.to_string()
    };
    let (whole, frac) = padded.split_at(padded.len() - decimals);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        Some(whole.to_string())
    } else {
        Some(format!("{}.{}", whole, frac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount("12500000", 6).as_deref(), Some("12.5"));
        assert_eq!(format_amount("0", 6).as_deref(), Some("0"));
        assert_eq!(format_amount("000", 18).as_deref(), Some("0"));
        assert_eq!(format_amount("1", 6).as_deref(), Some("0.000001"));
        assert_eq!(format_amount("42", 0).as_deref(), Some("42"));
        assert_eq!(format_amount("1000000", 6).as_deref(), Some("1"));
        assert_eq!(format_amount("", 6), None);
        assert_eq!(format_amount("12.5", 6), None);
        assert_eq!(format_amount("-", 6), None);
    }

    #[test]
    fn test_priority_orders_high_first() {
        let mut tiers = vec![Priority::Low, Priority::High, Priority::Normal];
        tiers.sort();
        assert_eq!(tiers, vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn test_unfetched_differs_from_zero() {
        let unfetched = BalanceRecord::default();
        let zero = BalanceRecord {
            value: Some("0".to_string()),
            ..Default::default()
        };
        assert_eq!(unfetched.display_value(), "-");
        assert_eq!(zero.display_value(), "0");
        assert_ne!(unfetched, zero);
    }

    #[test]
    fn test_pool_bundle_record_key_is_lp_slot() {
        let pool = EntityKey::from("secret1pool");
        let task = FetchTask::new(pool.clone(), TaskKind::PoolBundle, "test", Priority::Normal);
        assert_eq!(task.record_key(), EntityKey::from("secret1pool/lp"));
        assert_ne!(pool.slot(PoolSlot::Tvl), pool.slot(PoolSlot::Staked));
    }
}
