use crate::config;
use crate::types::{EntityInfo, EntityKey};
use eyre::Result;
use std::collections::HashMap;

/// Static metadata lookup for tokens and pools.
pub trait EntityRegistry: Send + Sync {
    fn lookup(&self, key: &EntityKey) -> Option<EntityInfo>;
}

/// Registry backed by a map loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entities: HashMap<EntityKey, EntityInfo>,
}

impl StaticRegistry {
    pub fn new(entities: HashMap<EntityKey, EntityInfo>) -> Self {
        Self { entities }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        Ok(Self::new(config::load_registry_file(path)?))
    }

    pub fn with_token(mut self, address: &str, symbol: &str, decimals: u8) -> Self {
        self.entities.insert(
            EntityKey::from(address),
            EntityInfo {
                symbol: symbol.to_string(),
                decimals,
                staking_contract: None,
                lp_token: None,
            },
        );
        self
    }

    pub fn with_pool(mut self, address: &str, lp_token: &str, decimals: u8, staking: Option<&str>) -> Self {
        self.entities.insert(
            EntityKey::from(address),
            EntityInfo {
                symbol: address.to_string(),
                decimals,
                staking_contract: staking.map(str::to_string),
                lp_token: Some(lp_token.to_string()),
            },
        );
        self
    }

    pub fn tokens(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities
            .iter()
            .filter(|(_, info)| info.lp_token.is_none())
            .map(|(key, _)| key)
    }

    pub fn pools(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities
            .iter()
            .filter(|(_, info)| info.lp_token.is_some())
            .map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityRegistry for StaticRegistry {
    fn lookup(&self, key: &EntityKey) -> Option<EntityInfo> {
        self.entities.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_and_pools_are_split() {
        let registry = StaticRegistry::default()
            .with_token("secret1a", "A", 6)
            .with_pool("secret1pool", "secret1lp", 6, Some("secret1staking"));

        assert_eq!(registry.tokens().count(), 1);
        assert_eq!(registry.pools().collect::<Vec<_>>(), vec![&EntityKey::from("secret1pool")]);
        assert!(registry.lookup(&EntityKey::from("secret1missing")).is_none());
    }
}
