//! Content-addressed state cache

use crate::{ShellState, ShellType, StateError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Default number of cached states
pub const DEFAULT_CAPACITY: usize = 256;

type Key = (ShellType, String);

#[derive(Default)]
struct Entries {
    states: HashMap<Key, Arc<ShellState>>,
    order: VecDeque<Key>,
    current: HashMap<ShellType, String>,
}

/// Cache of captured states keyed by `(shell type, hash)`, with one current
/// hash per shell type.
///
/// States are immutable once cached. When the cache is full the oldest entry
/// that is not current for its shell type is evicted.
pub struct ShellStateMap {
    entries: RwLock<Entries>,
    capacity: usize,
}

impl Default for ShellStateMap {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ShellStateMap {
    /// Create a cache holding at most `capacity` states
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    /// Hash and cache a state, returning its hash and shared handle
    pub async fn insert(&self, shell: ShellType, state: ShellState) -> Result<(String, Arc<ShellState>), StateError> {
        let hash = state.hash()?;
        let state = self.insert_hashed(shell, hash.clone(), Arc::new(state)).await;
        Ok((hash, state))
    }

    /// Cache a state whose hash is already known
    pub async fn insert_hashed(&self, shell: ShellType, hash: String, state: Arc<ShellState>) -> Arc<ShellState> {
        let mut entries = self.entries.write().await;
        let key = (shell, hash);
        if let Some(existing) = entries.states.get(&key) {
            return existing.clone();
        }

        while entries.states.len() >= self.capacity {
            let Some(victim) = oldest_evictable(&entries) else {
                break;
            };
            if let Some(pos) = entries.order.iter().position(|k| *k == victim) {
                entries.order.remove(pos);
            }
            entries.states.remove(&victim);
            debug!("Evicted cached {} state {}", victim.0, victim.1);
        }

        entries.order.push_back(key.clone());
        entries.states.insert(key, state.clone());
        state
    }

    /// Look up a state by hash
    pub async fn get(&self, shell: ShellType, hash: &str) -> Option<Arc<ShellState>> {
        let entries = self.entries.read().await;
        entries.states.get(&(shell, hash.to_string())).cloned()
    }

    /// Whether a state is cached
    pub async fn contains(&self, shell: ShellType, hash: &str) -> bool {
        self.get(shell, hash).await.is_some()
    }

    /// Mark a cached state as current for its shell type; false if not cached
    pub async fn set_current(&self, shell: ShellType, hash: &str) -> bool {
        let mut entries = self.entries.write().await;
        if !entries.states.contains_key(&(shell, hash.to_string())) {
            return false;
        }
        entries.current.insert(shell, hash.to_string());
        true
    }

    /// Current state for a shell type
    pub async fn current(&self, shell: ShellType) -> Option<(String, Arc<ShellState>)> {
        let entries = self.entries.read().await;
        let hash = entries.current.get(&shell)?;
        let state = entries.states.get(&(shell, hash.clone()))?;
        Some((hash.clone(), state.clone()))
    }

    /// Number of cached states
    pub async fn len(&self) -> usize {
        self.entries.read().await.states.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn oldest_evictable(entries: &Entries) -> Option<Key> {
    entries
        .order
        .iter()
        .find(|(shell, hash)| entries.current.get(shell) != Some(hash))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShellVar;

    fn state(cwd: &str) -> ShellState {
        let mut state = ShellState::new("bash v5.2.15(1)-release", cwd);
        state.vars.insert("X".to_string(), ShellVar::scalar(cwd));
        state
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let map = ShellStateMap::default();
        let (hash, stored) = map.insert(ShellType::Bash, state("/a")).await.unwrap();
        assert_eq!(hash, stored.hash().unwrap());
        assert!(map.contains(ShellType::Bash, &hash).await);
        assert!(!map.contains(ShellType::Zsh, &hash).await);
        assert!(map.current(ShellType::Bash).await.is_none());

        assert!(map.set_current(ShellType::Bash, &hash).await);
        let (current_hash, current) = map.current(ShellType::Bash).await.unwrap();
        assert_eq!(current_hash, hash);
        assert_eq!(current.cwd, "/a");

        assert!(!map.set_current(ShellType::Bash, "nope").await);
    }

    #[tokio::test]
    async fn test_duplicate_insert_keeps_first() {
        let map = ShellStateMap::default();
        let (_, first) = map.insert(ShellType::Bash, state("/a")).await.unwrap();
        let (_, second) = map.insert(ShellType::Bash, state("/a")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_eviction_spares_current() {
        let map = ShellStateMap::new(2);
        let (a, _) = map.insert(ShellType::Bash, state("/a")).await.unwrap();
        map.set_current(ShellType::Bash, &a).await;
        let (b, _) = map.insert(ShellType::Bash, state("/b")).await.unwrap();
        let (c, _) = map.insert(ShellType::Bash, state("/c")).await.unwrap();

        assert_eq!(map.len().await, 2);
        assert!(map.contains(ShellType::Bash, &a).await);
        assert!(!map.contains(ShellType::Bash, &b).await);
        assert!(map.contains(ShellType::Bash, &c).await);
    }
}
