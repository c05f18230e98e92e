//! Follow-up handler registry and reaper
//!
//! Multi-packet exchanges register a handler under their request id so that
//! follow-up packets can find it. Handlers leave the registry exactly once,
//! through [`HandlerRegistry::unregister`] or the reaper, and their cleanup
//! runs outside the registry lock.

use crate::error::{RegistryError, TransferError};
use async_trait::async_trait;
use shwire_proto::FileDataPacket;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// A handler for follow-up packets of one request
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Instant after which the reaper removes the handler
    fn deadline(&self) -> Instant;

    /// Accept a follow-up packet
    async fn dispatch(&self, packet: FileDataPacket) -> Result<(), TransferError>;

    /// Release the handler's resources; called once, after removal
    async fn cleanup(&self);
}

/// Registered handlers plus rate-limit markers for error replies
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Uuid, Arc<dyn RpcHandler>>>,
    cooldowns: RwLock<HashMap<Uuid, Instant>>,
    cooldown: Duration,
}

impl HandlerRegistry {
    /// Create a registry whose error replies are spaced by `cooldown`
    pub fn new(cooldown: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            cooldowns: RwLock::new(HashMap::new()),
            cooldown,
        }
    }

    /// Register a handler; fails if one is already registered for `id`
    pub async fn register(&self, id: Uuid, handler: Arc<dyn RpcHandler>) -> Result<(), RegistryError> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        handlers.insert(id, handler);
        debug!("Registered handler for request {}", id);
        Ok(())
    }

    /// Remove a handler and run its cleanup. Returns false when nothing was
    /// registered, which makes repeated calls harmless.
    pub async fn unregister(&self, id: Uuid) -> bool {
        let removed = self.handlers.write().await.remove(&id);
        match removed {
            Some(handler) => {
                handler.cleanup().await;
                debug!("Unregistered handler for request {}", id);
                true
            }
            None => false,
        }
    }

    /// Whether a handler is registered for `id`
    pub async fn contains(&self, id: Uuid) -> bool {
        self.handlers.read().await.contains_key(&id)
    }

    /// Number of registered handlers
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Whether no handler is registered
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Route a follow-up packet to its handler.
    ///
    /// A handler that rejects a packet is unregistered, so its cleanup can
    /// report the failure.
    pub async fn dispatch(&self, packet: FileDataPacket) -> Result<(), RegistryError> {
        let id = packet.req_id;
        let handler = self.handlers.read().await.get(&id).cloned();
        let Some(handler) = handler else {
            return Err(RegistryError::NoHandler(id));
        };
        if let Err(e) = handler.dispatch(packet).await {
            debug!("Handler for request {} rejected a follow-up: {}", id, e);
            self.unregister(id).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Whether an error reply for `id` may be sent now. At most one reply per
    /// id is allowed within each cooldown window.
    pub async fn should_report(&self, id: Uuid) -> bool {
        let now = Instant::now();
        let mut cooldowns = self.cooldowns.write().await;
        match cooldowns.get(&id) {
            Some(until) if *until > now => false,
            _ => {
                cooldowns.insert(id, now + self.cooldown);
                true
            }
        }
    }

    /// Hold back error replies for `id` for one cooldown window
    pub async fn suppress(&self, id: Uuid) {
        self.cooldowns.write().await.insert(id, Instant::now() + self.cooldown);
    }

    /// Remove every handler whose deadline is at or before `now`, then run
    /// their cleanups. Also forgets expired cooldown markers. Returns the
    /// number of handlers removed.
    pub async fn reap_expired(&self, now: Instant) -> usize {
        let expired: Vec<(Uuid, Arc<dyn RpcHandler>)> = {
            let mut handlers = self.handlers.write().await;
            let ids: Vec<Uuid> = handlers
                .iter()
                .filter(|(_, handler)| handler.deadline() <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| handlers.remove(&id).map(|handler| (id, handler)))
                .collect()
        };

        for (id, handler) in &expired {
            info!("Request {} timed out, cleaning up", id);
            handler.cleanup().await;
        }

        self.cooldowns.write().await.retain(|_, until| *until > now);
        expired.len()
    }

    /// Run [`reap_expired`](Self::reap_expired) every `interval`
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.reap_expired(Instant::now()).await;
            }
        })
    }
}
