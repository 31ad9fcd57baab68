//! Tunnel pool
//!
//! Maintains a fixed-size rotating set of client tunnels per port mapping.
//! Rotation bounds relay channel lifetime (cloud relays cap stream
//! lifetimes) while preserving in-flight connections: a replaced tunnel
//! keeps servicing attached traffic and is disposed only after its own
//! downlink pump naturally completes.

use crate::tunnel::RelayTunnel;
use portbridge_transport::RelayConnector;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Builds fresh client tunnels for one port mapping
pub struct TunnelFactory {
    entity_path: String,
    configuration_key: i32,
    connector: Arc<dyn RelayConnector>,
    accept_ttl: Duration,
}

impl TunnelFactory {
    pub fn new(
        entity_path: impl Into<String>,
        configuration_key: i32,
        connector: Arc<dyn RelayConnector>,
        accept_ttl: Duration,
    ) -> Self {
        Self {
            entity_path: entity_path.into(),
            configuration_key,
            connector,
            accept_ttl,
        }
    }

    fn build(&self) -> Arc<RelayTunnel> {
        RelayTunnel::new_client(
            self.entity_path.clone(),
            self.configuration_key,
            self.connector.clone(),
            self.accept_ttl,
        )
    }
}

struct PoolInner {
    slots: Vec<Arc<RelayTunnel>>,
    cursor: usize,
    draining: Vec<Arc<RelayTunnel>>,
}

/// Fixed-size round-robin pool of client tunnels
pub struct TunnelPool {
    factory: TunnelFactory,
    inner: Mutex<PoolInner>,
}

impl TunnelPool {
    /// Slots are populated eagerly with unestablished tunnels; each dials
    /// its relay stream lazily on first use
    pub fn new(factory: TunnelFactory, channel_count: usize) -> Arc<Self> {
        let count = channel_count.max(1);
        let slots = (0..count).map(|_| factory.build()).collect();
        Arc::new(Self {
            factory,
            inner: Mutex::new(PoolInner {
                slots,
                cursor: 0,
                draining: Vec::new(),
            }),
        })
    }

    /// Next tunnel in round-robin order. A slot whose tunnel can no longer
    /// accept is replaced in place — concurrent callers never observe an
    /// empty slot — and the superseded tunnel drains until its downlink
    /// pump signals completion.
    pub fn get(self: &Arc<Self>) -> Arc<RelayTunnel> {
        let replaced;
        let fresh;
        {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.cursor = (inner.cursor + 1) % inner.slots.len();
            let slot = inner.cursor;

            if inner.slots[slot].can_still_accept() {
                return inner.slots[slot].clone();
            }

            fresh = self.factory.build();
            replaced = std::mem::replace(&mut inner.slots[slot], fresh.clone());
            inner.draining.push(replaced.clone());
            debug!(slot, tunnel = %replaced.name(), "rotating relay tunnel");
        }

        let pool = self.clone();
        tokio::spawn(async move {
            replaced.wait_closed().await;
            pool.inner
                .lock()
                .expect("pool poisoned")
                .draining
                .retain(|tunnel| !Arc::ptr_eq(tunnel, &replaced));
            debug!(tunnel = %replaced.name(), "drained tunnel disposed");
        });

        fresh
    }

    /// Close every active and still-draining tunnel
    pub async fn shutdown(&self) {
        let tunnels: Vec<Arc<RelayTunnel>> = {
            let inner = self.inner.lock().expect("pool poisoned");
            inner
                .slots
                .iter()
                .chain(inner.draining.iter())
                .cloned()
                .collect()
        };
        for tunnel in tunnels {
            tunnel.close().await;
        }
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().expect("pool poisoned").slots.len()
    }

    pub fn draining_count(&self) -> usize {
        self.inner.lock().expect("pool poisoned").draining.len()
    }
}
