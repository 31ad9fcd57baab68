//! Relay tunnel lifecycle
//!
//! A tunnel couples one relay stream with its downlink pump, its frame
//! dispatcher, and every uplink pump it has spawned. Client-side tunnels
//! establish their relay stream lazily on first use and stop accepting
//! *new* local connections once their accept-TTL window expires; service
//! side tunnels are born around an already-accepted stream. Either way,
//! when the downlink pump ends — explicit stop, stream error, or clean end
//! of data — the tunnel releases everything it owns exactly once.

use crate::dispatcher::{CorrelationCallback, FrameDispatcher};
use crate::error::EngineError;
use crate::local_channel::{LocalChannelFactory, LocalDataChannel};
use crate::pump::{DownlinkPump, UplinkPump};
use crate::relay_channel::RelayDataChannel;
use portbridge_proto::{ConnectionId, TunnelPreamble};
use portbridge_transport::{RelayConnector, RelayStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

enum Link {
    /// No relay stream yet (client side before first use)
    Idle,
    Active {
        relay: Arc<RelayDataChannel>,
        dispatcher: Arc<FrameDispatcher>,
    },
    Closed,
}

/// One relay stream plus the pumps and dispatcher multiplexed on it
pub struct RelayTunnel {
    name: String,
    entity_path: String,
    configuration_key: i32,
    connector: Option<Arc<dyn RelayConnector>>,
    accept_ttl: Duration,
    /// Establishment gate: lazy dials never race
    link: Mutex<Link>,
    accept_deadline: StdMutex<Option<Instant>>,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
    done: Notify,
}

impl RelayTunnel {
    /// Client-side tunnel; the relay stream is dialed lazily on the first
    /// `ensure_relay_connection`
    pub fn new_client(
        entity_path: impl Into<String>,
        configuration_key: i32,
        connector: Arc<dyn RelayConnector>,
        accept_ttl: Duration,
    ) -> Arc<Self> {
        let entity_path = entity_path.into();
        Arc::new(Self {
            name: format!("client:{}#{}", entity_path, configuration_key),
            entity_path,
            configuration_key,
            connector: Some(connector),
            accept_ttl,
            link: Mutex::new(Link::Idle),
            accept_deadline: StdMutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            done: Notify::new(),
        })
    }

    /// Service-side tunnel around an accepted relay stream whose preamble
    /// has already been read and validated. New logical connections arrive
    /// only via dispatcher correlation: the first frame of an unknown id
    /// dials `target_host:target_port` and attaches an uplink pump.
    pub fn for_accepted(
        stream: RelayStream,
        target_host: impl Into<String>,
        target_port: u16,
        factory: Arc<dyn LocalChannelFactory>,
    ) -> Arc<Self> {
        let target_host = target_host.into();
        let relay = RelayDataChannel::new(stream);
        let stop = Arc::new(AtomicBool::new(false));

        let dispatcher = Arc::new_cyclic(|weak: &Weak<FrameDispatcher>| {
            let correlate = Self::correlation(
                weak.clone(),
                relay.clone(),
                stop.clone(),
                factory,
                target_host.clone(),
                target_port,
            );
            FrameDispatcher::with_correlation(correlate)
        });

        Arc::new(Self {
            name: format!("service:{}:{}", target_host, target_port),
            entity_path: String::new(),
            configuration_key: i32::from(target_port),
            connector: None,
            accept_ttl: Duration::ZERO,
            link: Mutex::new(Link::Active { relay, dispatcher }),
            accept_deadline: StdMutex::new(None),
            stop,
            closed: AtomicBool::new(false),
            done: Notify::new(),
        })
    }

    fn correlation(
        dispatcher: Weak<FrameDispatcher>,
        relay: Arc<RelayDataChannel>,
        stop: Arc<AtomicBool>,
        factory: Arc<dyn LocalChannelFactory>,
        target_host: String,
        target_port: u16,
    ) -> CorrelationCallback {
        Arc::new(move |connection_id: ConnectionId| {
            let dispatcher = dispatcher.clone();
            let relay = relay.clone();
            let stop = stop.clone();
            let factory = factory.clone();
            let target_host = target_host.clone();
            Box::pin(async move {
                let local = factory.dial(&target_host, target_port).await?;
                debug!(
                    connection_id = %connection_id,
                    target = %format!("{}:{}", target_host, target_port),
                    "dialed target for new tunneled connection"
                );
                let dispatcher = dispatcher.upgrade().ok_or(EngineError::TunnelClosed)?;
                UplinkPump::new(connection_id, local.clone(), relay, dispatcher, stop).spawn();
                Ok(local)
            })
        })
    }

    /// Launch the downlink pump (service side; the client side does this
    /// implicitly during establishment)
    pub async fn start(self: &Arc<Self>) {
        let link = self.link.lock().await;
        if let Link::Active { relay, dispatcher } = &*link {
            self.spawn_downlink(relay.clone(), dispatcher.clone());
        }
    }

    /// Attach a freshly accepted local connection (client side). Dials the
    /// relay stream and writes the tunnel preamble on first use, then
    /// registers the connection's queue and spawns its uplink pump.
    ///
    /// Establishment failure closes this tunnel and propagates; the caller
    /// must retry via the pool, which will hand out a replacement.
    pub async fn ensure_relay_connection(
        self: &Arc<Self>,
        local: Arc<LocalDataChannel>,
        connection_id: ConnectionId,
    ) -> Result<(), EngineError> {
        let mut link = self.link.lock().await;

        if self.closed.load(Ordering::Acquire) || matches!(*link, Link::Closed) {
            return Err(EngineError::TunnelClosed);
        }

        if matches!(*link, Link::Idle) {
            match self.establish().await {
                Ok((relay, dispatcher)) => {
                    *link = Link::Active { relay, dispatcher };
                }
                Err(e) => {
                    warn!(tunnel = %self.name, error = %e, "relay establishment failed");
                    *link = Link::Closed;
                    drop(link);
                    self.close().await;
                    return Err(e);
                }
            }
        }

        let (relay, dispatcher) = match &*link {
            Link::Active { relay, dispatcher } => (relay.clone(), dispatcher.clone()),
            _ => return Err(EngineError::TunnelClosed),
        };
        drop(link);

        dispatcher.add_queue(connection_id, local.clone());
        UplinkPump::new(connection_id, local, relay, dispatcher, self.stop.clone()).spawn();
        Ok(())
    }

    async fn establish(
        self: &Arc<Self>,
    ) -> Result<(Arc<RelayDataChannel>, Arc<FrameDispatcher>), EngineError> {
        let connector = self
            .connector
            .as_ref()
            .ok_or(EngineError::TunnelClosed)?
            .clone();
        let stream = connector.open(&self.entity_path).await?;
        let relay = RelayDataChannel::new(stream);
        relay
            .write_preamble(&TunnelPreamble::new(self.configuration_key))
            .await?;

        // The accept window opens at successful establishment.
        *self.accept_deadline.lock().expect("deadline poisoned") =
            Some(Instant::now() + self.accept_ttl);

        let dispatcher = Arc::new(FrameDispatcher::new());
        self.spawn_downlink(relay.clone(), dispatcher.clone());
        info!(tunnel = %self.name, "relay tunnel established");
        Ok((relay, dispatcher))
    }

    fn spawn_downlink(self: &Arc<Self>, relay: Arc<RelayDataChannel>, dispatcher: Arc<FrameDispatcher>) {
        let tunnel = self.clone();
        let pump = DownlinkPump::new(relay, dispatcher, self.stop.clone());
        tokio::spawn(async move {
            pump.run().await;
            // However the pump ended, the tunnel's resources go with it.
            tunnel.close().await;
        });
    }

    /// Whether the pool may route new local connections here. A tunnel past
    /// its TTL keeps servicing attached traffic but is excluded from new
    /// connection routing.
    pub fn can_still_accept(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match *self.accept_deadline.lock().expect("deadline poisoned") {
            Some(deadline) => Instant::now() < deadline,
            // Not yet established: accepting is what establishes it.
            None => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent teardown: stop the pumps, cascade-close every multiplexed
    /// connection, shut the relay stream. Each step is best effort and
    /// never prevents the next.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.store(true, Ordering::Release);

        let link = {
            let mut link = self.link.lock().await;
            std::mem::replace(&mut *link, Link::Closed)
        };
        if let Link::Active { relay, dispatcher } = link {
            dispatcher.clear().await;
            relay.shutdown().await;
            info!(
                tunnel = %self.name,
                metrics = ?relay.metrics().snapshot(),
                "relay tunnel closed"
            );
        } else {
            info!(tunnel = %self.name, "relay tunnel closed before establishment");
        }
        self.done.notify_waiters();
    }

    /// Resolves once the tunnel has fully closed
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.done.notified();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
