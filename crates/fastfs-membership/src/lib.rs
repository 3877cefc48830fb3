//! Cluster membership for FastFS.
//!
//! A minimal heartbeat-gossip membership layer: each node periodically
//! exchanges its known member list with a handful of peers over TCP. When a
//! name is first seen it is announced as a join; when a name hasn't been
//! heard from within `fail_timeout` it is announced as a leave. Join/leave/
//! update events are published on a broadcast channel so subscribers (the
//! hash ring, most importantly) never call back into this module directly —
//! consumers never call back into this module directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, MembershipError>;

/// A node name, `host:port`, as used for ring keys and HTTP redirects.
pub type NodeName = String;

/// Events emitted by the membership layer. Consumers subscribe via
/// [`Membership::subscribe`]; there is exactly one producer (this crate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(NodeName),
    Leave(NodeName),
    Update(NodeName),
}

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    from: NodeName,
    known: Vec<NodeName>,
}

struct Shared {
    self_name: NodeName,
    last_seen: RwLock<HashMap<NodeName, Instant>>,
    events: broadcast::Sender<MembershipEvent>,
}

/// A running membership session. Cheaply cloneable; clones share the same
/// background tasks and event bus.
#[derive(Clone)]
pub struct Membership {
    inner: Arc<Shared>,
}

/// Tunables for the heartbeat/failure-detection loop.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub heartbeat_interval: Duration,
    pub fail_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            fail_timeout: Duration::from_secs(10),
        }
    }
}

impl Membership {
    /// Bind the membership listener and start gossiping. `self_name` is this
    /// node's own `host:port` identity; `bind_addr` is the socket address to
    /// listen on (usually the same port, `0.0.0.0:port`). `seeds` is the
    /// initial contact list used to join an existing cluster; an empty list
    /// starts a new single-node cluster.
    pub async fn start(
        self_name: NodeName,
        bind_addr: std::net::SocketAddr,
        seeds: Vec<NodeName>,
        config: MembershipConfig,
    ) -> Result<Self> {
        let (tx, _rx) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            self_name: self_name.clone(),
            last_seen: RwLock::new(HashMap::new()),
            events: tx,
        });

        {
            let mut seen = shared.last_seen.write().await;
            seen.insert(self_name.clone(), Instant::now());
        }
        let me = Membership { inner: shared };

        for seed in &seeds {
            me.note_seen(seed, true).await;
        }

        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = %bind_addr, "membership listener bound");

        tokio::spawn(me.clone().accept_loop(listener));
        tokio::spawn(me.clone().gossip_loop(config.clone()));
        tokio::spawn(me.clone().reaper_loop(config));

        Ok(me)
    }

    /// Current membership list, including self.
    pub async fn members(&self) -> Vec<NodeName> {
        self.inner.last_seen.read().await.keys().cloned().collect()
    }

    /// Subscribe to join/leave/update events. Late subscribers only see
    /// events emitted after they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }

    async fn note_seen(&self, name: &NodeName, is_new_hint: bool) -> bool {
        let mut seen = self.inner.last_seen.write().await;
        let was_new = !seen.contains_key(name);
        seen.insert(name.clone(), Instant::now());
        drop(seen);

        if was_new {
            info!(node = %name, "node joined ring membership");
            let _ = self.inner.events.send(MembershipEvent::Join(name.clone()));
        } else if is_new_hint {
            let _ = self
                .inner
                .events
                .send(MembershipEvent::Update(name.clone()));
        }
        was_new
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let me = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = me.handle_inbound(stream).await {
                            debug!(%peer, error = %e, "membership inbound connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "membership accept failed"),
            }
        }
    }

    async fn handle_inbound(&self, mut stream: TcpStream) -> Result<()> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        let hb: Heartbeat = bincode::deserialize(&buf)?;

        self.note_seen(&hb.from, true).await;
        for name in &hb.known {
            if name != &self.inner.self_name {
                self.note_seen(name, false).await;
            }
        }

        let reply = Heartbeat {
            from: self.inner.self_name.clone(),
            known: self.members().await,
        };
        let payload = bincode::serialize(&reply)?;
        stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
        stream.write_all(&payload).await?;
        Ok(())
    }

    async fn gossip_once(&self, target: &NodeName) -> Result<()> {
        if target == &self.inner.self_name {
            return Ok(());
        }
        let mut stream = TcpStream::connect(target).await?;
        let hb = Heartbeat {
            from: self.inner.self_name.clone(),
            known: self.members().await,
        };
        let payload = bincode::serialize(&hb)?;
        stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
        stream.write_all(&payload).await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        let reply: Heartbeat = bincode::deserialize(&buf)?;

        self.note_seen(&reply.from, true).await;
        for name in &reply.known {
            if name != &self.inner.self_name {
                self.note_seen(name, false).await;
            }
        }
        Ok(())
    }

    async fn gossip_loop(self, config: MembershipConfig) {
        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        loop {
            ticker.tick().await;
            let targets: Vec<NodeName> = self
                .members()
                .await
                .into_iter()
                .filter(|n| n != &self.inner.self_name)
                .collect();
            for target in targets {
                if let Err(e) = self.gossip_once(&target).await {
                    debug!(node = %target, error = %e, "gossip round failed, peer may be down");
                }
            }
        }
    }

    async fn reaper_loop(self, config: MembershipConfig) {
        let mut ticker = tokio::time::interval(config.fail_timeout / 2);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let mut dead = Vec::new();
            {
                let mut seen = self.inner.last_seen.write().await;
                seen.retain(|name, last| {
                    if name == &self.inner.self_name {
                        return true;
                    }
                    let alive = now.duration_since(*last) < config.fail_timeout;
                    if !alive {
                        dead.push(name.clone());
                    }
                    alive
                });
            }
            for name in dead {
                warn!(node = %name, "node presumed dead, removing from membership");
                let _ = self.inner.events.send(MembershipEvent::Leave(name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_node_starts_and_contains_self() {
        let name = "127.0.0.1:19001".to_string();
        let addr = name.parse().unwrap();
        let m = Membership::start(name.clone(), addr, vec![], MembershipConfig::default())
            .await
            .unwrap();
        assert_eq!(m.members().await, vec![name]);
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other() {
        let name_a = "127.0.0.1:19011".to_string();
        let name_b = "127.0.0.1:19012".to_string();

        let a = Membership::start(
            name_a.clone(),
            name_a.parse().unwrap(),
            vec![],
            MembershipConfig {
                heartbeat_interval: Duration::from_millis(50),
                fail_timeout: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();

        let mut events_a = a.subscribe();

        let b = Membership::start(
            name_b.clone(),
            name_b.parse().unwrap(),
            vec![name_a.clone()],
            MembershipConfig {
                heartbeat_interval: Duration::from_millis(50),
                fail_timeout: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(MembershipEvent::Join(n)) = events_a.recv().await {
                    if n == name_b {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(joined.is_ok(), "node A should observe node B joining");

        let members_b = b.members().await;
        assert!(members_b.contains(&name_a));
        assert!(members_b.contains(&name_b));
    }
}
