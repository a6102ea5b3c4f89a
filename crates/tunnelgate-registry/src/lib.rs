//! Process-wide mapping from subdomain id to [`ClientSession`].
//!
//! Mirrors the sharded-locking `DashMap` registry idiom this codebase
//! already uses for its HTTP route table, but keyed on tunnel subdomain
//! rather than request path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use regex_lite::Regex;
use thiserror::Error;
use tracing::{debug, info};

use tunnelgate_agent::{AgentError, TunnelAgent};
use tunnelgate_portpool::PortAllocator;
use tunnelgate_session::ClientSession;

/// Subdomain syntax enforced at the HTTP boundary (not by this crate),
/// exposed here so callers share one pattern.
pub const SUBDOMAIN_PATTERN: &str = r"^(?:[a-z0-9][a-z0-9-]{4,63}[a-z0-9]|[a-z0-9]{4,63})$";

fn subdomain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SUBDOMAIN_PATTERN).expect("subdomain pattern is valid regex"))
}

/// Whether `candidate` is a syntactically valid subdomain label.
pub fn is_valid_subdomain(candidate: &str) -> bool {
    subdomain_regex().is_match(candidate)
}

const RANDOM_ID_LEN: usize = 8;
const RANDOM_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn generate_random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_ID_LEN)
        .map(|_| RANDOM_ID_ALPHABET[rng.gen_range(0..RANDOM_ID_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Result of successfully creating a tunnel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClient {
    pub id: String,
    pub port: u16,
    pub max_conn_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub tunnels: u64,
}

struct Inner {
    clients: DashMap<String, ClientSession>,
    port_allocator: Arc<PortAllocator>,
    max_tcp_sockets: u32,
    /// Fallback kill-auth secret used for sessions created without their
    /// own bearer token; `None` leaves those sessions unkillable.
    default_secret: Option<String>,
}

/// Process-wide table of active tunnel sessions.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<Inner>,
}

impl ClientRegistry {
    pub fn new(
        port_allocator: Arc<PortAllocator>,
        max_tcp_sockets: u32,
        default_secret: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                clients: DashMap::new(),
                port_allocator,
                max_tcp_sockets,
                default_secret,
            }),
        }
    }

    /// Create (or adopt) a subdomain session.
    ///
    /// `requested_id`, when present and not already taken, is used
    /// verbatim (the caller is responsible for having already validated
    /// its syntax); otherwise a random id is assigned. `bearer_token`, if
    /// supplied, becomes the session's stored kill-auth secret; otherwise
    /// the registry's configured default secret is used (which may itself
    /// be absent, leaving the session unkillable).
    pub async fn new_client(
        &self,
        requested_id: Option<&str>,
        bearer_token: Option<String>,
    ) -> Result<NewClient, RegistryError> {
        let secret = bearer_token.or_else(|| self.inner.default_secret.clone());
        let mut try_requested = matches!(requested_id, Some(r) if !r.is_empty());
        let requested_id = requested_id.map(str::to_string);

        let (id, session) = loop {
            let candidate = if try_requested {
                requested_id.clone().expect("try_requested implies Some")
            } else {
                generate_random_id()
            };

            let agent = TunnelAgent::new(
                candidate.clone(),
                self.inner.max_tcp_sockets,
                Some(self.inner.port_allocator.clone()),
            );
            let (session, close_rx) = ClientSession::new(candidate.clone(), secret.clone(), agent);

            match self.inner.clients.entry(candidate.clone()) {
                Entry::Occupied(_) => {
                    // Collision: the just-built (not yet listening) agent/
                    // session is discarded; fall back to a random id from
                    // here on even if one was explicitly requested.
                    session.close();
                    try_requested = false;
                    continue;
                }
                Entry::Vacant(v) => {
                    v.insert(session.clone());
                    let registry = self.clone();
                    let cleanup_id = candidate.clone();
                    tokio::spawn(async move {
                        // Fires once the session closes itself (grace
                        // timeout, or the agent's fatal `end`).
                        let _ = close_rx.await;
                        registry.remove_client(&cleanup_id);
                    });
                    break (candidate, session);
                }
            }
        };

        match session.agent().listen().await {
            Ok(port) => {
                info!(id = %id, port, "tunnel session created");
                Ok(NewClient {
                    id,
                    port,
                    max_conn_count: self.inner.max_tcp_sockets,
                })
            }
            Err(e) => {
                self.inner.clients.remove(&id);
                session.close();
                Err(RegistryError::Agent(e))
            }
        }
    }

    /// Remove a session, releasing its port and tearing down its agent.
    /// Idempotent; returns whether a session was actually present.
    pub fn remove_client(&self, id: &str) -> bool {
        match self.inner.clients.remove(id) {
            Some((_, session)) => {
                session.close();
                debug!(id, "tunnel session removed");
                true
            }
            None => false,
        }
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.inner.clients.contains_key(id)
    }

    pub fn get_client(&self, id: &str) -> Option<ClientSession> {
        self.inner.clients.get(id).map(|entry| entry.value().clone())
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.inner.clients.len() as u64,
        }
    }
}
