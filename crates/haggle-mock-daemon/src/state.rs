//! Session registry and data object store.
//!
//! All state sits behind one lock so that registration, routing and
//! release are observed atomically by every connection. The lock is never
//! held across an await point.

use haggle_protocol::{
    codes, Attribute, DataObject, DataObjectId, Event, EventKind, Node, Registration, RpcError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Counter for generating unique connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies one client socket connection for the lifetime of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outgoing lines for one connection.
pub(crate) type Outbox = mpsc::UnboundedSender<String>;

struct Session {
    name: String,
    session_id: i32,
    interests: Vec<Attribute>,
    event_kinds: HashSet<EventKind>,
    /// Connection currently attached to the session; `None` once it hung up
    link: Option<(ConnectionId, Outbox)>,
}

impl Session {
    fn push(&self, event: &Event) -> bool {
        let Some((_, outbox)) = &self.link else {
            return false;
        };
        match event.to_json_line(self.session_id) {
            Ok(line) => outbox.send(line).is_ok(),
            Err(e) => {
                warn!(session_id = self.session_id, "Failed to encode event: {}", e);
                false
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    /// resource id -> session
    sessions: HashMap<String, Session>,
    /// name -> resource id
    names: HashMap<String, String>,
    objects: Vec<DataObject>,
}

impl Registry {
    fn session(&self, resource_id: &str) -> Result<&Session, RpcError> {
        self.sessions
            .get(resource_id)
            .ok_or_else(|| bad_handle(resource_id))
    }

    fn session_mut(&mut self, resource_id: &str) -> Result<&mut Session, RpcError> {
        self.sessions
            .get_mut(resource_id)
            .ok_or_else(|| bad_handle(resource_id))
    }
}

fn bad_handle(resource_id: &str) -> RpcError {
    RpcError::new(
        codes::BAD_HANDLE,
        format!("Unknown resource id: {}", resource_id),
    )
}

fn rejected(message: impl Into<String>) -> RpcError {
    RpcError::new(codes::REJECTED_PAYLOAD, message)
}

/// Shared daemon state.
pub struct DaemonState {
    registry: RwLock<Registry>,
    next_session_id: AtomicI32,
    releases: AtomicUsize,
    requests: AtomicUsize,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_session_id: AtomicI32::new(1),
            releases: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn register(
        &self,
        name: &str,
        conn: ConnectionId,
        outbox: Outbox,
    ) -> Result<Registration, RpcError> {
        if name.trim().is_empty() {
            return Err(RpcError::new(codes::INVALID_PARAMS, "Session name is empty"));
        }

        let mut registry = self.registry.write().unwrap();
        if registry.names.contains_key(name) {
            return Err(RpcError::new(
                codes::NAME_IN_USE,
                format!("Name already registered: {}", name),
            ));
        }

        let registration = Registration {
            resource_id: uuid::Uuid::new_v4().to_string(),
            session_id: self.next_session_id.fetch_add(1, Ordering::SeqCst),
        };
        registry
            .names
            .insert(name.to_string(), registration.resource_id.clone());
        registry.sessions.insert(
            registration.resource_id.clone(),
            Session {
                name: name.to_string(),
                session_id: registration.session_id,
                interests: Vec::new(),
                event_kinds: HashSet::new(),
                link: Some((conn, outbox)),
            },
        );
        debug!(name, session_id = registration.session_id, %conn, "Session registered");
        Ok(registration)
    }

    pub(crate) fn release(&self, resource_id: &str) -> Result<(), RpcError> {
        let mut registry = self.registry.write().unwrap();
        let session = registry
            .sessions
            .remove(resource_id)
            .ok_or_else(|| bad_handle(resource_id))?;
        registry.names.remove(&session.name);
        self.releases.fetch_add(1, Ordering::SeqCst);
        debug!(name = %session.name, session_id = session.session_id, "Session released");
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) -> Result<(), RpcError> {
        let mut registry = self.registry.write().unwrap();
        let resource_id = registry.names.remove(name).ok_or_else(|| {
            RpcError::new(codes::BAD_HANDLE, format!("No session named {}", name))
        })?;
        registry.sessions.remove(&resource_id);
        debug!(name, "Session unregistered by name");
        Ok(())
    }

    /// Drop the connection's outbox from every session attached to it.
    pub(crate) fn detach(&self, conn: ConnectionId) {
        let mut registry = self.registry.write().unwrap();
        for session in registry.sessions.values_mut() {
            if matches!(&session.link, Some((id, _)) if *id == conn) {
                session.link = None;
            }
        }
    }

    pub(crate) fn register_event(&self, resource_id: &str, kind: EventKind) -> Result<(), RpcError> {
        let mut registry = self.registry.write().unwrap();
        registry.session_mut(resource_id)?.event_kinds.insert(kind);
        Ok(())
    }

    /// Add interests; all-or-nothing unless `limit` caps how many are applied.
    pub(crate) fn add_interests(
        &self,
        resource_id: &str,
        interests: Vec<Attribute>,
        limit: Option<usize>,
    ) -> Result<usize, RpcError> {
        for interest in &interests {
            interest
                .validate()
                .map_err(|e| rejected(format!("Invalid interest: {}", e)))?;
        }

        let mut registry = self.registry.write().unwrap();
        let session = registry.session_mut(resource_id)?;
        let take = limit.map_or(interests.len(), |l| l.min(interests.len()));
        for interest in interests.into_iter().take(take) {
            match session.interests.iter_mut().find(|i| **i == interest) {
                Some(existing) => *existing = interest,
                None => session.interests.push(interest),
            }
        }
        Ok(take)
    }

    pub(crate) fn remove_interests(
        &self,
        resource_id: &str,
        interests: &[Attribute],
    ) -> Result<usize, RpcError> {
        let mut registry = self.registry.write().unwrap();
        let session = registry.session_mut(resource_id)?;
        session.interests.retain(|i| !interests.contains(i));
        Ok(interests.len())
    }

    /// Push the session's interest list to it.
    pub(crate) fn queue_interests(&self, resource_id: &str) -> Result<(), RpcError> {
        let registry = self.registry.read().unwrap();
        let session = registry.session(resource_id)?;
        session.push(&Event::InterestListUpdate(session.interests.clone()));
        Ok(())
    }

    /// Push every stored object matching the session's interests to it.
    pub(crate) fn queue_matching_objects(&self, resource_id: &str) -> Result<usize, RpcError> {
        let registry = self.registry.read().unwrap();
        let session = registry.session(resource_id)?;
        let mut queued = 0;
        for object in registry
            .objects
            .iter()
            .filter(|o| o.matches(&session.interests))
        {
            if session.push(&Event::NewDataObject(object.clone())) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Store `object` and route it to every other interested session.
    pub(crate) fn publish(
        &self,
        resource_id: &str,
        object: DataObject,
        max_payload_bytes: usize,
    ) -> Result<DataObjectId, RpcError> {
        for attr in object.attributes() {
            attr.validate()
                .map_err(|e| rejected(format!("Invalid attribute: {}", e)))?;
        }
        let size = object.payload().inline_len();
        if size > max_payload_bytes {
            return Err(rejected(format!(
                "Payload of {} bytes exceeds limit of {}",
                size, max_payload_bytes
            )));
        }

        let id = object.id();
        let stored = object.with_id(id);

        let mut registry = self.registry.write().unwrap();
        registry.session(resource_id)?;
        registry.objects.retain(|o| o.id() != id);
        registry.objects.push(stored.clone());

        let event = Event::NewDataObject(stored.clone());
        let mut routed = 0;
        for (rid, session) in &registry.sessions {
            if rid == resource_id
                || !session.event_kinds.contains(&EventKind::NewDataObject)
                || !stored.matches(&session.interests)
            {
                continue;
            }
            if session.push(&event) {
                routed += 1;
            }
        }
        debug!(%id, routed, "Data object published");
        Ok(id)
    }

    pub(crate) fn delete(&self, resource_id: &str, id: &DataObjectId) -> Result<bool, RpcError> {
        let mut registry = self.registry.write().unwrap();
        registry.session(resource_id)?;
        let before = registry.objects.len();
        registry.objects.retain(|o| o.id() != *id);
        Ok(registry.objects.len() < before)
    }

    pub(crate) fn check(&self, resource_id: &str) -> Result<(), RpcError> {
        self.registry.read().unwrap().session(resource_id).map(|_| ())
    }

    /// Push `event` to every session registered for its kind.
    pub fn broadcast(&self, event: &Event) -> usize {
        let registry = self.registry.read().unwrap();
        registry
            .sessions
            .values()
            .filter(|s| s.event_kinds.contains(&event.kind()))
            .filter(|s| s.push(event))
            .count()
    }

    /// Push `event` to the session registered as `name`, whether or not it
    /// asked for that kind.
    pub fn push_event(&self, name: &str, event: &Event) -> bool {
        let registry = self.registry.read().unwrap();
        registry
            .names
            .get(name)
            .and_then(|rid| registry.sessions.get(rid))
            .map(|s| s.push(event))
            .unwrap_or(false)
    }

    pub fn broadcast_neighbors(&self, nodes: Vec<Node>) -> usize {
        self.broadcast(&Event::NeighborUpdate(nodes))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.read().unwrap().names.contains_key(name)
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().unwrap().sessions.len()
    }

    pub fn interests_of(&self, name: &str) -> Vec<Attribute> {
        let registry = self.registry.read().unwrap();
        registry
            .names
            .get(name)
            .and_then(|rid| registry.sessions.get(rid))
            .map(|s| s.interests.clone())
            .unwrap_or_default()
    }

    pub fn object_ids(&self) -> Vec<DataObjectId> {
        self.registry
            .read()
            .unwrap()
            .objects
            .iter()
            .map(DataObject::id)
            .collect()
    }

    /// Number of sessions released through `session.release`.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Number of requests and notifications received on any connection.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}
