//! Session handles
//!
//! A [`Handle`] is one named registration with the daemon. It owns the
//! daemon connection, the opaque resource id the daemon handed out, and the
//! event loop that delivers pushed events to handlers.
//!
//! Handles must be released with [`Handle::dispose`]. Dropping an undisposed
//! handle makes a best-effort release attempt, but only if a tokio runtime is
//! still around to carry it out.

use crate::config::ClientConfig;
use crate::dispatch::{DispatchStats, EventHandler, EventLoop, LoopControl, LoopState};
use crate::error::{HaggleError, Result};
use crate::gateway::Gateway;
use haggle_protocol::{methods, Attribute, DataObject, DataObjectId, Event, EventKind, Registration};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Handle {
    name: String,
    session_id: i32,
    resource_id: String,
    gateway: Arc<Gateway>,
    events: Arc<EventLoop>,
    /// Kinds the daemon accepted via `event.register`; held across the call
    event_kinds: tokio::sync::Mutex<HashSet<EventKind>>,
    disposed: AtomicBool,
    /// Held for the duration of a release; true once the release happened
    released: tokio::sync::Mutex<bool>,
}

#[derive(Deserialize)]
struct BatchResult {
    accepted: usize,
}

#[derive(Deserialize)]
struct PublishResult {
    id: DataObjectId,
}

#[derive(Deserialize)]
struct ShutdownResult {
    status: i32,
}

impl Handle {
    /// Register `name` with the daemon configured by the environment.
    pub async fn open(name: &str) -> Result<Self> {
        let config = ClientConfig::from_env()?;
        Self::open_with(name, &config).await
    }

    /// Register `name` with the daemon described by `config`.
    ///
    /// Fails with [`HaggleError::RegistrationFailed`] if the daemon cannot be
    /// reached or the name is already bound.
    pub async fn open_with(name: &str, config: &ClientConfig) -> Result<Self> {
        let (gateway, events) = Gateway::connect(&config.socket_path, config.call_timeout())
            .await
            .map_err(HaggleError::registration)?;

        let result = gateway
            .call(methods::SESSION_REGISTER, json!({ "name": name }))
            .await
            .map_err(HaggleError::registration)?;
        let registration: Registration = serde_json::from_value(result)
            .map_err(|e| HaggleError::registration(e.into()))?;

        info!(
            name,
            session_id = registration.session_id,
            "Registered with daemon"
        );

        Ok(Self {
            name: name.to_string(),
            session_id: registration.session_id,
            resource_id: registration.resource_id,
            gateway: Arc::new(gateway),
            events: EventLoop::new(events),
            event_kinds: tokio::sync::Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
            released: tokio::sync::Mutex::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> Result<i32> {
        self.ensure_live()?;
        Ok(self.session_id)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Release the registration with the daemon.
    ///
    /// Idempotent: concurrent and repeated calls collapse into one release.
    /// Stops the event loop first and waits for the handler in progress,
    /// whether the loop runs in the background or in another task's
    /// [`Handle::run`]. Release failures are logged, not returned.
    pub async fn dispose(&self) {
        let mut released = self.released.lock().await;
        if *released {
            return;
        }
        self.disposed.store(true, Ordering::SeqCst);

        self.events.close();
        self.events.join().await;

        let params = json!({ "resource_id": self.resource_id });
        match self.gateway.call(methods::SESSION_RELEASE, params).await {
            Ok(_) => info!(name = %self.name, session_id = self.session_id, "Released session"),
            Err(e) => warn!(
                name = %self.name,
                session_id = self.session_id,
                "Failed to release session: {}",
                e
            ),
        }
        self.gateway.close().await;
        *released = true;
    }

    /// Ask the daemon to terminate. Affects every session, not only this one.
    pub async fn shutdown(&self) -> Result<i32> {
        let result = self
            .call(methods::DAEMON_SHUTDOWN, json!({ "resource_id": self.resource_id }))
            .await?;
        let ShutdownResult { status } = serde_json::from_value(result)?;
        info!(session_id = self.session_id, status, "Requested daemon shutdown");
        Ok(status)
    }

    pub async fn ping(&self) -> Result<()> {
        let result = self.call(methods::PING, json!({})).await?;
        if result.as_str() == Some("pong") {
            Ok(())
        } else {
            Err(HaggleError::Protocol(format!("unexpected ping reply: {}", result)))
        }
    }

    /// Route events of `kind` to `handler`, replacing any previous handler.
    ///
    /// The daemon is told about the kind the first time it is registered.
    pub async fn register_event_interest<F>(&self, kind: EventKind, handler: F) -> Result<()>
    where
        F: Fn(Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_event_handler(kind, Arc::new(handler)).await
    }

    pub async fn register_event_handler(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.ensure_live()?;

        let mut announced = self.event_kinds.lock().await;

        // Installed before the daemon starts sending so nothing is dropped
        if self.events.set_handler(kind, handler.clone()) {
            debug!(%kind, session_id = self.session_id, "Replaced event handler");
        }

        if !announced.contains(&kind) {
            let params = json!({ "resource_id": self.resource_id, "kind": kind });
            if let Err(e) = self.call(methods::EVENT_REGISTER, params).await {
                self.events.remove_handler_if(kind, &handler);
                return Err(e);
            }
            announced.insert(kind);
        }
        Ok(())
    }

    /// Remove the local handler for `kind`.
    ///
    /// The daemon keeps sending these events; they are dropped and logged.
    pub fn remove_event_handler(&self, kind: EventKind) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.events.remove_handler(kind))
    }

    /// Callbacks run on the dispatch task when the loop starts and exits.
    pub fn set_loop_callbacks<S, E>(&self, on_start: S, on_stop: E) -> Result<()>
    where
        S: Fn() + Send + Sync + 'static,
        E: Fn() + Send + Sync + 'static,
    {
        self.ensure_live()?;
        self.events
            .set_callbacks(Some(Arc::new(on_start)), Some(Arc::new(on_stop)));
        Ok(())
    }

    pub async fn register_interest(&self, interest: Attribute) -> Result<()> {
        self.register_interests(std::slice::from_ref(&interest))
            .await
    }

    /// Register an interest with the default weight.
    pub async fn register_interest_named(&self, name: &str, value: &str) -> Result<()> {
        self.register_interest(Attribute::unweighted(name, value))
            .await
    }

    /// Register several interests; either all are accepted or the call fails.
    pub async fn register_interests(&self, interests: &[Attribute]) -> Result<()> {
        self.interest_batch(methods::INTERESTS_ADD, interests).await
    }

    pub async fn unregister_interest(&self, interest: Attribute) -> Result<()> {
        self.unregister_interests(std::slice::from_ref(&interest))
            .await
    }

    pub async fn unregister_interests(&self, interests: &[Attribute]) -> Result<()> {
        self.interest_batch(methods::INTERESTS_REMOVE, interests)
            .await
    }

    /// Request the current interest list; it arrives as an
    /// [`EventKind::InterestList`] event.
    pub async fn get_application_interests_async(&self) -> Result<()> {
        self.call(methods::INTERESTS_GET, json!({ "resource_id": self.resource_id }))
            .await?;
        Ok(())
    }

    /// Request data objects matching this session's interests; each arrives
    /// as an [`EventKind::NewDataObject`] event.
    pub async fn get_data_objects_async(&self) -> Result<()> {
        self.call(methods::DATAOBJECTS_GET, json!({ "resource_id": self.resource_id }))
            .await?;
        Ok(())
    }

    /// Publish `object`, returning the id the daemon stored it under.
    pub async fn publish_data_object(&self, object: &DataObject) -> Result<DataObjectId> {
        let params = json!({ "resource_id": self.resource_id, "data_object": object });
        let result = self.call(methods::DATAOBJECTS_PUBLISH, params).await?;
        let PublishResult { id } = serde_json::from_value(result)?;
        debug!(session_id = self.session_id, %id, "Published data object");
        Ok(id)
    }

    pub async fn delete_data_object(&self, object: &DataObject) -> Result<()> {
        self.delete_data_object_by_id(&object.id()).await
    }

    pub async fn delete_data_object_by_id(&self, id: &DataObjectId) -> Result<()> {
        let params = json!({ "resource_id": self.resource_id, "id": id });
        self.call(methods::DATAOBJECTS_DELETE, params).await?;
        Ok(())
    }

    /// Dispatch events in the calling task until stopped or the daemon
    /// closes the connection.
    ///
    /// Returns `Ok(false)` if a loop is already running on this handle.
    pub async fn run(&self) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.events.run_foreground().await)
    }

    /// Dispatch events on a spawned task.
    ///
    /// Returns `Ok(false)` if a loop is already running on this handle.
    pub fn run_background(&self) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.events.run_background())
    }

    /// Signal the running loop to exit after its current handler.
    pub fn stop(&self) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.events.stop())
    }

    /// Point-in-time query; false once disposed.
    pub fn is_running(&self) -> bool {
        self.events.is_running()
    }

    pub fn loop_state(&self) -> LoopState {
        self.events.state()
    }

    /// Events dispatched, dropped for want of a handler, and failed.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.events.stats()
    }

    /// Stop/query access to the event loop for use inside handlers.
    pub fn loop_control(&self) -> LoopControl {
        self.events.control()
    }

    async fn interest_batch(&self, method: &str, interests: &[Attribute]) -> Result<()> {
        self.ensure_live()?;
        let requested = interests.len();
        let params = json!({ "resource_id": self.resource_id, "interests": interests });
        let result = self.call(method, params).await?;
        let BatchResult { accepted } = serde_json::from_value(result)?;
        if accepted < requested {
            warn!(
                method,
                session_id = self.session_id,
                accepted,
                requested,
                "Daemon applied only part of an interest batch"
            );
            return Err(HaggleError::PartialBatch {
                accepted,
                requested,
            });
        }
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.ensure_live()?;
        debug!(method, session_id = self.session_id, "Calling daemon");
        self.gateway.call(method, params).await
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(HaggleError::HandleDisposed);
        }
        Ok(())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let Ok(mut released) = self.released.try_lock() else {
            return;
        };
        if *released {
            return;
        }
        *released = true;
        self.disposed.store(true, Ordering::SeqCst);
        self.events.close();

        warn!(
            name = %self.name,
            session_id = self.session_id,
            "Handle dropped without dispose()"
        );

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(name = %self.name, "No runtime to release session on; use unregister() to clean up");
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        let params = json!({ "resource_id": self.resource_id });
        runtime.spawn(async move {
            if let Err(e) = gateway.notify(methods::SESSION_RELEASE, params).await {
                debug!("Best-effort session release failed: {}", e);
            }
            gateway.close().await;
        });
    }
}

/// Release the registration for `name` without a live handle.
pub async fn unregister(name: &str) -> Result<()> {
    let config = ClientConfig::from_env()?;
    unregister_with(name, &config).await
}

pub async fn unregister_with(name: &str, config: &ClientConfig) -> Result<()> {
    let (gateway, _events) = Gateway::connect(&config.socket_path, config.call_timeout()).await?;
    let result = gateway
        .call(methods::SESSION_UNREGISTER, json!({ "name": name }))
        .await;
    gateway.close().await;
    result?;
    info!(name, "Unregistered session");
    Ok(())
}
