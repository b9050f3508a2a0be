//! Client library for applications talking to the Haggle daemon
//!
//! An application opens a [`Handle`] under a unique name, registers event
//! handlers and interests, runs the event loop (in its own task or in the
//! background), publishes and deletes data objects, and finally disposes
//! the handle:
//!
//! ```no_run
//! use haggle_client::{Attribute, DataObject, Event, EventKind, Handle};
//!
//! # async fn demo() -> haggle_client::Result<()> {
//! let handle = Handle::open("photoshare").await?;
//! handle
//!     .register_event_interest(EventKind::NewDataObject, |event: Event| {
//!         println!("received {:?}", event);
//!         Ok(())
//!     })
//!     .await?;
//! handle.register_interest_named("topic", "x").await?;
//! handle.run_background()?;
//!
//! let object = DataObject::new().with_attribute(Attribute::new("topic", "x", 1));
//! handle.publish_data_object(&object).await?;
//!
//! handle.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! The [`supervisor`] module answers whether the daemon is running and can
//! launch it.

mod config;
mod dispatch;
mod error;
mod gateway;
mod handle;
pub mod supervisor;

pub use config::{
    ClientConfig, ENV_DAEMON, ENV_LAUNCH_TIMEOUT_MS, ENV_PID_FILE, ENV_SOCKET,
};
pub use dispatch::{DispatchStats, EventHandler, LoopControl, LoopState};
pub use error::{ErrorKind, HaggleError, Result, HAGGLE_ERROR};
pub use handle::{unregister, unregister_with, Handle};
pub use supervisor::{
    daemon_pid, daemon_status, spawn_daemon, DaemonStatus, LaunchProgress, SpawnOutcome,
    Supervisor,
};

pub use haggle_protocol::{
    Attribute, DataObject, DataObjectId, Event, EventKind, Node, NodeInterface, Payload,
};
