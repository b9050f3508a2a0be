//! Stand-in for the Haggle daemon
//!
//! Speaks the daemon's socket contract well enough to exercise the client
//! library: it keeps named sessions, their interests and registered event
//! kinds, stores published data objects and routes them to sessions whose
//! interests match an attribute exactly. There is no networking beyond the
//! local socket.
//!
//! Use [`MockDaemon`] in-process from tests, or run the `haggle-mock-daemon`
//! binary where a real process is needed (supervisor tests).
//!
//! ```no_run
//! use haggle_mock_daemon::MockDaemon;
//! use std::path::Path;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let daemon = MockDaemon::bind(Path::new("/tmp/haggle-test.sock")).await?;
//! let state = daemon.state();
//! tokio::spawn(daemon.run());
//! assert_eq!(state.session_count(), 0);
//! # Ok(())
//! # }
//! ```

mod server;
mod state;

pub use server::{MockDaemon, MockDaemonConfig};
pub use state::{ConnectionId, DaemonState};
