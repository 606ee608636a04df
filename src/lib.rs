//! # legiond
//!
//! **legiond** is a Unix process supervisor: it launches, monitors, and
//! automatically restarts a declared set of long-running processes
//! according to a live configuration. The running set of children is
//! re-evaluated on every stimulus — child exits, file-system changes
//! (configuration, role membership, executables, script module
//! closures), and operator requests over a local HTTP endpoint — and
//! converged toward the configured world state.
//!
//! | Area              | Description                                                    | Key types                                  |
//! |-------------------|----------------------------------------------------------------|--------------------------------------------|
//! | **Event loop**    | Single-threaded multiplexer over signals, exits, watches, HTTP | [`Legion`], [`Poller`]                     |
//! | **Tasks**         | Per-task state machine: count, requires, delays, stop/backoff  | [`TaskSpec`], [`TaskRuntime`]              |
//! | **Watching**      | Native or polling file notification with burst aggregation     | [`FileWatcher`], [`ModuleWatcher`]         |
//! | **Context**       | Layered, role-gated substitution environment per process       | [`Context`]                                |
//! | **Configuration** | Transactional YAML/JSON document + roles file                  | [`ConfigDoc`], [`RoleMap`]                 |
//! | **Control plane** | Status and management HTTP endpoint                            | [`control`]                                |
//! | **Events**        | Broadcast lifecycle events with pluggable subscribers          | [`Bus`], [`Subscribe`]                     |
//!
//! The scheduling model is single-threaded cooperative: all supervisor
//! state lives on one event-loop task on a current-thread runtime, and
//! the only suspension points are the poller's wait and the spawn/reap
//! paths. Asynchronous stimuli are funneled through channels so they
//! appear as ordinary readiness on the [`Poller`].
//!
//! ```no_run
//! use legiond::{Bus, Legion, LegionParams, Outcome};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = LegionParams {
//!         config_file: "/etc/legiond.conf".into(),
//!         roles_file: Some("/etc/legiond.roles".into()),
//!         ..Default::default()
//!     };
//!     let mut legion = Legion::new(params, Bus::new(1024));
//!     match legion.run().await? {
//!         Outcome::Stopped => Ok(()),
//!         Outcome::Reset => {
//!             // Re-exec with the original argv to pick up new code.
//!             Ok(())
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod events;
pub mod legion;
pub mod pidfile;
pub mod poller;
pub mod signals;
pub mod task;
pub mod watch;

pub use config::{ConfigDoc, RoleMap};
pub use context::Context;
pub use error::{ConfigError, LegionError, TaskError, WatchError};
pub use events::{Bus, Event, EventKind, LogSubscriber, Subscribe, SubscriberSet};
pub use legion::{Legion, LegionParams, Outcome};
pub use poller::{Poller, SourceId, Stimulus};
pub use task::{ControlMode, TaskRuntime, TaskSpec};
pub use watch::{FileWatcher, ModuleWatcher, WatchMode};
