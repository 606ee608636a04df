//! Task specifications, process slots, spawning, and the per-task
//! supervisor state machine.

mod slot;
mod spawn;
mod spec;
mod supervisor;

pub use slot::{BackoffPolicy, ProcessSlot, SlotPhase, STABLE_WINDOW};
pub use spawn::{lookup_path, resolve_identity, Identity, SpawnRequest};
pub use spec::{ControlMode, EventAction, EventBind, EventSpec, OnExit, TaskSpec};
pub use supervisor::{
    ContextSeed, ProcStatus, ReqSnapshot, TaskCtx, TaskEffect, TaskRuntime, TaskStatus,
    WatchRequest, SIGKILL_ESCALATION,
};
