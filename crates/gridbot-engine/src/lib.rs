//! Grid engine: per-symbol workers and the controller.
//!
//! Each deployed symbol gets one `GridWorker` task owning its
//! `GridState` exclusively. Workers react to price ticks, place and
//! cancel orders through the shared `Exchange` capability, and answer
//! control commands from their mailbox. The `Controller` owns the set
//! of workers, serializes control operations, and fans out the kill
//! switch.

pub mod controller;
pub mod error;
pub mod level;
pub mod params;
pub mod state;
pub mod worker;

pub use controller::{Controller, SystemSnapshot};
pub use error::{EngineError, EngineResult};
pub use level::GridLevel;
pub use params::{default_deployments, GridParameters};
pub use state::{GridSnapshot, GridState, GridStatus};
pub use worker::{
    spawn_worker, PauseOutcome, RebalanceOutcome, StartOutcome, StopOutcome, WorkerHandle,
};
