//! Keel apply: plans and runs apply/prune/destroy against a remote system,
//! reporting progress as one ordered event stream.

#![forbid(unsafe_code)]

pub mod applier;
pub mod collector;
pub mod destroyer;
pub mod diff;
pub mod fake;
pub mod filter;
pub mod inventory;
pub mod runner;
pub mod solver;
pub mod task;

mod context;
mod error;
mod mutate;
mod remove;
mod wait;

pub use applier::{Applier, ApplierOptions, EventStream};
pub use collector::{CollectorError, ResourceInfo, ResourceState, ResourceStateCollector};
pub use destroyer::{Destroyer, DestroyerOptions};
pub use diff::{diff_summary, prune_candidates, DiffSummary};
pub use error::{ApplyError, ApplyResult};
pub use filter::{ValidationFilter, Verdict};
pub use inventory::{ConfigMapInventory, MemoryInventory};
pub use runner::RunState;
pub use solver::{TaskQueueBuilder, WaitPlan};
pub use task::{Task, TaskQueue, WaitCondition};
