//! Keel core types: object identity, status, events, stats and the traits
//! implemented by the remote-facing collaborators (resource client, status
//! source, inventory store).

#![forbid(unsafe_code)]

pub mod client;
pub mod event;
pub mod inventory;
pub mod object;
pub mod stats;
pub mod status;

mod error;

pub use error::{CoreError, CoreResult};

pub mod prelude {
    pub use super::client::{DeleteOptions, DryRunStrategy, MutateOptions, PatchStrategy, PropagationPolicy, ResourceClient, StatusSource};
    pub use super::event::{
        ActionGroup, ApplyEvent, ApplyOperation, DeleteEvent, DeleteOperation, ErrorEvent, Event, InitEvent, PruneEvent,
        PruneOperation, ResourceAction, StatusEvent, ValidationEvent, WaitEvent, WaitOperation,
    };
    pub use super::inventory::{InventoryClient, InventoryInfo, InventoryPolicy};
    pub use super::object::{Object, ObjectIdentifier};
    pub use super::stats::{ResultError, Stats};
    pub use super::status::{ResourceStatus, Status};
    pub use super::{CoreError, CoreResult};
}
