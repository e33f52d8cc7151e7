//! Run lifecycle, run records, and the stores and notifiers that persist and publish them.

pub mod file_store;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod notifier;
pub mod run_id;
pub mod store;

pub use file_store::{FileRunStore, StateFile};
pub use lifecycle::{validate_run_status, validate_run_transition, RunStatus};
pub use memory::InMemoryRunStore;
pub use model::{HostResult, RunState, StepState};
pub use notifier::{HttpNotifier, NotifyError, RunStateCallback, RunStateNotifier};
pub use run_id::{new_run_id, validate_run_id};
pub use store::{is_already_exists, is_not_found, sort_runs, ListFilter, RunStateStore};
