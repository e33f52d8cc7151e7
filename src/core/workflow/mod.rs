//! Workflow documents: model, loading, validation, guard evaluation, inventory resolution and
//! `${var}` rendering.

pub mod condition;
pub mod inventory;
pub mod loader;
pub mod model;
pub mod render;
pub mod validate;
pub mod vars;

pub use condition::evaluate;
pub use inventory::{resolve_targets, target_names};
pub use loader::{load_file, load_str};
pub use model::{Group, Handler, Host, HostSpec, Inventory, PlanPolicy, Step, TestSpec, Workflow};
pub use render::{render_string, render_value, render_vars};
pub use vars::{as_vars, merge_vars, value_to_string, Vars};
