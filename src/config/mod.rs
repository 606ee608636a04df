//! Configuration document model, loader/validator, and roles file.

mod loader;
mod model;
mod roles;

pub use loader::{load_file, load_roles, load_str, start_order, validate, LoadedConfig, ScriptProbe};
pub use model::{
    scalar_map, scalar_role_map, ConfValue, ConfigDoc, EventConf, ListenerConf, OnexitConf,
    Settings, TaskConf,
};
pub use roles::RoleMap;
