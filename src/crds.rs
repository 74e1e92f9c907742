pub mod defs;
mod embedded;
pub mod impls;

pub use defs::{Function, FunctionSpec, TriggerType};
