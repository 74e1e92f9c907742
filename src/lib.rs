pub mod cli;
pub mod config;
pub mod consts;
pub mod controller;
pub mod crds;
pub mod main_actions;
pub mod runtime;
pub mod utils;

#[cfg(test)]
mod test_utils;
