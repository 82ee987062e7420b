pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod driver;
pub mod migrate;
pub mod reconcile;
pub mod remote;
pub mod runtime;
