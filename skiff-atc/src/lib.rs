//! Skiff ATC
//!
//! Worker orchestration core: places containers on workers, runs resource
//! scripts inside them and keeps the worker fleet and container bookkeeping
//! reconciled with reality.

pub mod config;
pub mod db;
pub mod error;
pub mod gc;
pub mod lifecycle;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod repository;
pub mod resource;
pub mod script;
pub mod volume;
pub mod worker;

#[cfg(test)]
mod testing;
