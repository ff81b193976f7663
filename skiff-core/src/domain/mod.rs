//! Core domain types
//!
//! This module contains the core domain structures used across Skiff crates.
//! These types are shared between the registry (for persistence) and the
//! orchestration core (for placement and execution).

pub mod build;
pub mod container;
pub mod resource;
pub mod worker;
