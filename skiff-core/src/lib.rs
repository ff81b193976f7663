//! Skiff Core
//!
//! Core types and abstractions for the Skiff worker orchestration engine.
//!
//! This crate contains:
//! - Domain types: Workers, containers, resources and their lifecycle states
//! - DTOs: The JSON documents exchanged with resource scripts over stdio

pub mod domain;
pub mod dto;
