//! ipruler controller library.
//!
//! This crate primarily ships the `ipruler-controller` binary, but exposes
//! its internals as a library for integration testing.

pub mod agent;
pub mod api;
pub mod config;
pub mod controllers;
pub mod error;
pub mod locator;
pub mod manifest;
pub mod resources;
pub mod runtime;
pub mod state;
pub mod store;
