//! The walgo deployment engine.
//!
//! Everything that decides what to upload, drives the site-builder, and
//! reconciles the result lives here; the `walgo` binary under `src/bin` is a
//! thin clap layer over these modules. The split exists so the engine can be
//! driven and tested without a terminal, not to offer a stable public API;
//! depend on the CLI, not on this crate.

pub mod cache;
pub mod compress;
pub mod cost;
pub mod deploy;
pub mod fs;
pub mod hash;
pub mod ledger;
pub mod lock;
pub mod network;
pub mod preflight;
pub mod proc;
pub mod progress;
pub mod resources;
pub mod site;
pub mod toolchain;
