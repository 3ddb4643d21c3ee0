//! Colony - mailbox delivery, dispatch daemon, and error self-healing for
//! isolated worker cells

pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod gate;
pub mod mailbox;
pub mod registry;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod watcher;
