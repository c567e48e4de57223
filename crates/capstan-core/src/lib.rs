//! Capstan Core - Realtime audio transport engine

pub mod audio;
pub mod config;
pub mod engine;
pub mod schedule;
pub mod types;

pub use types::*;
