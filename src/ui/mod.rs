//! UI module - console surfaces
//!
//! Provides the interactive CLI (reedline-based REPL), the non-interactive
//! batch runner and the text rendering they share.

pub mod batch;
pub mod cli;
pub mod console;
pub mod render;
