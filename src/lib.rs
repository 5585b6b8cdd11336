//! Trapdoor - interactive user-mode process debugger
//!
//! The library half of the `trapdoor` binary: the debugging engine, the
//! platform backends and the operator surfaces built on top of them.

pub mod app;
pub mod core;
pub mod debug;
pub mod disasm;
pub mod ui;
