#![forbid(unsafe_code)]

//! A compiler and cooperative runtime for programs built by placing symbols in a 3D grid.
//!
//! The [`compiler`] turns a spatial arrangement of symbols, labels and containers into a
//! [`Program`](ast::Program) tree. The [`engine`] runs programs one node at a time under a tick-driven
//! scheduler, with typed [`Value`](runtime::Value)s, structured control flow, and callable
//! [`functions`] guarded by depth, concurrency and time limits.

pub use compact_str;

#[macro_use]
pub mod slotmap;
pub mod vecmap;
pub mod util;
pub mod runtime;
pub mod ast;
pub mod grid;
pub mod catalogue;
pub mod compiler;
pub mod expr;
pub mod script;
pub mod process;
pub mod functions;
pub mod services;
pub mod engine;
pub mod std_util;

#[cfg(test)]
mod test;
