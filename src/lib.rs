//! berth — a daemon that supervises fleets of long-running server processes.
//!
//! Each managed server ("program") owns an execution environment that starts,
//! stops, and monitors its underlying process, a bounded console buffer with
//! live listener fan-out, a maintenance task scheduler, and a sandboxed file
//! area. The [`registry::Registry`] is the process-wide table of programs and
//! the join point for orchestrated shutdown.

pub mod archive;
pub mod config;
pub mod console;
pub mod env;
pub mod files;
pub mod program;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use program::Program;
pub use registry::Registry;
