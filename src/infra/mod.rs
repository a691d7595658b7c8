//! Infrastructure
//!
//! Wrappers around external processes

pub mod command;

pub use command::{
    discard_sink, CommandError, CommandExecutor, CommandOutcome, CommandRunner, CommandSpec, LogSink,
};
