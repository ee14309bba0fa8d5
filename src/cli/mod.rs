//! CLI module for akari - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for feeding the queue,
//! running dispatcher cycles, answering requests and inspecting state.

pub mod commands;

pub use commands::Cli;
