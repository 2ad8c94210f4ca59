//! Colloquy Companion Library
//!
//! Editor-side companion service that lets independently launched CLI
//! assistants discover a running editor, authenticate to it, and propose
//! file edits and navigation the user arbitrates in the editor.

pub mod actor;
pub mod auth;
pub mod constants;
pub mod diff;
pub mod discovery;
pub mod editor;
pub mod logging;
pub mod rpc;
pub mod tools;
pub mod types;

// Re-export Options for use in main.rs
pub use crate::main_types::Options;

mod main_types {
    use clap::Parser;

    #[derive(Parser, Debug, Clone)]
    pub struct Options {
        /// Enable development logging to the default log file
        #[arg(long, global = true)]
        pub dev_log: bool,
    }
}

pub use diff::{DiffRegistryHandle, DiffSession, ResolutionStatus, SessionState};
pub use discovery::{DiscoveryRecord, DiscoveryStore, ServerInstance};
pub use editor::{EditorApi, EditorHandle, WorkspaceEditor};
pub use rpc::CompanionServer;
pub use types::CompanionError;
