//! Core domain types for yls.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! The supervisor (`yls-lsp`), the config loader and the CLI all speak in these types.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod diagnostic;
mod failure;
mod selector;
mod session;
mod settings;
mod transport;

pub use diagnostic::{DiagnosticSeverity, RuleDiagnostic};
pub use failure::{Failure, FailureKind};
pub use selector::DocumentSelector;
pub use session::SessionState;
pub use settings::{
    LifecycleSettings, ProvisionSettings, ServerSettings, SettingsError, SupervisorSettings,
    TransportSettings,
};
pub use transport::{TransportKind, UnknownTransport};

/// Language identifier of the rule language handled by the server.
pub const RULE_LANGUAGE_ID: &str = "yara";

/// Package the provisioned runtime must list for the environment to count as installed.
pub const SERVER_PACKAGE: &str = "yarals";
