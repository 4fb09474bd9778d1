//! Sidecar supervisor for the YARA language server.
//!
//! Provisions the server's runtime environment, launches the server process,
//! negotiates a transport, and exposes a JSON-RPC channel through a [`Session`]
//! whose lifecycle is an explicit state machine.

pub mod codec;
pub mod failure;
pub mod process;
pub mod provision;
pub mod sink;
pub mod transport;

pub(crate) mod protocol;

mod client;
mod manager;
mod session;

pub use client::{
    ChannelClosed, ClientError, ClientHandle, ClientOptions, LanguageClient, ServerEvent,
};
pub use manager::SessionManager;
pub use protocol::{
    COMPILE_ALL_RULES, COMPILE_RULE, PathToUriError, file_uri_to_path, path_to_file_uri,
};
pub use session::{Session, SessionError, SessionHandle, wait_for_state};
