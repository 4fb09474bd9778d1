use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the client and server exchange bytes. Chosen once per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// The server's stdin/stdout.
    Stdio,
    /// A local socket (Unix domain socket, or a named pipe on Windows).
    Ipc,
    /// TCP on a loopback address.
    #[default]
    Socket,
}

impl TransportKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Ipc => "ipc",
            Self::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown transport kind '{0}' (expected stdio, ipc or socket)")]
pub struct UnknownTransport(String);

impl FromStr for TransportKind {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" | "pipe" => Ok(Self::Stdio),
            "ipc" => Ok(Self::Ipc),
            "socket" | "tcp" => Ok(Self::Socket),
            _ => Err(UnknownTransport(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases_case_insensitively() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Socket);
        assert_eq!("pipe".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!(" ipc ".parse::<TransportKind>().unwrap(), TransportKind::Ipc);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn default_is_socket() {
        assert_eq!(TransportKind::default(), TransportKind::Socket);
    }
}
