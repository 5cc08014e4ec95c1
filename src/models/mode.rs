//! Connection mode and execution intent types.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a context hands out physical connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbMode {
    /// Fresh connection per operation, returned to the provider pool on release.
    Standard,
    /// Standard, plus one idle sentinel connection held for the context lifetime.
    KeepAlive,
    /// Ephemeral readers; writers serialized through a single-writer gate.
    SingleWriter,
    /// One pinned connection shared by every operation, guarded by a lock.
    SingleConnection,
    /// Auto-select from the connection target. Resolved once at construction.
    #[default]
    Best,
}

impl DbMode {
    /// Get the display name for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::KeepAlive => "keep_alive",
            Self::SingleWriter => "single_writer",
            Self::SingleConnection => "single_connection",
            Self::Best => "best",
        }
    }

    /// True for every mode except `Best`.
    pub fn is_concrete(&self) -> bool {
        !matches!(self, Self::Best)
    }
}

impl std::fmt::Display for DbMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "standard" => Ok(Self::Standard),
            "keep_alive" | "keepalive" => Ok(Self::KeepAlive),
            "single_writer" | "singlewriter" => Ok(Self::SingleWriter),
            "single_connection" | "singleconnection" => Ok(Self::SingleConnection),
            "best" => Ok(Self::Best),
            other => Err(format!(
                "Unknown db_mode '{}'. Expected one of: standard, keep_alive, single_writer, single_connection, best",
                other
            )),
        }
    }
}

/// What an operation intends to do with its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Read,
    Write,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which execution types a context accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadWriteMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl ReadWriteMode {
    pub fn allows_read(&self) -> bool {
        !matches!(self, Self::WriteOnly)
    }

    pub fn allows_write(&self) -> bool {
        !matches!(self, Self::ReadOnly)
    }

    pub fn allows(&self, execution: ExecutionType) -> bool {
        match execution {
            ExecutionType::Read => self.allows_read(),
            ExecutionType::Write => self.allows_write(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWrite => "read_write",
            Self::ReadOnly => "read_only",
            Self::WriteOnly => "write_only",
        }
    }
}

impl std::fmt::Display for ReadWriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadWriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "read_write" | "readwrite" => Ok(Self::ReadWrite),
            "read_only" | "readonly" => Ok(Self::ReadOnly),
            "write_only" | "writeonly" => Ok(Self::WriteOnly),
            other => Err(format!(
                "Unknown read_write_mode '{}'. Expected one of: read_write, read_only, write_only",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_mode_from_str() {
        assert_eq!("standard".parse::<DbMode>().unwrap(), DbMode::Standard);
        assert_eq!("KeepAlive".parse::<DbMode>().unwrap(), DbMode::KeepAlive);
        assert_eq!(
            "single-writer".parse::<DbMode>().unwrap(),
            DbMode::SingleWriter
        );
        assert_eq!(
            "single_connection".parse::<DbMode>().unwrap(),
            DbMode::SingleConnection
        );
        assert_eq!("BEST".parse::<DbMode>().unwrap(), DbMode::Best);
        assert!("pooled".parse::<DbMode>().is_err());
    }

    #[test]
    fn test_db_mode_display_roundtrips_through_from_str() {
        for mode in [
            DbMode::Standard,
            DbMode::KeepAlive,
            DbMode::SingleWriter,
            DbMode::SingleConnection,
            DbMode::Best,
        ] {
            assert_eq!(mode.to_string().parse::<DbMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_best_is_not_concrete() {
        assert!(!DbMode::Best.is_concrete());
        assert!(DbMode::Standard.is_concrete());
    }

    #[test]
    fn test_read_write_mode_allows() {
        assert!(ReadWriteMode::ReadWrite.allows(ExecutionType::Read));
        assert!(ReadWriteMode::ReadWrite.allows(ExecutionType::Write));
        assert!(ReadWriteMode::ReadOnly.allows(ExecutionType::Read));
        assert!(!ReadWriteMode::ReadOnly.allows(ExecutionType::Write));
        assert!(!ReadWriteMode::WriteOnly.allows(ExecutionType::Read));
        assert!(ReadWriteMode::WriteOnly.allows(ExecutionType::Write));
    }
}
