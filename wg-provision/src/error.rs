// Provisioning error kinds

//! Errors raised by the provisioning core
//!
//! Every variant is fatal to the current run. The orchestrator wraps them in
//! `anyhow` context naming the step that failed.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions raised by allocation, key management and rendering
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Target host does not meet the version/capability requirements
    #[error("host precondition not met: {0}")]
    Precondition(String),

    /// Roster does not fit in the configured address block
    #[error(
        "ordinal {ordinal} does not fit in {block}: at most {capacity} ordinals available \
         (ordinal 1 is the server)"
    )]
    Allocation {
        /// First ordinal that did not fit
        ordinal: u32,
        /// Block in CIDR notation
        block: String,
        /// Highest ordinal the block can hold
        capacity: u32,
    },

    /// Key-generation primitive failed or produced unusable output
    #[error("key generation failed for {identity}: {reason}")]
    KeyGeneration {
        /// Identity being created (`server` or a client name)
        identity: String,
        /// What went wrong
        reason: String,
    },

    /// Materials directory could not be read or written
    #[error("key store I/O failed on {}: {source}", .path.display())]
    Persistence {
        /// File or directory involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Stored identity lacks a part that cannot be re-derived
    #[error("identity {identity} is incomplete: {missing} is missing next to an existing private key")]
    IncompleteIdentity {
        /// Identity name
        identity: String,
        /// Missing part (file name)
        missing: String,
    },

    /// Identity data needed for a document was not available
    #[error("cannot render {document}: {reason}")]
    Render {
        /// Document being rendered
        document: String,
        /// What was missing
        reason: String,
    },
}

impl ProvisionError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}
