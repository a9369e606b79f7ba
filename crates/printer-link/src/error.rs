use std::{io, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The channel failed while writing or reading; the link has been marked
    /// for reconnection and the command was abandoned.
    #[error("transport fault while sending {command:?}: {source}")]
    Transport {
        command: String,
        #[source]
        source: io::Error,
    },
    /// The firmware answered with an error marker.
    #[error("printer rejected {command:?}: {response}")]
    Rejected { command: String, response: String },
    #[error("no terminal response to {command:?} within {waited:?}")]
    Timeout { command: String, waited: Duration },
    #[error("connection attempt cancelled by shutdown")]
    Cancelled,
    #[error("failed to open printer channel {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: io::Error,
    },
}

impl LinkError {
    /// True when the failure forced the link back into `Connecting`.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, LinkError::Transport { .. } | LinkError::Timeout { .. })
    }
}
