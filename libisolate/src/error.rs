use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("namespace isolation failed during {op}: {source}")]
    NamespaceIsolationFailed {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("failed to install hook script {}: {source}", path.display())]
    Hook {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IsolateError {
    pub(crate) fn namespace(op: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| IsolateError::NamespaceIsolationFailed { op, source }
    }
}
