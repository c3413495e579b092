use std::io;
use std::path::PathBuf;

use crate::dump::DumpFormat;

/// Errors returned by the public profiler API.
#[derive(Debug, thiserror::Error)]
pub enum MemprofError {
    #[error("memprof is already enabled")]
    AlreadyEnabled,

    #[error("memprof is not enabled")]
    NotEnabled,

    #[error("failed dumping {format} profile, please check file permissions or disk capacity")]
    Dump {
        format: DumpFormat,
        #[source]
        source: io::Error,
    },

    #[error("failed to open {} for writing", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MemprofError {
    pub(crate) fn dump(format: DumpFormat) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Dump { format, source }
    }
}
