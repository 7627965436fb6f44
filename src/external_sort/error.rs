use std::io;
use thiserror::Error;

/// Terminal outcome of a failed sort. A sink asking to stop is not an error.
#[derive(Debug, Error)]
pub enum SortError {
    #[error("out of memory allocating {bytes} bytes of sort buffer")]
    OutOfMemory { bytes: usize },

    #[error("temp file {context}: {source}")]
    TempFile {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("corrupted run page {page} in temp file {file}: {reason}")]
    CorruptedPage {
        file: usize,
        page: usize,
        reason: &'static str,
    },

    #[error("corrupted run ledger for temp file {file}: {reason}")]
    CorruptedLedger { file: usize, reason: &'static str },

    #[error("input source returned a {len} byte record for a {area} byte area")]
    InvalidRecord { len: usize, area: usize },

    #[error("internal sort error: {0}")]
    Internal(&'static str),

    #[error("input source failed: {0}")]
    Input(#[source] anyhow::Error),

    #[error("output sink failed: {0}")]
    Output(#[source] anyhow::Error),

    #[error("invalid sort configuration: {0}")]
    Config(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SortError>;

impl SortError {
    pub(crate) fn temp_file(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| SortError::TempFile { context, source }
    }

    /// Resource exhaustion: memory or temp space.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, SortError::OutOfMemory { .. } | SortError::TempFile { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SortError::CorruptedPage { .. } | SortError::CorruptedLedger { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let exhausted = SortError::OutOfMemory { bytes: 4096 };
        assert!(exhausted.is_resource_exhaustion());
        assert!(!exhausted.is_corruption());

        let disk = SortError::temp_file("write")(io::Error::new(io::ErrorKind::Other, "no space"));
        assert!(disk.is_resource_exhaustion());
        assert_eq!(disk.to_string(), "temp file write: no space");

        let page = SortError::CorruptedPage {
            file: 2,
            page: 7,
            reason: "slot past page end",
        };
        assert!(page.is_corruption());
        assert!(!page.is_resource_exhaustion());
        assert!(SortError::CorruptedLedger { file: 0, reason: "bad run" }.is_corruption());
        assert!(!SortError::Internal("unreachable state").is_corruption());
    }
}
