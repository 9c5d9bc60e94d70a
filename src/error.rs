use thiserror::Error;

/// The four checker-visible error kinds from the specification. Every
/// fallible routine in the object/checkpoint/btree/space/catalog layers
/// returns `Result<T, CheckError>`; the CLI driver is the only place that
/// prints and converts to an exit code.
#[derive(Debug, Error)]
pub enum CheckError {
    /// A hard on-disk invariant was violated. Always fatal.
    #[error("{context}: {message}")]
    Corruption { context: String, message: String },

    /// A recognised but unimplemented/unsupported on-disk feature.
    /// Silent unless `report_unknown` is set.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A pattern consistent with an interrupted write, not corruption.
    /// Silent unless `report_crash` is set.
    #[error("crash sign: {0}")]
    CrashSign(String),

    /// Unusual but not necessarily wrong. Silent unless `report_weird` is
    /// set.
    #[error("weird: {0}")]
    Weird(String),

    /// Propagated I/O failure from the block device.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type CheckResult<T> = Result<T, CheckError>;

impl CheckError {
    pub fn corruption(context: impl Into<String>, message: impl Into<String>) -> Self {
        CheckError::Corruption { context: context.into(), message: message.into() }
    }

    /// Whether the checker must print and abort for this error, given the
    /// reporting options currently in effect.
    pub fn is_reportable(&self, report_crash: bool, report_unknown: bool, report_weird: bool) -> bool {
        match self {
            CheckError::Corruption { .. } => true,
            CheckError::Io(_) => true,
            CheckError::UnsupportedFeature(_) => report_unknown,
            CheckError::CrashSign(_) => report_crash,
            CheckError::Weird(_) => report_weird,
        }
    }
}
