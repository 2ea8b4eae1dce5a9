//! Failure taxonomy for `ampm`.
//!
//! Most code in this crate returns `color_eyre::Result` and attaches context
//! as errors bubble up. Failures that callers (and the exit code table) need
//! to tell apart are additionally rooted in a [`Fault`], which the binary
//! recovers from the report chain to pick its exit code.

use derive_more::{Display, Error};

/// A classified failure.
///
/// Everything not covered here is a generic failure and exits with code 1.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
pub enum Fault {
    /// No record matched the identifier or query.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),

    /// More than one record survived matching and selection.
    #[display("ambiguous query: {_0}")]
    AmbiguousQuery(#[error(not(source))] String),

    /// An attribute expression failed to parse.
    #[display("malformed expression: {_0}")]
    MalformedExpression(#[error(not(source))] String),

    /// An attribute value could not be interpreted the way the expression
    /// requires (for example `@semver` against a non-version string).
    #[display("attribute {key:?}: expected {expected} value, got {value:?}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        value: String,
    },

    /// A metadata record could not be parsed.
    #[display("unparseable record: {_0}")]
    FormatError(#[error(not(source))] String),

    /// An I/O operation failed; the string names the offending path.
    #[display("i/o error: {_0}")]
    IoError(#[error(not(source))] String),

    /// Offline mode was requested and the artifact is not in the local cache.
    #[display("not in local cache (offline): {_0}")]
    OfflineMiss(#[error(not(source))] String),

    /// A record's bytes do not hash to the fingerprint in its file name.
    #[display("fingerprint mismatch: expected {expected}, record hashes to {actual}")]
    IntegrityError { expected: String, actual: String },

    /// The operation was interrupted by a signal.
    #[display("interrupted")]
    Interrupted,
}

impl Fault {
    /// The process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Fault::NotFound(_) | Fault::OfflineMiss(_) => 2,
            Fault::AmbiguousQuery(_) => 3,
            Fault::MalformedExpression(_) | Fault::TypeMismatch { .. } | Fault::FormatError(_) => 4,
            Fault::IoError(_) | Fault::IntegrityError { .. } => 5,
            Fault::Interrupted => 1,
        }
    }
}

/// Find the classified fault in an error report chain, if any.
pub fn classify(report: &color_eyre::Report) -> Option<&Fault> {
    report.chain().find_map(|err| err.downcast_ref::<Fault>())
}

/// The exit code for a failed invocation.
///
/// Classified faults map through [`Fault::exit_code`]; bare I/O errors that
/// never got classified still exit 5; everything else is a generic failure.
pub fn exit_code(report: &color_eyre::Report) -> u8 {
    if let Some(fault) = classify(report) {
        fault.exit_code()
    } else if report.chain().any(|err| err.is::<std::io::Error>()) {
        5
    } else {
        1
    }
}
