use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

/// The different kinds of errors the library can return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
  /// `BadArg` errors indicate an invalid argument, e.g. a timestamp
  /// regression on append or a malformed query range.
  BadArg,
  /// `BadData` errors occur during decode or canonicalization, indicating
  /// the provided bytes are malformed or corrupted. A CRC mismatch is fatal
  /// to the current read.
  BadData,
  /// `Overflow` errors indicate a page or chunk buffer lacks room; the
  /// caller is expected to rotate the page or flush the chunk.
  Overflow,
  /// `NotFound` errors indicate a search failed to locate its key.
  NotFound,
  /// `Inconsistent` errors indicate a broken internal invariant.
  Inconsistent,
}

/// The error type used in results for all `seriesdb` functionality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdbError {
  pub kind: ErrorKind,
  pub message: String,
}

impl SdbError {
  pub(crate) fn new<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
    SdbError {
      kind,
      message: message.as_ref().to_string(),
    }
  }

  pub(crate) fn bad_arg<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::BadArg, message)
  }

  pub(crate) fn bad_data<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::BadData, message)
  }

  pub(crate) fn overflow<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::Overflow, message)
  }

  pub(crate) fn not_found<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::NotFound, message)
  }

  pub(crate) fn inconsistent<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::Inconsistent, message)
  }
}

impl Display for SdbError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "seriesdb {:?} error: {}",
      self.kind, &self.message
    )
  }
}

impl Error for SdbError {}

pub type SdbResult<T> = Result<T, SdbError>;
