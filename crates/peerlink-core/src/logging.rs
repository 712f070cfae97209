//! Logging helpers.
//!
//! Wrappers that keep secrets and oversized user content out of log lines.

use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Maximum characters of user content shown by [`Preview`].
pub const PREVIEW_CHARS: usize = 48;

/// Shows at most [`PREVIEW_CHARS`] characters of a string.
pub struct Preview<'a>(pub &'a str);

impl<'a> fmt::Display for Preview<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        match s.char_indices().nth(PREVIEW_CHARS) {
            Some((cut, _)) => write!(f, "{}... ({} bytes)", &s[..cut], s.len()),
            None => f.write_str(s),
        }
    }
}

impl<'a> fmt::Debug for Preview<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string())
    }
}
