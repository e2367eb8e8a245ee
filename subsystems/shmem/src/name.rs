//! # Segment Names
//!
//! Segment names have the form `"<provider>/<subname>"`. The first `/` is the
//! separator; both halves must be non-empty.

use crate::{ShmError, ShmResult, SHM_NAME_MAX};
use heapless::String;

/// Split a full name into provider and subname
pub fn split_name(name: &str) -> ShmResult<(&str, &str)> {
    match name.split_once('/') {
        Some((provider, sub)) if !provider.is_empty() && !sub.is_empty() => Ok((provider, sub)),
        _ => Err(ShmError::InvalidArgument),
    }
}

/// Provider part of a full name
pub fn provider_name(name: &str) -> ShmResult<&str> {
    split_name(name).map(|(provider, _)| provider)
}

/// Subname part of a full name
pub fn subname(name: &str) -> ShmResult<&str> {
    split_name(name).map(|(_, sub)| sub)
}

/// Copy `name` into fixed storage, cutting at a char boundary if too long
pub(crate) fn truncate(name: &str) -> String<SHM_NAME_MAX> {
    let mut end = name.len().min(SHM_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::new();
    // Fits by construction.
    out.push_str(&name[..end]).ok();
    out
}
