//! Checks on the `/`-separated paths that name objects and directories
//! below an endpoint or destination root.

use crate::TransferError;

const SEPARATORS: [char; 2] = ['/', '\\'];

/// Checks that `relative` stays below whatever root it is joined to.
///
/// Segments are split on `/` and backslash. Refused: the empty path, a leading
/// separator, a drive prefix such as `C:`, any `..` segment and NUL bytes.
/// `.` segments and doubled separators are tolerated.
pub fn validate_relative_path(relative: &str) -> Result<(), TransferError> {
    let refuse = |why: &str| -> Result<(), TransferError> {
        Err(TransferError::InvalidPath(format!("{why}: {relative:?}")))
    };

    if relative.is_empty() {
        return refuse("path is empty");
    }
    if relative.starts_with(SEPARATORS) {
        return refuse("path is rooted");
    }
    if relative.contains('\0') {
        return refuse("path contains NUL");
    }

    if relative.split(SEPARATORS).next().is_some_and(is_drive_prefix) {
        return refuse("path carries a drive prefix");
    }
    if relative.split(SEPARATORS).any(|segment| segment == "..") {
        return refuse("path climbs above its root");
    }
    Ok(())
}

/// `C:` style first segment.
fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// A listed name must be one segment that passes [`validate_relative_path`].
pub fn validate_entry_name(name: &str) -> Result<(), TransferError> {
    validate_relative_path(name)?;
    if name.contains(SEPARATORS) || name == "." {
        return Err(TransferError::InvalidPath(format!(
            "listed name is not a single segment: {name}"
        )));
    }
    Ok(())
}

/// Joins two `/`-separated relative paths. An empty side is dropped.
pub fn join_relative(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{name}"),
    }
}
