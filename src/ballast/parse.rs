//! Parsers for the disk-usage and file-size output read back from containers.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::errors::{CbhError, Result};

static NON_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^0-9]").expect("static regex compiles"));

/// Used space in whole gigabytes from `df --block-size=1G /` output.
///
/// Expects a header line and one data row; the third field of the data row
/// is the used figure.
pub fn parse_used_space(output: &str) -> Result<i64> {
    let lines: Vec<&str> = output.trim().lines().collect();
    if lines.len() < 2 {
        return Err(CbhError::format(
            "df output",
            format!("expected header and data row, got {} line(s)", lines.len()),
        ));
    }

    let fields: Vec<&str> = lines[1].split_whitespace().collect();
    let Some(used) = fields.get(2) else {
        return Err(CbhError::format(
            "df output",
            format!("data row has {} field(s), need at least 3", fields.len()),
        ));
    };

    used.parse::<i64>().map_err(|error| {
        CbhError::format("df output", format!("used field {used:?}: {error}"))
    })
}

/// File size in bytes from `stat -c %s` output.
///
/// Everything that is not an ASCII digit is dropped before parsing, so
/// trailing newlines or surrounding words are tolerated.
pub fn parse_file_size(output: &str) -> Result<u64> {
    let digits = NON_DIGITS.replace_all(output, "");
    if digits.is_empty() {
        return Err(CbhError::format(
            "stat output",
            format!("no digits in {:?}", output.trim()),
        ));
    }
    digits.parse::<u64>().map_err(|error| {
        CbhError::format("stat output", format!("{digits:?}: {error}"))
    })
}
