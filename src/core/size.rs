//! Byte quantities with compact SI rendering (`25GB`, `5.0GB`).
//!
//! Rendered sizes are what the threshold label stores, so `FromStr` accepts
//! everything `Display` produces and rejects anything it cannot account for.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CbhError, Result};

const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

/// One SI gigabyte.
pub const GB: u64 = 1_000_000_000;

/// A count of bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageSize(u64);

impl StorageSize {
    /// Zero bytes.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw byte count.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Fractional SI gigabytes, rounded to the nearest byte; negatives clamp to zero.
    #[must_use]
    pub fn from_gigabytes(gigabytes: f64) -> Self {
        if gigabytes.is_nan() || gigabytes <= 0.0 {
            return Self::ZERO;
        }
        Self((gigabytes * GB as f64).round() as u64)
    }

    /// Raw byte count.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Whole SI gigabytes, rounded down.
    #[must_use]
    pub const fn whole_gigabytes(self) -> u64 {
        self.0 / GB
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self - other`, clamped at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }
}

impl Add for StorageSize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for StorageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes < 10 {
            return write!(f, "{bytes}B");
        }

        let mut exp = 0;
        let mut scale: u64 = 1;
        while exp + 1 < UNITS.len() && bytes / scale >= 1000 {
            scale *= 1000;
            exp += 1;
        }

        let value = ((bytes as f64 / scale as f64) * 10.0 + 0.5).floor() / 10.0;
        if value < 10.0 {
            write!(f, "{value:.1}{}", UNITS[exp])
        } else {
            write!(f, "{value:.0}{}", UNITS[exp])
        }
    }
}

impl FromStr for StorageSize {
    type Err = CbhError;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        if number.is_empty() {
            return Err(CbhError::format(
                "storage size",
                format!("{raw:?} has no leading number"),
            ));
        }
        let value: f64 = number.parse().map_err(|error| {
            CbhError::format("storage size", format!("{raw:?}: {error}"))
        })?;

        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" => 1_000,
            "m" | "mb" => 1_000_000,
            "g" | "gb" => GB,
            "t" | "tb" => 1_000 * GB,
            "p" | "pb" => 1_000_000 * GB,
            "e" | "eb" => 1_000_000_000 * GB,
            other => {
                return Err(CbhError::format(
                    "storage size",
                    format!("{raw:?} has unknown unit {other:?}"),
                ));
            }
        };

        let bytes = (value * multiplier as f64).round();
        if !bytes.is_finite() || bytes >= u64::MAX as f64 {
            return Err(CbhError::format(
                "storage size",
                format!("{raw:?} is out of range"),
            ));
        }
        Ok(Self(bytes as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn renders_whole_units_above_ten() {
        assert_eq!(StorageSize::from_bytes(25 * GB).to_string(), "25GB");
        assert_eq!(StorageSize::from_bytes(20 * GB).to_string(), "20GB");
        assert_eq!(StorageSize::from_bytes(512_000_000).to_string(), "512MB");
    }

    #[test]
    fn renders_one_decimal_below_ten() {
        assert_eq!(StorageSize::from_bytes(5 * GB).to_string(), "5.0GB");
        assert_eq!(StorageSize::from_bytes(4_500_000_000).to_string(), "4.5GB");
        assert_eq!(StorageSize::from_bytes(1_500).to_string(), "1.5kB");
    }

    #[test]
    fn renders_tiny_counts_as_bytes() {
        assert_eq!(StorageSize::ZERO.to_string(), "0B");
        assert_eq!(StorageSize::from_bytes(9).to_string(), "9B");
        assert_eq!(StorageSize::from_bytes(999).to_string(), "999B");
    }

    #[test]
    fn addition_composes_base_and_margin() {
        let combined = StorageSize::from_bytes(20 * GB) + StorageSize::from_bytes(5 * GB);
        assert_eq!(combined.bytes(), 25 * GB);
        assert_eq!(combined.to_string(), "25GB");
    }

    #[test]
    fn addition_saturates() {
        let max = StorageSize::from_bytes(u64::MAX);
        assert_eq!((max + StorageSize::from_bytes(1)).bytes(), u64::MAX);
        assert!(max.checked_add(StorageSize::from_bytes(1)).is_none());
    }

    #[test]
    fn saturating_sub_clamps_to_zero() {
        let small = StorageSize::from_bytes(300_000_000);
        let step = StorageSize::from_bytes(500_000_000);
        assert!(small.saturating_sub(step).is_zero());
    }

    #[test]
    fn parses_rendered_forms() {
        assert_eq!("25GB".parse::<StorageSize>().unwrap().bytes(), 25 * GB);
        assert_eq!("5.0GB".parse::<StorageSize>().unwrap().bytes(), 5 * GB);
        assert_eq!("512MB".parse::<StorageSize>().unwrap().bytes(), 512_000_000);
        assert_eq!("100B".parse::<StorageSize>().unwrap().bytes(), 100);
        assert_eq!("3G".parse::<StorageSize>().unwrap().bytes(), 3 * GB);
        assert_eq!(" 25 gb ".parse::<StorageSize>().unwrap().bytes(), 25 * GB);
    }

    #[test]
    fn rejects_malformed_labels() {
        for raw in ["", "GB", "twenty", "25XB", "1.2.3GB", "-5GB"] {
            let err = raw.parse::<StorageSize>().unwrap_err();
            assert_eq!(err.code(), "CBH-2301", "{raw:?} should be a format error");
        }
    }

    #[test]
    fn from_gigabytes_handles_fractions() {
        assert_eq!(StorageSize::from_gigabytes(0.5).bytes(), 500_000_000);
        assert_eq!(StorageSize::from_gigabytes(-1.0), StorageSize::ZERO);
        assert_eq!(StorageSize::from_gigabytes(f64::NAN), StorageSize::ZERO);
    }

    #[test]
    fn whole_gigabytes_rounds_down() {
        assert_eq!(StorageSize::from_bytes(25 * GB).whole_gigabytes(), 25);
        assert_eq!(StorageSize::from_bytes(25 * GB - 1).whole_gigabytes(), 24);
    }

    proptest! {
        #[test]
        fn rendering_is_compact_and_stable(bytes in any::<u64>()) {
            let size = StorageSize::from_bytes(bytes);
            let first = size.to_string();
            prop_assert!(!first.chars().any(char::is_whitespace));
            prop_assert_eq!(&first, &size.to_string());
        }

        #[test]
        fn rendering_parses_back_within_rounding(bytes in 0u64..u64::MAX / 2) {
            let parsed: StorageSize = StorageSize::from_bytes(bytes).to_string().parse().unwrap();
            let diff = parsed.bytes().abs_diff(bytes);
            prop_assert!(diff <= bytes / 10 + 1, "{} -> {}", bytes, parsed.bytes());
        }
    }
}
