use std::str::FromStr;

use thiserror::Error;

/// Memory size representation supporting common units.
///
/// All units use binary (base-2) multipliers (1 KB = 1024 bytes).
///
/// # Examples
///
/// ```
/// use anvil_core::util::Size;
///
/// let size = Size::MB(64);
/// assert_eq!(size.bytes(), 64 * 1024 * 1024);
///
/// let parsed: Size = "4K".parse().unwrap();
/// assert_eq!(parsed.bytes(), 4096);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
    /// Size in gigabytes (1 GB = 1024 MB)
    GB(usize),
}

impl Size {
    /// Converts this size to bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(bytes) => *bytes,
            Size::KB(kb) => *kb * (1 << 10),
            Size::MB(mb) => *mb * (1 << 20),
            Size::GB(gb) => *gb * (1 << 30),
        }
    }
}

/// Error returned when a size string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid size '{0}', expected e.g. 4096, 64K, 64M or 1G")]
pub struct ParseSizeError(String);

impl FromStr for Size {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.trim_end_matches(|c: char| c.is_ascii_alphabetic());
        let unit = &s[digits.len()..];
        let value = digits
            .parse::<usize>()
            .map_err(|_| ParseSizeError(s.to_string()))?;
        match unit.to_ascii_uppercase().as_str() {
            "" | "B" => Ok(Size::B(value)),
            "K" | "KB" | "KIB" => Ok(Size::KB(value)),
            "M" | "MB" | "MIB" => Ok(Size::MB(value)),
            "G" | "GB" | "GIB" => Ok(Size::GB(value)),
            _ => Err(ParseSizeError(s.to_string())),
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Size::B(bytes) => write!(f, "{} B", bytes),
            Size::KB(kb) => write!(f, "{} KB", kb),
            Size::MB(mb) => write!(f, "{} MB", mb),
            Size::GB(gb) => write!(f, "{} GB", gb),
        }
    }
}
