//! Disk-image tooling: a thin wrapper around `qemu-img`, plus the size-unit
//! parsing the Imagefile `DISK`/`PARTITION` grammar needs.

pub mod qemu_img;

use crate::error::{TransientError, TransientResult};

/// Parse a `DISK_SIZE DISK_UNITS` token such as `"2GB"` or `"300Mb"` into a
/// byte count. Units are binary (1024-based), matching `qemu-img`'s own
/// interpretation of bare `M`/`G` suffixes.
pub fn parse_size_with_unit(token: &str) -> TransientResult<u64> {
    let token = token.trim();
    let digits_end = token
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| TransientError::validation(format!("invalid disk size '{token}'")))?;
    let (digits, unit) = token.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .map_err(|_| TransientError::validation(format!("invalid disk size '{token}'")))?;
    let multiplier = match unit.to_ascii_uppercase().trim_end_matches('B') {
        "M" => 1024u64 * 1024,
        "G" => 1024u64 * 1024 * 1024,
        other => {
            return Err(TransientError::validation(format!(
                "unknown disk size unit '{other}' in '{token}'"
            )));
        }
    };
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_units() {
        assert_eq!(parse_size_with_unit("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_with_unit("300MB").unwrap(), 300 * 1024 * 1024);
        assert_eq!(parse_size_with_unit("1Gb").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_size_with_unit("5TB").is_err());
    }
}
