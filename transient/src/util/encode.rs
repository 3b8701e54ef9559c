//! Filesystem-safe name encoding, absolute-path joining, and human byte sizes.

use std::path::{Path, PathBuf};

/// Encode a logical image/VM name into a filesystem-safe string.
///
/// URL-quotes the name, then additionally escapes `-` as `%2D` so that `-`
/// is free to use as the disk-index separator in overlay file names
/// (`<vm>-<index>-<backend>`).
pub fn storage_safe_encode(name: &str) -> String {
    urlencoding::encode(name).replace('-', "%2D")
}

/// Inverse of [`storage_safe_encode`].
pub fn storage_safe_decode(encoded: &str) -> String {
    urlencoding::decode(encoded)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| encoded.to_string())
}

/// Join an absolute base with one or more absolute path fragments, treating
/// each fragment as relative to the accumulated result (stripping its
/// leading `/`).
///
/// `join_abs("/mnt", "/root") == "/mnt/root"`;
/// `join_abs("/mnt", "/root", "/other") == "/mnt/root/other"`;
/// `join_abs("/mnt") == "/mnt"`.
pub fn join_abs<P: AsRef<Path>>(base: P, parts: &[P]) -> PathBuf {
    let mut out = base.as_ref().to_path_buf();
    for part in parts {
        let part = part.as_ref();
        let stripped = part.strip_prefix("/").unwrap_or(part);
        out.push(stripped);
    }
    out
}

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Render a byte count as a human-readable size with the binary (1024)
/// prefix table, two decimal places.
pub fn format_bytes(size: u64) -> String {
    if size == 0 {
        return "0.00 B".to_string();
    }
    let mut value = size as f64;
    let mut unit_index = 0;
    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }
    format!("{:.2} {}", value, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        for s in ["simple", "with space", "with-dash", "with/slash"] {
            assert_eq!(storage_safe_decode(&storage_safe_encode(s)), s);
        }
    }

    #[test]
    fn known_encodings() {
        assert_eq!(storage_safe_encode("simple"), "simple");
        assert_eq!(storage_safe_encode("with space"), "with%20space");
        assert_eq!(storage_safe_encode("with-dash"), "with%2Ddash");
        assert_eq!(storage_safe_encode("with/slash"), "with%2Fslash");
    }

    #[test]
    fn join_abs_cases() {
        assert_eq!(
            join_abs(Path::new("/mnt"), &[Path::new("/root")]),
            PathBuf::from("/mnt/root")
        );
        assert_eq!(
            join_abs(Path::new("/mnt"), &[Path::new("/root"), Path::new("/other")]),
            PathBuf::from("/mnt/root/other")
        );
        assert_eq!(
            join_abs::<&Path>(Path::new("/mnt"), &[]),
            PathBuf::from("/mnt")
        );
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes((1.5 * (1u64 << 20) as f64) as u64), "1.50 MiB");
        assert_eq!(format_bytes(1 << 30), "1.00 GiB");
        assert_eq!(format_bytes(1u64 << 40), "1.00 TiB");
        assert_eq!(format_bytes(10000), "9.77 KiB");
    }
}
