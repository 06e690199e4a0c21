//! Named validation stages for downloaded dataset payloads.
//!
//! Each check is a standalone function so its pass/fail criteria can be
//! tested independently of the pipeline driving it.

use crate::error::{Error, Result};

/// How many leading bytes are sniffed for markup signatures.
const SNIFF_WINDOW: usize = 512;

/// Reject bodies smaller than `min` bytes. Real datasets are tens of
/// megabytes; a tiny body is almost certainly an error page served with a
/// 200 status.
pub fn check_min_size(body: &[u8], min: usize) -> Result<()> {
    if body.len() < min {
        return Err(Error::SuspiciouslySmall {
            len: body.len(),
            min,
        });
    }
    Ok(())
}

/// Reject bodies that look like HTML, which no dataset or archive ever is.
pub fn check_not_markup(body: &[u8]) -> Result<()> {
    let window = &body[..body.len().min(SNIFF_WINDOW)];
    let head = String::from_utf8_lossy(window).to_lowercase();
    if head.contains("<html") || head.contains("<!doctype") {
        return Err(Error::FormatInvalid {
            reason: "body looks like an HTML error page".to_string(),
        });
    }
    Ok(())
}

/// Verify the gzip magic bytes on bodies expected to be archives.
pub fn check_gzip_magic(body: &[u8]) -> Result<()> {
    if body.len() < 2 || body[0] != 0x1f || body[1] != 0x8b {
        return Err(Error::FormatInvalid {
            reason: "missing gzip magic bytes".to_string(),
        });
    }
    Ok(())
}

/// Best-effort smoke test for a raw MMDB body: the header region of real
/// files contains zero-byte runs within the first few dozen bytes.
///
/// This accepts many byte patterns and is deliberately only advisory; the
/// authoritative check is opening the file as a dataset. Callers log an
/// inconclusive result instead of failing on it.
pub fn mmdb_header_plausible(body: &[u8]) -> bool {
    let window = &body[..body.len().min(64)];
    window.windows(3).any(|w| w == [0x00, 0x00, 0x00])
}
