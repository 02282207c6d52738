use crc32fast::Hasher;

/// Collapse every run of whitespace into a single space and trim both ends.
///
/// Used for hashing and for comparing rollback scripts, so that reformatting
/// a file does not register as a content change.
pub fn normalize_whitespace(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// CRC32 of the content fed line by line, each line terminated by `\n`.
///
/// `\r\n` and `\n` therefore produce the same value, while moving a line
/// break does not.
pub fn line_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    for line in content.lines() {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:08x}", hasher.finalize())
}

/// The primary content hash: CRC32 of the whitespace-normalized content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(normalize_whitespace(content).as_bytes());
    format!("{:08x}", hasher.finalize())
}
