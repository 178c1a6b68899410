use std::{fs::File, io::Read, path::Path};

/// CRC32 of an in-memory buffer, used for change detection only
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// CRC32 of a file on disk, read in chunks
pub fn checksum_file(path: &Path) -> std::io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

/// Dump a page we could not make sense of so the markup can be inspected later
pub async fn dump_html_for_debug(debug_dir: &Path, name: &str, html: &str) {
    if let Err(e) = tokio::fs::create_dir_all(debug_dir).await {
        tracing::error!(error = %e, dir = ?debug_dir, "Failed to create debug output directory");
        return;
    }
    let path = debug_dir.join(format!("DEBUG_{}.html", crate::sanitize::sanitize_filename(name)));
    match tokio::fs::write(&path, html).await {
        Ok(()) => tracing::warn!(path = ?path, "Page layout not recognised, raw HTML saved"),
        Err(e) => tracing::error!(error = %e, path = ?path, "Failed to save debug HTML"),
    }
}
