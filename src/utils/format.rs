const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * 1024.0;

/// Human readable size: `500 B`, `1.5 KB`, `5.25 MB`.
pub fn format_file_size(bytes: u64) -> String {
    let value = bytes as f64;
    if value < KB {
        format!("{} B", bytes)
    } else if value < MB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{:.2} MB", value / MB)
    }
}
