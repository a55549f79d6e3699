//! MIME type detection based on file extensions.

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Resolves the `Content-Type` for a file extension (with or without the
/// leading dot). Text types carry the configured charset.
pub fn from_extension(ext: &str, charset: &str) -> String {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();

    let (mime, text) = match ext.as_str() {
        "avi" => ("video/x-msvideo", false),
        "css" => ("text/css", true),
        "csv" => ("text/csv", true),
        "eot" => ("font/eot", false),
        "gif" => ("image/gif", false),
        "htm" | "html" => ("text/html", true),
        "ico" => ("image/x-icon", false),
        "jpeg" | "jpg" => ("image/jpeg", false),
        "js" => ("application/javascript", true),
        "json" => ("application/json", true),
        "mkv" => ("video/x-matroska", false),
        "mov" => ("video/quicktime", false),
        "mp3" => ("audio/mpeg", false),
        "mp4" => ("video/mp4", false),
        "otf" => ("font/otf", false),
        "png" => ("image/png", false),
        "svg" => ("image/svg+xml", true),
        "ttf" => ("font/ttf", false),
        "txt" => ("text/plain", true),
        "wasm" => ("application/wasm", false),
        "wav" => ("audio/wav", false),
        "weba" => ("audio/webm", false),
        "webp" => ("image/webp", false),
        "woff" => ("font/woff", false),
        "woff2" => ("font/woff2", false),
        "xml" => ("application/xml", true),
        _ => (DEFAULT_MIME, false),
    };

    if text {
        format!("{mime}; charset={charset}")
    } else {
        mime.to_string()
    }
}
