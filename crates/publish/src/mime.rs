/// Infers the MIME type of an artifact from its extension.
///
/// Accepts the extension with or without the leading dot; unknown types
/// fall back to `application/octet-stream`.
pub fn detect_mime_type(extension: &str) -> &'static str {
    let ext = extension.trim_start_matches('.').to_lowercase();

    match ext.as_str() {
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "json" => "application/json",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "apk" => "application/vnd.android.package-archive",
        _ => "application/octet-stream",
    }
}
