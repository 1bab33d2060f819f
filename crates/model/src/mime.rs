//! Extension-to-MIME lookup with a stable fallback.

use std::path::Path;

/// Fallback returned when the extension maps to nothing.
pub const UNKNOWN_MIME: &str = "unknown";

/// Determine the MIME type of a file from its extension. Parameter
/// suffixes (everything from the first `;`) are stripped so the stored
/// type is just the bare `type/subtype`. Returns [`UNKNOWN_MIME`] when
/// the extension has no mapping.
pub fn mime_type(name: &str) -> String {
    let ext = match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return UNKNOWN_MIME.to_string(),
    };

    match mime_guess::from_ext(&ext).first_raw() {
        Some(mime) => {
            let bare = match mime.find(';') {
                Some(idx) => &mime[..idx],
                None => mime,
            };
            bare.trim().to_string()
        }
        None => UNKNOWN_MIME.to_string(),
    }
}
