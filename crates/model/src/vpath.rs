//! Virtual-path codec.
//!
//! Every path a client sends looks like `/<project-slug>/<in-project path>`.
//! The root `/` is the synthetic project listing. Decoding is centralised
//! here so the SFTP and SCP handlers cannot drift apart on edge cases.

/// Canonicalise a virtual path: collapse duplicate separators, resolve
/// `.` and `..` segments, and force a leading `/`. `..` at the root is
/// dropped, as with an absolute filesystem path.
pub fn canonicalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }

    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// Split a virtual path into `(project-slug, in-project path)`.
///
/// The in-project path always carries a leading `/`; it is `/` when the
/// path names the project itself. The root `/` yields an empty slug,
/// which is the signal for the synthetic root.
pub fn split(path: &str) -> (String, String) {
    let canonical = canonicalize(path);
    if canonical == "/" {
        return (String::new(), "/".to_string());
    }

    // canonical is "/<slug>" or "/<slug>/<rest>"
    let without_leading = &canonical[1..];
    match without_leading.find('/') {
        Some(idx) => (
            without_leading[..idx].to_string(),
            without_leading[idx..].to_string(),
        ),
        None => (without_leading.to_string(), "/".to_string()),
    }
}

/// Remove the `/<slug>` prefix from a virtual path, yielding the
/// in-project path. If the canonicalised path does not start with that
/// prefix it is returned unchanged; call-sites sometimes hand us paths
/// that were already stripped.
pub fn strip(path: &str, slug: &str) -> String {
    let canonical = canonicalize(path);
    let prefix = format!("/{slug}");

    if canonical == prefix {
        return "/".to_string();
    }

    match canonical.strip_prefix(&format!("{prefix}/")) {
        Some(rest) => format!("/{rest}"),
        None => canonical,
    }
}

/// Parent of an in-project path; `/` is its own parent.
pub fn dir_name(path: &str) -> String {
    let canonical = canonicalize(path);
    match canonical.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => canonical[..idx].to_string(),
    }
}

/// Final segment of an in-project path; empty for `/`.
pub fn base_name(path: &str) -> String {
    let canonical = canonicalize(path);
    if canonical == "/" {
        return String::new();
    }
    match canonical.rfind('/') {
        Some(idx) => canonical[idx + 1..].to_string(),
        None => canonical,
    }
}

/// Join a child name onto an in-project path.
pub fn join(path: &str, name: &str) -> String {
    let canonical = canonicalize(path);
    if canonical == "/" {
        format!("/{name}")
    } else {
        format!("{canonical}/{name}")
    }
}
