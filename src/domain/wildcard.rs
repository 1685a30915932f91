//! Certificate domain matching.

/// Returns `true` if `server_name` is covered by the certificate domain
/// `pattern`.
///
/// A pattern matches its exact name, and a pattern whose first label is `*`
/// matches names with exactly one additional, non-empty label in that
/// position: `*.example.ts.net` covers `foo.example.ts.net` but neither
/// `foo.bar.example.ts.net` nor `example.ts.net`. Wildcards anywhere else
/// are not honored. Comparison is ASCII case-insensitive.
#[must_use]
pub fn match_wildcard(server_name: &str, pattern: &str) -> bool {
    if server_name.is_empty() || pattern.is_empty() {
        return false;
    }
    if server_name.eq_ignore_ascii_case(pattern) {
        return true;
    }

    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    if suffix.is_empty() || suffix.contains('*') {
        return false;
    }

    match server_name.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
        None => false,
    }
}
