//! Note id helpers. Ids are slash-delimited paths; the first segment is the
//! notebook ("root id").

/// First path segment of `id`.
pub fn root_id(id: &str) -> &str {
    id.split('/').next().unwrap_or_default()
}

/// Key prefix shared by every strict descendant of `id`.
///
/// `None` when `id` cannot have descendants: empty, or with a leading or
/// trailing slash.
pub fn descendant_prefix(id: &str) -> Option<String> {
    if id.is_empty() || id.starts_with('/') || id.ends_with('/') {
        return None;
    }
    Some(format!("{id}/"))
}

/// True if `candidate` is `id` itself or lies under it.
pub fn is_within(candidate: &str, id: &str) -> bool {
    candidate == id
        || candidate
            .strip_prefix(id)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Rewrite `id` from under `from` to under `to`.
///
/// `id` must satisfy [`is_within`]`(id, from)`.
pub fn rebase(id: &str, from: &str, to: &str) -> String {
    match id.strip_prefix(from) {
        Some(rest) => format!("{to}{rest}"),
        None => id.to_string(),
    }
}
