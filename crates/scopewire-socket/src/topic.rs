/// Dotted-prefix match: `prefix` selects `name` when it equals it or is a
/// leading run of whole dot-separated segments of it.
///
/// `"scope.stage"` matches `"scope.stage"` and `"scope.stage.x"`, but not
/// `"scope.stagecoach"`. The empty prefix matches everything.
pub fn matches_prefix(prefix: &str, name: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let prefix = prefix.strip_suffix('.').unwrap_or(prefix);
    match name.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}
