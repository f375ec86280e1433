//! Branch name derivation.

/// Labels that mark work as a feature rather than a fix.
const FEATURE_LABELS: [&str; 3] = ["feature", "enhancement", "feat"];

/// Lowercase, collapse every run of characters outside `[a-z0-9]` into one `-`,
/// and trim leading/trailing `-`.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// `fix/` by default, `feat/` for feature-labelled work, unless a prefix is configured.
pub fn default_prefix(configured: Option<&str>, labels: &[String]) -> String {
    if let Some(prefix) = configured {
        return prefix.to_string();
    }
    let is_feature = labels
        .iter()
        .any(|l| FEATURE_LABELS.contains(&l.to_lowercase().as_str()));
    if is_feature { "feat/" } else { "fix/" }.to_string()
}

/// Branch for a goal. An empty slug falls back to `fallback` (e.g. the job id).
pub fn branch_name(prefix: &str, goal: &str, fallback: &str) -> String {
    let slug = sanitize(goal);
    let slug = if slug.is_empty() { sanitize(fallback) } else { slug };
    format!("{}{}", prefix, slug)
}
