use crate::RepoFormat;
use std::sync::Arc;

/// One configured repository: a request path prefix, the format serving
/// it, and the ordered list of mirror templates to fill misses from.
#[derive(Clone)]
pub struct RepoEntry {
    pub prefix: String,
    pub format: Arc<dyn RepoFormat>,
    pub mirrors: Vec<String>,
}

/// Result of routing a request path.
pub struct RouteMatch {
    /// Format of the matched repository.
    pub format: Arc<dyn RepoFormat>,
    /// The configured prefix that matched.
    pub prefix: String,
    /// The repo-relative rest of the path (empty when the path names the
    /// repository itself).
    pub remainder: String,
    /// Concrete upstream URLs, one per configured mirror, in order.
    pub upstream_urls: Vec<String>,
}

/// Maps request paths onto configured repositories.
pub struct RepoRouter {
    entries: Vec<RepoEntry>,
}

impl RepoRouter {
    pub fn new(entries: Vec<RepoEntry>) -> Self {
        RepoRouter { entries }
    }

    pub fn entries(&self) -> &[RepoEntry] {
        &self.entries
    }

    /// Match a request path against the configured prefixes, first entry
    /// wins. Returns `None` when no repository serves the path.
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        let path = path.trim_start_matches('/');
        self.entries.iter().find_map(|entry| {
            let rest = path.strip_prefix(&entry.prefix)?;
            let remainder = if rest.is_empty() { "" } else { rest.strip_prefix('/')? };
            Some(RouteMatch {
                format: Arc::clone(&entry.format),
                prefix: entry.prefix.clone(),
                remainder: remainder.to_string(),
                upstream_urls: entry
                    .mirrors
                    .iter()
                    .map(|mirror| substitute(mirror, remainder))
                    .collect(),
            })
        })
    }
}

/// Fill a mirror template with a repo-relative path. A template either
/// carries an explicit `{path}` placeholder or the path is appended.
fn substitute(template: &str, remainder: &str) -> String {
    if template.contains("{path}") {
        template.replace("{path}", remainder)
    } else if remainder.is_empty() {
        template.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", template.trim_end_matches('/'), remainder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PacmanFormat;
    use pretty_assertions::assert_eq;

    fn router() -> RepoRouter {
        RepoRouter::new(vec![
            RepoEntry {
                prefix: "core/os/x86_64".to_string(),
                format: Arc::new(PacmanFormat),
                mirrors: vec![
                    "https://mirror-a.example/core/os/x86_64".to_string(),
                    "https://mirror-b.example/archlinux/core/os/x86_64/{path}".to_string(),
                ],
            },
            RepoEntry {
                prefix: "extra/os/x86_64".to_string(),
                format: Arc::new(PacmanFormat),
                mirrors: vec!["https://mirror-a.example/extra/os/x86_64".to_string()],
            },
        ])
    }

    #[test]
    fn matches_the_configured_prefix() {
        let matched = router().match_path("/core/os/x86_64/linux-6.1.1-1-x86_64.pkg.tar.zst");
        let matched = matched.expect("path should route");
        assert_eq!(matched.prefix, "core/os/x86_64");
        assert_eq!(matched.remainder, "linux-6.1.1-1-x86_64.pkg.tar.zst");
        assert_eq!(
            matched.upstream_urls,
            [
                "https://mirror-a.example/core/os/x86_64/linux-6.1.1-1-x86_64.pkg.tar.zst",
                "https://mirror-b.example/archlinux/core/os/x86_64/linux-6.1.1-1-x86_64.pkg.tar.zst",
            ]
        );
    }

    #[test]
    fn matches_the_prefix_itself_with_an_empty_remainder() {
        let matched = router().match_path("core/os/x86_64").expect("prefix should route");
        assert_eq!(matched.remainder, "");
        assert_eq!(matched.upstream_urls[0], "https://mirror-a.example/core/os/x86_64");
    }

    #[test]
    fn rejects_unknown_and_partial_prefixes() {
        assert!(router().match_path("community/os/x86_64/foo.pkg.tar.zst").is_none());
        assert!(router().match_path("core/os/x86_64extra/foo.pkg.tar.zst").is_none());
    }

    #[test]
    fn later_entries_match_after_earlier_ones() {
        let matched = router().match_path("extra/os/x86_64/extra.db").expect("should route");
        assert_eq!(matched.prefix, "extra/os/x86_64");
        assert_eq!(matched.remainder, "extra.db");
    }
}
