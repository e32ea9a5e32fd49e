//! Canonical names derived from team and repository identity.
//!
//! The normalized team name triples as container name, image repository
//! component, and primary network alias, so every derivation lives here.

use rand::Rng;

/// Lowercase the team name and collapse each whitespace run into a single `-`.
pub fn normalized_team_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_run = false;

    for ch in name.to_lowercase().chars() {
        if ch.is_whitespace() {
            if !in_run {
                normalized.push('-');
            }
            in_run = true;
        } else {
            normalized.push(ch);
            in_run = false;
        }
    }

    normalized
}

/// Canonical image reference for a team's current build.
pub fn image_reference(team_name: &str) -> String {
    format!("{}:latest", normalized_team_name(team_name))
}

/// Network alias of a legacy deploy's sidecar database.
pub fn sidecar_alias(team_name: &str) -> String {
    format!("{}-db", normalized_team_name(team_name))
}

/// Filesystem-safe slug of a repository URL's final path segment.
pub fn repo_slug(url: &str) -> String {
    let name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let name = name.strip_suffix(".git").unwrap_or(name);

    let slug: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    if slug.is_empty() {
        String::from("repo")
    } else {
        slug
    }
}

/// Random `-{4 hex}` suffix used to disambiguate network aliases.
pub fn alias_suffix() -> String {
    format!("{:04x}", rand::thread_rng().gen::<u16>())
}
