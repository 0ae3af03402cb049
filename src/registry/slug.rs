//! Tenant slugs: the hostname label a project is served under.

/// Longest DNS label.
pub const MAX_SLUG_LEN: usize = 63;

const BASE_LEN: usize = 40;

/// Convert a project name to a DNS-safe label, limited to `max_len` characters.
pub fn slugify(name: &str, max_len: usize) -> String {
    let slug: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Derive a fresh slug from the project name plus a short random suffix.
pub fn generate_slug(name: &str) -> String {
    let base = slugify(name, BASE_LEN);
    let base = if base.is_empty() { "site".to_string() } else { base };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..6])
}

/// Check that `slug` is a lowercase DNS label.
pub fn validate_slug(slug: &str) -> Result<(), String> {
    if slug.is_empty() || slug.len() > MAX_SLUG_LEN {
        return Err(format!(
            "slug must be 1-{} characters, got {}",
            MAX_SLUG_LEN,
            slug.len()
        ));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "slug '{}' may only contain lowercase letters, digits and '-'",
            slug
        ));
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(format!("slug '{}' must not start or end with '-'", slug));
    }
    Ok(())
}
