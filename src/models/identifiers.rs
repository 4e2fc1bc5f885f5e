//! Predicates over the identifiers the service hands out

use uuid::{Uuid, Version};

/// `8-4-4-4-12` lowercase-or-uppercase hex, 36 characters
pub fn is_canonical(id: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    if id.len() != 36 {
        return false;
    }
    let parts: Vec<&str> = id.split('-').collect();
    parts.len() == GROUPS.len()
        && parts
            .iter()
            .zip(GROUPS)
            .all(|(part, len)| part.len() == len && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Canonical, non-nil, version 7
pub fn is_uuid_v7(id: &str) -> bool {
    if !is_canonical(id) {
        return false;
    }
    match Uuid::parse_str(id) {
        Ok(uuid) => !uuid.is_nil() && uuid.get_version() == Some(Version::SortRand),
        Err(_) => false,
    }
}

/// Lexicographically non-decreasing
pub fn is_monotonic<S: AsRef<str>>(ids: &[S]) -> bool {
    ids.windows(2).all(|w| w[0].as_ref() <= w[1].as_ref())
}

pub fn all_unique<S: AsRef<str>>(ids: &[S]) -> bool {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().all(|id| seen.insert(id.as_ref()))
}

/// A fresh time-ordered identifier in canonical form
pub fn generate_v7() -> String {
    Uuid::now_v7().to_string()
}
