//! Child name generation.

use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashSet;

/// Length of the random suffix appended to generated names.
pub const RANDOM_SUFFIX_LENGTH: usize = 10;

const MAX_NAME_LENGTH: usize = 63;

/// Lowercase alphanumeric string of length `len`.
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_lowercase())
        .take(len)
        .collect()
}

/// `k` distinct names of the form `<prefix>-<suffix>` within the 63
/// character DNS label budget. The prefix is truncated to make room for
/// the suffix.
pub fn generate_names(prefix: &str, k: usize) -> Vec<String> {
    let budget = MAX_NAME_LENGTH - RANDOM_SUFFIX_LENGTH - 1;
    let prefix: String = prefix.chars().take(budget).collect();
    let prefix = prefix.trim_end_matches('-');

    let mut seen = HashSet::with_capacity(k);
    let mut names = Vec::with_capacity(k);
    while names.len() < k {
        let name = format!("{prefix}-{}", random_suffix(RANDOM_SUFFIX_LENGTH));
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}
