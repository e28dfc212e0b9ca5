use std::{
    path::Path,
    sync::LazyLock,
};

use regex::Regex;

static SEED_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^id:(\d+),.*$").unwrap());

/// Extract the numeric id from an AFL-style seed name, `-1` when the
/// name does not carry one.
pub fn seed_id(name: &str) -> i64 {
    SEED_ID
        .captures(name)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(-1)
}

/// File name of a path, lossily decoded. Seed bookkeeping is keyed by
/// these names.
pub fn seed_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Ordering key for the random-solve fallback. Descending order prefers
/// seeds that found new coverage, then initial seeds, then smaller
/// files, then lexicographically larger names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SolvePriority {
    pub new_cover: bool,
    pub from_seed: bool,
    pub neg_size: i64,
    pub name: String,
}

impl SolvePriority {
    pub fn of(path: &Path) -> Self {
        let name = seed_name(path);
        let size = std::fs::metadata(path).map(|meta| meta.len() as i64).unwrap_or(0);
        Self {
            new_cover: name.ends_with("+cov"),
            from_seed: name.contains("orig:"),
            neg_size: -size,
            name,
        }
    }
}
