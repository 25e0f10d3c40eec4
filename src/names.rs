use std::collections::HashSet;

/// Tracks every name already spoken for in a module, and mints fresh
/// suffixed names against it.
#[derive(Debug, Default)]
pub(crate) struct NameSet {
    taken: HashSet<String>,
}

impl NameSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: &str) {
        self.taken.insert(name.to_owned());
    }

    /// Mint `{base}{suffix}`, falling back to `{base}{suffix}2`,
    /// `{base}{suffix}3`, … on collision. The result is reserved.
    pub(crate) fn mint(&mut self, base: &str, suffix: &str) -> String {
        let mut candidate = format!("{base}{suffix}");
        let mut n = 2u32;
        while self.taken.contains(&candidate) {
            candidate = format!("{base}{suffix}{n}");
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }
}
