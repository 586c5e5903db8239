use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed set of categories a tally always reports, even at zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategorySet(Vec<String>);

impl CategorySet {
    /// Build a set from names, dropping blanks and duplicates while keeping order.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.into().trim().to_owned();
            if !name.is_empty() && !out.contains(&name) {
                out.push(name);
            }
        }
        Self(out)
    }

    pub fn contains(&self, category: &str) -> bool {
        self.0.iter().any(|c| c == category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for CategorySet {
    fn default() -> Self {
        Self::new(["a", "b"])
    }
}

impl FromStr for CategorySet {
    type Err = String;

    /// Parse a comma-separated list such as `"a,b"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let set = Self::new(s.split(','));
        if set.is_empty() {
            return Err("at least one category is required".into());
        }
        Ok(set)
    }
}

impl fmt::Display for CategorySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// Immutable snapshot of vote counts per category, produced once per poll tick.
///
/// Every category of the [`CategorySet`] it was built from is present.
/// Categories outside the set are kept as well when the store reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tally(BTreeMap<String, u64>);

impl Tally {
    /// Seed every known category with zero, then overwrite with reported counts.
    pub fn from_counts<I>(categories: &CategorySet, counts: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut map: BTreeMap<String, u64> =
            categories.iter().map(|c| (c.to_owned(), 0)).collect();
        for (category, count) in counts {
            map.insert(category, count);
        }
        Self(map)
    }

    pub fn get(&self, category: &str) -> Option<u64> {
        self.0.get(category).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// JSON object text, e.g. `{"a":3,"b":5}`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }
}
