//! Include/exclude wildcard filters over tag and repository names.

use serde::{Deserialize, Serialize};

/// Match `candidate` against a pattern where `*` matches any run of characters and `?` matches
/// exactly one.
pub fn wildcard(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, c));
                p += 1;
            }
            Some('?') => {
                p += 1;
                c += 1;
            }
            Some(ch) if *ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match star {
                // Let the last star swallow one more character.
                Some((star_p, star_c)) => {
                    p = star_p + 1;
                    c = star_c + 1;
                    star = Some((star_p, star_c + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

/// Names pass when they match an include pattern and no exclude pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    /// Patterns to include. Empty selects nothing.
    pub include: Vec<String>,

    /// Patterns removed from the included set.
    pub exclude: Vec<String>,
}

impl Default for Filter {
    fn default() -> Self {
        Filter::all()
    }
}

impl Filter {
    /// Select every name.
    pub fn all() -> Self {
        Filter {
            include: vec!["*".to_owned()],
            exclude: Vec::new(),
        }
    }

    /// Select nothing.
    pub fn none() -> Self {
        Filter {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Select names matching any of `patterns`.
    pub fn only<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Filter {
            include: patterns.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    /// Add exclusions.
    pub fn excluding<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.exclude.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Whether this filter can select anything at all.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }

    /// Whether `name` passes.
    pub fn matches(&self, name: &str) -> bool {
        self.include.iter().any(|pattern| wildcard(pattern, name))
            && !self.exclude.iter().any(|pattern| wildcard(pattern, name))
    }
}
