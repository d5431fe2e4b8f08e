// Copyright 2024 The Journal Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Write as _;

use thiserror::Error;

use crate::v1::{Label, LabelSelector, LabelSet};

/// Label names reserved for selector matching against journal names.
pub const META_LABEL_NAME: &str = "name";
pub const META_LABEL_PREFIX: &str = "prefix";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseSelectorError {
    #[error("empty label name in selector segment {0:?}")]
    EmptyName(String),
    #[error("invalid label token {0:?}")]
    InvalidToken(String),
}

impl LabelSet {
    pub fn from_pairs<N, V>(pairs: &[(N, V)]) -> LabelSet
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut labels: Vec<_> = pairs
            .iter()
            .map(|(n, v)| Label {
                name: n.as_ref().to_string(),
                value: v.as_ref().to_string(),
            })
            .collect();
        labels.sort_by(|a, b| (&a.name, &a.value).cmp(&(&b.name, &b.value)));
        labels.dedup();
        LabelSet { labels }
    }

    /// True if the set is sorted on (name, value) without duplicates.
    pub fn is_consistent(&self) -> bool {
        self.labels
            .windows(2)
            .all(|w| (&w[0].name, &w[0].value) < (&w[1].name, &w[1].value))
    }

    pub fn values_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.labels
            .iter()
            .filter(move |l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn contains(&self, name: &str, value: &str) -> bool {
        self.values_of(name).any(|v| v == value)
    }
}

impl LabelSelector {
    /// Evaluates this selector against a journal's LabelSet and name.
    ///
    /// Meta-labels are matched against |name|: "name" requires equality and
    /// "prefix" requires |name| to begin with the label value. For ordinary
    /// labels, an empty selector value matches any value of that label name.
    pub fn matches(&self, set: &LabelSet, name: &str) -> bool {
        let include = self.include.clone().unwrap_or_default();
        let exclude = self.exclude.clone().unwrap_or_default();

        include.labels.iter().all(|l| label_matches(l, set, name))
            && !exclude.labels.iter().any(|l| label_matches(l, set, name))
    }
}

fn label_matches(label: &Label, set: &LabelSet, name: &str) -> bool {
    match label.name.as_str() {
        META_LABEL_NAME => label.value == name,
        META_LABEL_PREFIX => name.starts_with(&label.value),
        _ if label.value.is_empty() => set.values_of(&label.name).next().is_some(),
        _ => set.contains(&label.name, &label.value),
    }
}

impl std::fmt::Display for LabelSelector {
    /// Writes the selector in its parseable string form: comma-separated
    /// segments of `name`, `name=value`, `!name`, or `!name=value`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut write = |prefix: &str, l: &Label| -> std::fmt::Result {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(prefix)?;
            f.write_str(&l.name)?;
            if !l.value.is_empty() {
                f.write_char('=')?;
                f.write_str(&l.value)?;
            }
            Ok(())
        };

        for l in self.include.iter().flat_map(|s| s.labels.iter()) {
            write("", l)?;
        }
        for l in self.exclude.iter().flat_map(|s| s.labels.iter()) {
            write("!", l)?;
        }
        Ok(())
    }
}

/// Parses the string form written by [`LabelSelector`]'s Display.
pub fn parse_label_selector(s: &str) -> Result<LabelSelector, ParseSelectorError> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();

    for segment in s.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (negated, body) = match segment.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, segment),
        };
        let (name, value) = match body.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => (body, ""),
        };
        if name.is_empty() {
            return Err(ParseSelectorError::EmptyName(segment.to_string()));
        }
        if !is_token(name) || (!value.is_empty() && !is_token(value)) {
            return Err(ParseSelectorError::InvalidToken(segment.to_string()));
        }
        let label = Label {
            name: name.to_string(),
            value: value.to_string(),
        };
        if negated {
            exclude.push(label);
        } else {
            include.push(label);
        }
    }

    Ok(LabelSelector {
        include: Some(LabelSet { labels: include }),
        exclude: Some(LabelSet { labels: exclude }),
    })
}

/// True for label names, label values, and journal names: a non-empty run
/// of letters, digits, and `-_+/.=%` punctuation (without `=` for tokens
/// appearing in selector strings, which is checked by the parser's split).
pub fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '+' | '/' | '.' | '%'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> LabelSet {
        LabelSet::from_pairs(&[("topic", "clicks"), ("region", "us-east"), ("region", "us-west")])
    }

    #[test]
    fn from_pairs_sorts_and_dedups() {
        let s = LabelSet::from_pairs(&[("b", "2"), ("a", "1"), ("b", "2")]);
        assert!(s.is_consistent());
        assert_eq!(s.labels.len(), 2);
        assert_eq!(s.labels[0].name, "a");
    }

    #[test]
    fn selector_include_exclude() {
        let sel = parse_label_selector("topic=clicks, region").unwrap();
        assert!(sel.matches(&set(), "j"));

        let sel = parse_label_selector("topic=clicks, !region=us-east").unwrap();
        assert!(!sel.matches(&set(), "j"));

        let sel = parse_label_selector("topic=pages").unwrap();
        assert!(!sel.matches(&set(), "j"));

        // Empty value includes any value of the name, and excludes all of them.
        let sel = parse_label_selector("!region").unwrap();
        assert!(!sel.matches(&set(), "j"));
    }

    #[test]
    fn selector_meta_labels() {
        let sel = parse_label_selector("name=a/journal").unwrap();
        assert!(sel.matches(&set(), "a/journal"));
        assert!(!sel.matches(&set(), "a/journal/2"));

        let sel = parse_label_selector("prefix=a/").unwrap();
        assert!(sel.matches(&set(), "a/journal"));
        assert!(!sel.matches(&set(), "b/journal"));
    }

    #[test]
    fn selector_string_round_trip() {
        for fixture in [
            "topic=clicks, region, !stage=dev",
            "prefix=app/, !name=app/skip",
            "",
        ] {
            let sel = parse_label_selector(fixture).unwrap();
            assert_eq!(sel.to_string(), fixture);
            assert_eq!(parse_label_selector(&sel.to_string()).unwrap(), sel);
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse_label_selector("=v").is_err());
        assert!(parse_label_selector("!").is_err());
        assert!(parse_label_selector("sp ace=v").is_err());
    }
}
