//! Strict placeholder substitution shared by the config compilers.
//!
//! Placeholders are written `__NAME__`, where `NAME` is an upper-case
//! identifier whose words are separated by single underscores (`__DOMAIN__`,
//! `__WORKING_DIR__`). Substitution is a single left-to-right pass: values are
//! inserted verbatim and never rescanned, so a value that happens to contain
//! placeholder-shaped text cannot pull in another value.
//!
//! Rendering is total or it fails. Every placeholder in the template must have
//! a value, and every supplied value must be used by the template; either
//! mismatch is reported as a [`RenderError`] listing the offending names.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// Mapping from placeholder name (without the surrounding underscores) to its
/// replacement text.
pub type Placeholders = BTreeMap<String, String>;

/// Errors raised when a template and its placeholder mapping disagree.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RenderError {
    /// The template contains placeholders that have no value.
    #[error("unresolved placeholders: {}", .names.join(", "))]
    Unresolved {
        /// Placeholder names left without a value, sorted.
        names: Vec<String>,
    },
    /// Values were supplied for placeholders the template does not declare.
    #[error("unknown placeholders supplied: {}", .names.join(", "))]
    Unused {
        /// Supplied names that the template never references, sorted.
        names: Vec<String>,
    },
}

/// Renders `template`, replacing every placeholder with its value.
///
/// # Errors
///
/// Returns [`RenderError::Unresolved`] when a placeholder has no value, or
/// [`RenderError::Unused`] when `placeholders` carries a name the template
/// does not use.
///
/// # Examples
///
/// ```
/// use berth::template::{Placeholders, render};
///
/// let mut values = Placeholders::new();
/// values.insert(String::from("NAME"), String::from("demo"));
/// let text = render("service __NAME__ (__NAME__)", &values).expect("renders");
/// assert_eq!(text, "service demo (demo)");
/// ```
pub fn render(template: &str, placeholders: &Placeholders) -> Result<String, RenderError> {
    let segments = scan(template);
    let mut output = String::with_capacity(template.len());
    let mut unresolved = BTreeSet::new();
    let mut used = BTreeSet::new();

    for segment in segments {
        match segment {
            Segment::Text(text) => output.push_str(text),
            Segment::Placeholder(name) => {
                if let Some(value) = placeholders.get(name) {
                    output.push_str(value);
                    used.insert(name);
                } else {
                    unresolved.insert(name.to_owned());
                }
            }
        }
    }

    if !unresolved.is_empty() {
        return Err(RenderError::Unresolved {
            names: unresolved.into_iter().collect(),
        });
    }

    let unused: Vec<String> = placeholders
        .keys()
        .filter(|key| !used.contains(key.as_str()))
        .cloned()
        .collect();
    if !unused.is_empty() {
        return Err(RenderError::Unused { names: unused });
    }

    Ok(output)
}

#[derive(Debug, Eq, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

const DELIMITER: &str = "__";

fn scan(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = template.get(cursor..).and_then(|rest| rest.find(DELIMITER)) {
        let open = cursor + offset;
        let name_start = open + DELIMITER.len();
        let Some(name_len) = template.get(name_start..).and_then(placeholder_name_len) else {
            cursor = open + 1;
            continue;
        };

        let name_end = name_start + name_len;
        if let Some(text) = template.get(text_start..open)
            && !text.is_empty()
        {
            segments.push(Segment::Text(text));
        }
        if let Some(name) = template.get(name_start..name_end) {
            segments.push(Segment::Placeholder(name));
        }
        cursor = name_end + DELIMITER.len();
        text_start = cursor;
    }

    if let Some(text) = template.get(text_start..)
        && !text.is_empty()
    {
        segments.push(Segment::Text(text));
    }
    segments
}

/// Returns the length of the placeholder name at the start of `rest` when it
/// is followed by the closing delimiter.
fn placeholder_name_len(rest: &str) -> Option<usize> {
    let bytes = rest.as_bytes();
    if !bytes.first()?.is_ascii_uppercase() {
        return None;
    }

    let is_word = |byte: u8| byte.is_ascii_uppercase() || byte.is_ascii_digit();
    let mut index = 1;
    loop {
        match bytes.get(index).copied() {
            Some(byte) if is_word(byte) => index += 1,
            Some(b'_') => match bytes.get(index + 1).copied() {
                Some(b'_') => return Some(index),
                Some(next) if is_word(next) => index += 2,
                _ => return None,
            },
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn values(pairs: &[(&str, &str)]) -> Placeholders {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn render_replaces_every_occurrence() {
        let rendered = render(
            "server_name __DOMAIN__;\nssl /live/__DOMAIN__/key;\nport __UPSTREAM_PORT__",
            &values(&[("DOMAIN", "demo.example.com"), ("UPSTREAM_PORT", "3000")]),
        )
        .expect("render should succeed");

        assert_eq!(
            rendered,
            "server_name demo.example.com;\nssl /live/demo.example.com/key;\nport 3000"
        );
    }

    #[test]
    fn render_rejects_missing_values() {
        let err = render("__A__ __B__ __C__", &values(&[("B", "b")])).expect_err("should fail");

        assert_eq!(
            err,
            RenderError::Unresolved {
                names: vec![String::from("A"), String::from("C")]
            }
        );
    }

    #[test]
    fn render_rejects_unused_values() {
        let err = render(
            "hello __NAME__",
            &values(&[("NAME", "demo"), ("NMAE", "typo")]),
        )
        .expect_err("typo should be caught");

        assert_eq!(
            err,
            RenderError::Unused {
                names: vec![String::from("NMAE")]
            }
        );
    }

    #[test]
    fn render_does_not_rescan_inserted_values() {
        let rendered = render(
            "__FIRST__|__SECOND__",
            &values(&[("FIRST", "__SECOND__"), ("SECOND", "two")]),
        )
        .expect("render should succeed");

        assert_eq!(rendered, "__SECOND__|two");
    }

    #[test]
    fn render_is_independent_of_mapping_order() {
        let forward = values(&[("A", "1"), ("B", "2"), ("C", "3")]);
        let reverse = values(&[("C", "3"), ("B", "2"), ("A", "1")]);
        let template = "__C__-__A__-__B__";

        assert_eq!(render(template, &forward), render(template, &reverse));
    }

    #[rstest]
    #[case("no placeholders here", &[])]
    #[case("__DOMAIN__", &["DOMAIN"])]
    #[case("__HTTP_BLOCK____TLS_BLOCK__", &["HTTP_BLOCK", "TLS_BLOCK"])]
    #[case("___NAME__", &["NAME"])]
    #[case("__lower__ __A_ __ __9X__", &[])]
    #[case("$uri __A__B__", &["A"])]
    #[case("__A_1__", &["A_1"])]
    fn scan_finds_well_formed_tokens(#[case] template: &str, #[case] expected: &[&str]) {
        let found: BTreeSet<&str> = scan(template)
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name),
                Segment::Text(_) => None,
            })
            .collect();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn render_preserves_non_placeholder_underscores() {
        let rendered = render(
            "proxy_set_header X_Forwarded __HOST__ __init__",
            &values(&[("HOST", "h")]),
        )
        .expect("render should succeed");

        assert_eq!(rendered, "proxy_set_header X_Forwarded h __init__");
    }

    #[test]
    fn render_handles_multibyte_text() {
        let rendered = render("café → __NAME__ ✓", &values(&[("NAME", "ü")])).expect("render");
        assert_eq!(rendered, "café → ü ✓");
    }
}
