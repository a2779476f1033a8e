//! Topic name and filter parsing
//!
//! Splits topics on `/` into level tokens and enforces the structural rules
//! from MQTT spec section 4.7: `#` only as the entire last level, `+` only as an
//! entire level, no wildcards or NUL in a topic name. A trailing `/` yields
//! a final empty level and `//` an empty intermediate one; both are legal.

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::protocol::InvalidTopic;

/// How a filter token matches a topic level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Literal level string
    Exact,
    /// `+` - matches exactly one level
    SingleLevel,
    /// `#` - matches this and all deeper levels, final token only
    MultiLevel,
}

/// One level of a parsed topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicToken {
    pub value: CompactString,
    pub kind: MatchKind,
}

impl TopicToken {
    fn exact(level: &str) -> Self {
        Self {
            value: CompactString::new(level),
            kind: MatchKind::Exact,
        }
    }
}

/// Parsed filter levels; inline for typical topic depths
pub type FilterTokens = SmallVec<[TopicToken; 8]>;

/// Parsed name levels, borrowed from the input
pub type NameTokens<'a> = SmallVec<[&'a str; 8]>;

/// Validate a concrete topic name (as used in PUBLISH) without tokenizing.
pub fn validate_topic_name(name: &str) -> Result<(), InvalidTopic> {
    if name.is_empty() {
        return Err(InvalidTopic("topic name cannot be empty"));
    }
    if name.contains('\0') {
        return Err(InvalidTopic("topic name cannot contain NUL"));
    }
    if name.contains('+') || name.contains('#') {
        return Err(InvalidTopic("topic name cannot contain wildcards"));
    }
    Ok(())
}

/// Parse a concrete topic name into its level segments.
///
/// Rejects empty input, wildcards and NUL.
pub fn parse_topic_name(name: &str) -> Result<NameTokens<'_>, InvalidTopic> {
    validate_topic_name(name)?;
    Ok(name.split('/').collect())
}

/// Parse a topic filter (as used in SUBSCRIBE/UNSUBSCRIBE) into tokens.
///
/// Returns the tokens and whether any of them is a wildcard.
pub fn parse_topic_filter(filter: &str) -> Result<(FilterTokens, bool), InvalidTopic> {
    if filter.is_empty() {
        return Err(InvalidTopic("topic filter cannot be empty"));
    }
    if filter.contains('\0') {
        return Err(InvalidTopic("topic filter cannot contain NUL"));
    }

    let mut tokens = FilterTokens::new();
    let mut has_wildcard = false;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();

        match level {
            "#" => {
                if !is_last {
                    return Err(InvalidTopic("'#' must be the last level"));
                }
                has_wildcard = true;
                tokens.push(TopicToken {
                    value: CompactString::const_new("#"),
                    kind: MatchKind::MultiLevel,
                });
            }
            "+" => {
                has_wildcard = true;
                tokens.push(TopicToken {
                    value: CompactString::const_new("+"),
                    kind: MatchKind::SingleLevel,
                });
            }
            _ => {
                if level.contains('#') {
                    return Err(InvalidTopic("'#' must occupy an entire level"));
                }
                if level.contains('+') {
                    return Err(InvalidTopic("'+' must occupy an entire level"));
                }
                tokens.push(TopicToken::exact(level));
            }
        }
    }

    Ok((tokens, has_wildcard))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(filter: &str) -> Vec<MatchKind> {
        let (tokens, _) = parse_topic_filter(filter).unwrap();
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn name_splits_on_separator() {
        use MatchKind::*;

        let cases: &[(&str, usize)] = &[
            ("foo/bar", 2),
            ("hello world", 1),
            ("/bar/buz", 3),
            ("foo/bar/buz/", 4),
            ("/", 2),
            ("///", 4),
            ("a///b", 4),
            ("a/b/////", 7),
            ("a//b", 3), // one empty intermediate level
        ];
        for &(name, levels) in cases {
            let tokens = parse_topic_name(name).unwrap();
            assert_eq!(tokens.len(), levels, "topic {:?}", name);
        }

        assert_eq!(
            parse_topic_name("a/b/c").unwrap().as_slice(),
            &["a", "b", "c"]
        );
        assert_eq!(kinds("a/b/c"), vec![Exact, Exact, Exact]);
    }

    #[test]
    fn name_rejects_wildcards_and_nul() {
        assert!(parse_topic_name("").is_err());
        assert!(parse_topic_name("foo/+/bar").is_err());
        assert!(parse_topic_name("foo/bar/#").is_err());
        assert!(parse_topic_name("foo/bar+/buz").is_err());
        assert!(parse_topic_name("aaa/b\0b/ccc").is_err());
    }

    #[test]
    fn filter_wildcard_placement() {
        use MatchKind::*;

        assert_eq!(kinds("+"), vec![SingleLevel]);
        assert_eq!(kinds("+/"), vec![SingleLevel, Exact]);
        assert_eq!(kinds("+/foo/bar"), vec![SingleLevel, Exact, Exact]);
        assert_eq!(kinds("/+"), vec![Exact, SingleLevel]);
        assert_eq!(kinds("foo/bar/+"), vec![Exact, Exact, SingleLevel]);
        assert_eq!(kinds("foo/+/bar"), vec![Exact, SingleLevel, Exact]);
        assert_eq!(
            kinds("foo/+/bar/+/+/buz"),
            vec![Exact, SingleLevel, Exact, SingleLevel, SingleLevel, Exact]
        );
        assert_eq!(kinds("#"), vec![MultiLevel]);
        assert_eq!(kinds("/#"), vec![Exact, MultiLevel]);
        assert_eq!(
            kinds("foo/bar/baz/#"),
            vec![Exact, Exact, Exact, MultiLevel]
        );
        assert_eq!(
            kinds("foo/+/baz/#"),
            vec![Exact, SingleLevel, Exact, MultiLevel]
        );
    }

    #[test]
    fn filter_wildcard_flag() {
        for (filter, wildcard) in [
            ("foo/bar", false),
            ("a/b/////", false),
            ("#", true),
            ("foo/#", true),
            ("/+", true),
            ("a/+/b", true),
        ] {
            let (_, has_wildcard) = parse_topic_filter(filter).unwrap();
            assert_eq!(has_wildcard, wildcard, "filter {:?}", filter);
        }
    }

    #[test]
    fn filter_rejects_malformed_wildcards() {
        assert!(parse_topic_filter("").is_err());
        assert!(parse_topic_filter("foo/#/bar").is_err());
        assert!(parse_topic_filter("#/").is_err());
        assert!(parse_topic_filter("foo/++/bar").is_err());
        assert!(parse_topic_filter("foo/bar+/buz").is_err());
        assert!(parse_topic_filter("foo/bar#/buz").is_err());
        assert!(parse_topic_filter("aaa/b\0b/ccc").is_err());
    }
}
