//! MQTT topic construction and wildcard matching

use std::fmt;

use crate::errors::OtaError;

/// Prefix marking a shared subscription: `$share/<group>/<filter>`
pub const SHARE_PREFIX: &str = "$share";

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wildcard {
    SingleLevel,
    MultiLevel,
}

/// Builds hierarchical topic paths from a root and ordered segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    root: String,
    segments: Vec<String>,
    wildcard: Option<Wildcard>,
    share_group: Option<String>,
}

impl TopicBuilder {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_matches('/').to_string(),
            segments: Vec::new(),
            wildcard: None,
            share_group: None,
        }
    }

    /// Append a segment. Embedded `/` separators are split and empty parts dropped.
    pub fn segment(mut self, segment: impl AsRef<str>) -> Self {
        self.segments.extend(
            segment
                .as_ref()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        self
    }

    pub fn segments<I, S>(self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        segments.into_iter().fold(self, |builder, s| builder.segment(s))
    }

    /// Terminate with `+`, matching exactly one more level
    pub fn single_level(mut self) -> Self {
        self.wildcard = Some(Wildcard::SingleLevel);
        self
    }

    /// Terminate with `#`, matching any remaining levels
    pub fn multi_level(mut self) -> Self {
        self.wildcard = Some(Wildcard::MultiLevel);
        self
    }

    /// Rewrite into the shared subscription form for `group`
    pub fn shared(mut self, group: impl Into<String>) -> Self {
        self.share_group = Some(group.into());
        self
    }

    pub fn build(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.segments.len() + 4);
        if let Some(ref group) = self.share_group {
            parts.push(SHARE_PREFIX);
            parts.push(group);
        }
        if !self.root.is_empty() {
            parts.push(&self.root);
        }
        parts.extend(self.segments.iter().map(String::as_str));
        match self.wildcard {
            Some(Wildcard::SingleLevel) => parts.push(SINGLE_LEVEL),
            Some(Wildcard::MultiLevel) => parts.push(MULTI_LEVEL),
            None => {}
        }
        parts.join("/")
    }
}

impl fmt::Display for TopicBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

/// Drop a `$share/<group>/` prefix, returning the filter the broker matches against
pub fn strip_share(filter: &str) -> &str {
    filter
        .strip_prefix(SHARE_PREFIX)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, filter)| filter)
        .unwrap_or(filter)
}

/// Check a subscription filter for well-formed wildcards
pub fn validate_filter(filter: &str) -> Result<(), OtaError> {
    let filter = strip_share(filter);
    if filter.is_empty() {
        return Err(OtaError::ValidationError("empty topic filter".to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let has_wildcard = level.contains('+') || level.contains('#');
        if has_wildcard && *level != SINGLE_LEVEL && *level != MULTI_LEVEL {
            return Err(OtaError::ValidationError(format!(
                "wildcard must occupy a whole level in {:?}",
                filter
            )));
        }
        if *level == MULTI_LEVEL && i != levels.len() - 1 {
            return Err(OtaError::ValidationError(format!(
                "'#' must be the last level in {:?}",
                filter
            )));
        }
    }
    Ok(())
}

/// Match a concrete topic against a subscription filter.
///
/// `+` matches exactly one level, `#` matches the remainder (including
/// nothing) and must be the last level. Malformed filters never match.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if validate_filter(filter).is_err() {
        return false;
    }
    let filter = strip_share(filter);

    // Wildcards at the first level do not reach into `$`-prefixed system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Last level of a topic, typically the vehicle id
pub fn last_segment(topic: &str) -> Option<&str> {
    topic.rsplit('/').next().filter(|s| !s.is_empty())
}
