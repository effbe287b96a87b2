use std::{
    fmt,
    str::FromStr,
};

use regex::Regex;

use crate::labels::Labels;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Equal,
    NotEqual,
    Regexp,
    NotRegexp,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regexp => "=~",
            MatchType::NotRegexp => "!~",
        };
        write!(f, "{op}")
    }
}

/// A single label selector. Regular expressions are fully anchored, matching
/// the whole label value like PromQL selectors do.
#[derive(Clone, Debug)]
pub struct Matcher {
    pub match_type: MatchType,
    pub name: String,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    pub fn new(
        match_type: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let value = value.into();
        let re = match match_type {
            MatchType::Regexp | MatchType::NotRegexp => {
                Some(Regex::new(&format!("^(?:{value})$"))?)
            },
            MatchType::Equal | MatchType::NotEqual => None,
        };
        Ok(Self {
            match_type,
            name,
            value,
            re,
        })
    }

    /// Matcher that selects every series, used when no `--label-query` was
    /// given.
    pub fn match_all() -> Self {
        Self::new(MatchType::Regexp, "", ".*").expect(".* is a valid regex")
    }

    pub fn matches_value(&self, value: &str) -> bool {
        match self.match_type {
            MatchType::Equal => value == self.value,
            MatchType::NotEqual => value != self.value,
            MatchType::Regexp => self.re.as_ref().is_some_and(|re| re.is_match(value)),
            MatchType::NotRegexp => !self.re.as_ref().is_some_and(|re| re.is_match(value)),
        }
    }

    /// A series matches iff the matcher accepts the value of its `name` label,
    /// with a missing label treated as the empty string.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type, self.value)
    }
}

/// Parses the CLI `k<op>v` grammar. The negated and regex operators are
/// checked before plain `=` since their spellings contain it.
impl FromStr for Matcher {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for (op, match_type) in [
            ("!=", MatchType::NotEqual),
            ("=~", MatchType::Regexp),
            ("!~", MatchType::NotRegexp),
            ("=", MatchType::Equal),
        ] {
            if let Some((name, value)) = s.split_once(op) {
                anyhow::ensure!(!name.is_empty(), "invalid label matcher: {s}");
                return Matcher::new(match_type, name, value);
            }
        }
        anyhow::bail!("invalid label matcher: {s}")
    }
}

/// True iff the series matches every matcher.
pub fn matches_all(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

#[cfg(test)]
mod tests {
    use super::{
        matches_all,
        MatchType,
        Matcher,
    };
    use crate::labels::Labels;

    #[test]
    fn test_parse_operators() -> anyhow::Result<()> {
        let m: Matcher = "__name__=up".parse()?;
        assert_eq!(m.match_type, MatchType::Equal);
        let m: Matcher = "env!=prod".parse()?;
        assert_eq!(m.match_type, MatchType::NotEqual);
        let m: Matcher = "job=~node.*".parse()?;
        assert_eq!(m.match_type, MatchType::Regexp);
        let m: Matcher = "job!~node.*".parse()?;
        assert_eq!(m.match_type, MatchType::NotRegexp);
        assert!("nonsense".parse::<Matcher>().is_err());
        assert!("=value".parse::<Matcher>().is_err());
        Ok(())
    }

    #[test]
    fn test_regex_is_anchored() -> anyhow::Result<()> {
        let m = Matcher::new(MatchType::Regexp, "job", "node")?;
        assert!(m.matches_value("node"));
        assert!(!m.matches_value("node_exporter"));
        Ok(())
    }

    #[test]
    fn test_missing_label_is_empty_value() -> anyhow::Result<()> {
        let labels = Labels::from_pairs([("__name__", "up")]);
        let m = Matcher::new(MatchType::Equal, "tenant", "")?;
        assert!(m.matches(&labels));
        let m = Matcher::new(MatchType::NotEqual, "tenant", "")?;
        assert!(!m.matches(&labels));
        Ok(())
    }

    #[test]
    fn test_matches_all() -> anyhow::Result<()> {
        let labels = Labels::from_pairs([("__name__", "up"), ("env", "prod")]);
        let ms = vec![
            Matcher::new(MatchType::Equal, "__name__", "up")?,
            Matcher::new(MatchType::Regexp, "env", "prod|dev")?,
        ];
        assert!(matches_all(&ms, &labels));
        let ms = vec![Matcher::new(MatchType::Equal, "env", "dev")?];
        assert!(!matches_all(&ms, &labels));
        Ok(())
    }
}
