//! NodeAlias: the stable, human-readable name of a consensus node.
//!
//! The alias is embedded in file names (`s-private-node0.pem`), keystore
//! aliases (`a-public-node0`), pod names (`network-node0-0`) and Kubernetes
//! label values, so it is restricted to the intersection of those grammars:
//! a lowercase letter followed by lowercase letters, digits or `-`, not
//! ending in `-`, at most 40 characters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};

/// Longest alias accepted. Leaves room for the `network-` and `-svc`
/// decorations inside the 63-character DNS label limit.
const MAX_ALIAS_LEN: usize = 40;

/// A validated node name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAlias(String);

impl NodeAlias {
    /// Parse and validate a node alias.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(KeyError::MissingArgument("node alias"));
        }

        let invalid = |reason: &str| KeyError::InvalidNodeAlias {
            alias: s.to_string(),
            reason: reason.to_string(),
        };

        if s.len() > MAX_ALIAS_LEN {
            return Err(invalid(&format!("longer than {MAX_ALIAS_LEN} characters")));
        }
        if !s.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(invalid("must start with a lowercase letter"));
        }
        if s.ends_with('-') {
            return Err(invalid("must not end with '-'"));
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(invalid(&format!("invalid character '{bad}'")));
        }

        Ok(Self(s.to_string()))
    }

    /// Parse a list of aliases, rejecting duplicates.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        let mut out: Vec<Self> = Vec::with_capacity(names.len());
        for name in names {
            let alias = Self::parse(name.as_ref())?;
            if out.contains(&alias) {
                return Err(KeyError::InvalidNodeAlias {
                    alias: alias.0,
                    reason: "listed more than once".into(),
                });
            }
            out.push(alias);
        }
        Ok(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeAlias {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeAlias {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<NodeAlias> for String {
    fn from(alias: NodeAlias) -> Self {
        alias.0
    }
}

impl AsRef<str> for NodeAlias {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAlias({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_conventional_names() {
        for name in ["node0", "node12", "validator-a", "n"] {
            assert!(NodeAlias::parse(name).is_ok(), "{name} should parse");
        }
    }

    #[test]
    fn empty_name_is_a_missing_argument() {
        assert!(matches!(
            NodeAlias::parse(""),
            Err(KeyError::MissingArgument(_))
        ));
    }

    #[test]
    fn rejects_uppercase_and_punctuation() {
        assert!(NodeAlias::parse("Node0").is_err());
        assert!(NodeAlias::parse("node_0").is_err());
        assert!(NodeAlias::parse("node.0").is_err());
        assert!(NodeAlias::parse("0node").is_err());
        assert!(NodeAlias::parse("node-").is_err());
    }

    #[test]
    fn rejects_overlong_names() {
        let long = format!("n{}", "0".repeat(MAX_ALIAS_LEN));
        assert!(NodeAlias::parse(&long).is_err());
    }

    #[test]
    fn parse_list_rejects_duplicates() {
        assert!(NodeAlias::parse_list(&["node0", "node1", "node0"]).is_err());
        let parsed = NodeAlias::parse_list(&["node1", "node0"]).unwrap();
        assert_eq!(parsed[0].as_str(), "node1");
    }

    #[test]
    fn display_is_the_bare_name() {
        let alias = NodeAlias::parse("node3").unwrap();
        assert_eq!(alias.to_string(), "node3");
        assert_eq!(format!("{alias:?}"), "NodeAlias(node3)");
    }
}
