//! Store paths
//!
//! A `StorePath` is a sequence of validated segments written as `a/b/c`.
//! The empty path is the root of the replicated tree.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cumulus_common::{CumulusError, is_valid};

pub const PATH_SEPARATOR: char = '/';

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last segment, `None` for the root
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<StorePath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn child(&self, segment: &str) -> Result<StorePath, CumulusError> {
        validate_segment(segment)?;
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(Self(segments))
    }
}

fn validate_segment(segment: &str) -> Result<(), CumulusError> {
    if segment.is_empty() || !is_valid(segment) {
        return Err(CumulusError::IllegalArgument(format!(
            "invalid path segment '{}'",
            segment
        )));
    }
    Ok(())
}

impl FromStr for StorePath {
    type Err = CumulusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = s
            .split(PATH_SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .map(|segment| validate_segment(segment).map(|_| segment.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(segments))
    }
}

impl TryFrom<String> for StorePath {
    type Error = CumulusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<&str> for StorePath {
    type Error = CumulusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorePath> for String {
    fn from(path: StorePath) -> Self {
        path.to_string()
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path: StorePath = "orders/eu/42".parse().unwrap();
        assert_eq!(path.segments(), ["orders", "eu", "42"]);
        assert_eq!(path.to_string(), "orders/eu/42");
        assert_eq!(path.name(), Some("42"));

        let trimmed: StorePath = "/orders//eu/".parse().unwrap();
        assert_eq!(trimmed.to_string(), "orders/eu");
    }

    #[test]
    fn test_root() {
        let root: StorePath = "".parse().unwrap();
        assert!(root.is_root());
        assert_eq!(root, StorePath::root());
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn test_invalid_segment() {
        assert!("a/b c".parse::<StorePath>().is_err());
        assert!(StorePath::root().child("").is_err());
        assert!(StorePath::root().child("x/y").is_err());
    }

    #[test]
    fn test_parent_and_child() {
        let path: StorePath = "a/b".parse().unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "a");
        assert_eq!(path.child("c").unwrap().to_string(), "a/b/c");
    }

    #[test]
    fn test_serde_as_string() {
        let path: StorePath = "a/b".parse().unwrap();
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"a/b\"");
        let decoded: StorePath = serde_json::from_str("\"a/b\"").unwrap();
        assert_eq!(decoded, path);
        assert!(serde_json::from_str::<StorePath>("\"a/b c\"").is_err());
    }
}
