//! Path parsing: splitting a `/`-separated path string into validated path
//! components.
//!
//! Differs from the teaching source's `get_next_part` in one deliberate way:
//! a component longer than `NAME_MAX` is rejected with `FsError::InvalidPath`
//! rather than silently truncated, so a too-long component never aliases a
//! shorter one that happens to share its prefix.

use crate::error::{FsError, FsResult};
use crate::param::NAME_MAX;

/// One path component, guaranteed non-empty and at most `NAME_MAX` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName(String);

impl FileName {
    pub fn new(s: &str) -> FsResult<Self> {
        if s.is_empty() || s.len() > NAME_MAX || s.contains('/') {
            return Err(FsError::InvalidPath);
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed, absolute path: zero or more components between the root and the
/// final element. `components` is empty for the root itself (`"/"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    components: Vec<FileName>,
}

impl Path {
    /// Parses `s`, requiring a leading `/` and rejecting empty components
    /// (consecutive or trailing slashes collapse, matching shell paths) and
    /// any component over `NAME_MAX` bytes.
    pub fn parse(s: &str) -> FsResult<Self> {
        if !s.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let mut components = Vec::new();
        for part in s.split('/') {
            if part.is_empty() {
                continue;
            }
            components.push(FileName::new(part)?);
        }
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// All components except the last, naming the directories to descend
    /// through before reaching the final element.
    pub fn parent_components(&self) -> &[FileName] {
        if self.components.is_empty() {
            &[]
        } else {
            &self.components[..self.components.len() - 1]
        }
    }

    /// The final path component, or `None` for the root.
    pub fn file_name(&self) -> Option<&FileName> {
        self.components.last()
    }

    pub fn components(&self) -> &[FileName] {
        &self.components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_components() {
        let p = Path::parse("/").unwrap();
        assert!(p.is_root());
        assert_eq!(p.file_name(), None);
    }

    #[test]
    fn collapses_repeated_slashes() {
        let p = Path::parse("//a//b/").unwrap();
        assert_eq!(p.components().len(), 2);
        assert_eq!(p.file_name().unwrap().as_str(), "b");
        assert_eq!(p.parent_components()[0].as_str(), "a");
    }

    #[test]
    fn rejects_relative_path() {
        assert_eq!(Path::parse("a/b").unwrap_err(), FsError::InvalidPath);
    }

    #[test]
    fn rejects_component_over_name_max() {
        let long = "x".repeat(NAME_MAX + 1);
        let s = format!("/{}", long);
        assert_eq!(Path::parse(&s).unwrap_err(), FsError::InvalidPath);
    }

    #[test]
    fn accepts_component_at_name_max() {
        let ok = "x".repeat(NAME_MAX);
        let s = format!("/{}", ok);
        assert!(Path::parse(&s).is_ok());
    }

    #[test]
    fn rejects_component_with_embedded_slash_via_filename_new() {
        assert!(FileName::new("a/b").is_err());
        assert!(FileName::new("").is_err());
    }
}
