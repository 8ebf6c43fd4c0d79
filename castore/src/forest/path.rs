use bstr::ByteSlice;
use bytes::Bytes;
use std::fmt::{self, Debug, Display};

use crate::Error;

/// A validated name of a directory entry.
/// Internally uses a [bytes::Bytes], but disallows slashes and null bytes
/// to be present, as well as '.', '..' and the empty string.
#[repr(transparent)]
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathComponent {
    inner: Bytes,
}

impl PathComponent {
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl AsRef<[u8]> for PathComponent {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_ref()
    }
}

impl From<PathComponent> for Bytes {
    fn from(value: PathComponent) -> Self {
        value.inner
    }
}

pub(crate) fn is_valid_name<B: AsRef<[u8]>>(name: B) -> bool {
    let v = name.as_ref();

    !v.is_empty() && v != *b".." && v != *b"." && !v.contains(&0x00) && !v.contains(&b'/')
}

fn invalid_name(name: &[u8]) -> Error {
    Error::InvalidRequest(format!("invalid name: {:?}", name.as_bstr()))
}

impl TryFrom<Bytes> for PathComponent {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if !is_valid_name(&value) {
            return Err(invalid_name(&value));
        }

        Ok(Self { inner: value })
    }
}

impl TryFrom<&[u8]> for PathComponent {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Bytes::copy_from_slice(value).try_into()
    }
}

impl TryFrom<&str> for PathComponent {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

impl Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

/// Splits a `/`-separated path into its components.
/// Leading and trailing slashes are ignored, so `/` and the empty string
/// both name the root directory.
pub fn split_path<P: AsRef<[u8]> + ?Sized>(path: &P) -> Result<Vec<PathComponent>, Error> {
    let path = path.as_ref();
    let path = path.strip_prefix(b"/").unwrap_or(path);
    let path = path.strip_suffix(b"/").unwrap_or(path);
    if path.is_empty() {
        return Ok(Vec::new());
    }

    path.split(|c| *c == b'/')
        .map(PathComponent::try_from)
        .collect()
}

/// Renders components back into an absolute path.
pub fn join_path(components: &[PathComponent]) -> String {
    let mut out = String::new();
    for component in components {
        out.push('/');
        out.push_str(&component.to_string());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{join_path, split_path, PathComponent};
    use rstest::rstest;

    #[rstest]
    #[case::root("/", 0)]
    #[case::empty("", 0)]
    #[case::single("/a", 1)]
    #[case::relative("a/b", 2)]
    #[case::trailing("/a/b/", 2)]
    #[case::utf8("/ü/∂", 2)]
    fn split_ok(#[case] path: &str, #[case] num_components: usize) {
        let components = split_path(path).expect("must succeed");
        assert_eq!(num_components, components.len());
    }

    #[rstest]
    #[case::double_slash("/a//b")]
    #[case::dot("/a/./b")]
    #[case::dotdot("/a/..")]
    #[case::null("/a\0b")]
    fn split_fail(#[case] path: &str) {
        split_path(path).expect_err("must fail");
    }

    #[test]
    fn join() {
        assert_eq!("/", join_path(&[]));
        let components = split_path("a/b").unwrap();
        assert_eq!("/a/b", join_path(&components));
    }

    #[test]
    fn component() {
        assert!(PathComponent::try_from("..").is_err());
        assert!(PathComponent::try_from("a/b").is_err());
        assert_eq!(b"x", PathComponent::try_from("x").unwrap().as_bytes());
    }
}
