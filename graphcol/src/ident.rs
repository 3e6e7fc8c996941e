//! Identifier brands: entity URLs, predicates and namespaces.
//!
//! Every identifier arriving at the core boundary is re-validated when it
//! is persisted, so the rules live here rather than with the callers. The
//! brands are thin wrappers over [String] that can only be constructed
//! through validation.

use std::fmt;

use lazy_static::lazy_static;
use thiserror::Error;
use url::Url;

/// Longest accepted entity URL, in characters.
pub const MAX_ENTITY_URL_LEN: usize = 2048;

lazy_static! {
    static ref PREDICATE_RE: regex::Regex =
        regex::Regex::new(r"^[$_A-Za-z][A-Za-z0-9_$]*$").unwrap();
}

#[derive(Debug, Eq, PartialEq, Error)]
pub enum IdentError {
    #[error("entity URL is empty or whitespace-only")]
    Empty,
    #[error("entity URL is {0} characters long, the maximum is {MAX_ENTITY_URL_LEN}")]
    TooLong(usize),
    #[error("entity URL contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
    #[error("entity URL does not parse: {0}")]
    Parse(#[from] url::ParseError),
    #[error("entity URL protocol {0:?} is not http or https")]
    UnsupportedScheme(String),
    #[error("entity URL hostname is empty or degenerate")]
    DegenerateHost,
    #[error("entity URL must not carry userinfo")]
    UserinfoNotAllowed,
    #[error("predicate {0:?} is not a valid identifier")]
    InvalidPredicate(String),
}

/// Characters that may not occur anywhere in an entity URL: ASCII control
/// bytes plus the invisible/zero-width code points that make two visually
/// identical URLs distinct.
fn forbidden_char(c: char) -> bool {
    matches!(c,
        '\u{00}'..='\u{1F}'
        | '\u{7F}'
        | '\u{200B}'..='\u{200D}'
        | '\u{FEFF}'
        | '\u{00AD}'
        | '\u{FFFD}')
}

fn validate_entity_url(input: &str) -> Result<Url, IdentError> {
    if input.trim().is_empty() {
        return Err(IdentError::Empty);
    }
    if input.chars().count() > MAX_ENTITY_URL_LEN {
        return Err(IdentError::TooLong(input.chars().count()));
    }
    if let Some(c) = input.chars().find(|c| forbidden_char(*c)) {
        return Err(IdentError::ForbiddenCharacter(c));
    }

    let url = Url::parse(input)?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(IdentError::UnsupportedScheme(other.to_string())),
    }

    match url.host_str() {
        None | Some("") | Some(".") | Some("..") => return Err(IdentError::DegenerateHost),
        Some(_) => {}
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(IdentError::UserinfoNotAllowed);
    }

    Ok(url)
}

/// A validated http/https URL naming an entity.
///
/// The original string is kept verbatim; the parsed form is only used
/// during validation and for derived keys, so equality is byte equality.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityUrl(String);

impl EntityUrl {
    pub fn parse(input: &str) -> Result<Self, IdentError> {
        validate_entity_url(input)?;
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The parsed form. Validation guarantees this cannot fail.
    pub(crate) fn to_url(&self) -> Url {
        Url::parse(&self.0).expect("validated at construction")
    }
}

impl TryFrom<&str> for EntityUrl {
    type Error = IdentError;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Self::parse(input)
    }
}

impl fmt::Display for EntityUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EntityUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityUrl({})", self.0)
    }
}

/// A colon-free identifier naming an edge or attribute.
///
/// Predicates starting with `$` are system-reserved (`$type` and friends)
/// but otherwise regular.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Predicate(String);

impl Predicate {
    pub fn parse(input: &str) -> Result<Self, IdentError> {
        if !PREDICATE_RE.is_match(input) {
            return Err(IdentError::InvalidPredicate(input.to_string()));
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl TryFrom<&str> for Predicate {
    type Error = IdentError;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Self::parse(input)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.0)
    }
}

/// An entity URL prefix under which a dataset's subjects live.
///
/// Determines both the chunk storage path and the prefix stripped from
/// subjects inside a chunk.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    pub fn parse(input: &str) -> Result<Self, IdentError> {
        validate_entity_url(input)?;
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> String {
        self.to_url()
            .host_str()
            .expect("validated at construction")
            .to_string()
    }

    pub(crate) fn to_url(&self) -> Url {
        Url::parse(&self.0).expect("validated at construction")
    }

    /// The non-empty segments of the namespace's URL path.
    pub fn path_segments(&self) -> Vec<String> {
        self.to_url()
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Strips this namespace off the front of `url`, if it is a prefix.
    pub fn strip_prefix<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.0.as_str())
    }

    /// Inverse of [Namespace::strip_prefix].
    pub fn rejoin(&self, suffix: &str) -> String {
        format!("{}{}", self.0, suffix)
    }
}

impl TryFrom<&str> for Namespace {
    type Error = IdentError;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Self::parse(input)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.0)
    }
}

/// Splits a hostname on `.` and reverses the segments, so related hosts
/// sort together: `blog.example.com` → `["com", "example", "blog"]`.
pub fn reversed_host_segments(host: &str) -> Vec<String> {
    host.split('.')
        .rev()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Derives the locality sort key of an entity URL.
///
/// Tokens are the reversed host segments, each path segment prefixed with
/// `/`, then the explicit `:port`, `?query` and `#fragment` as single
/// tokens. Prefix matching over the token sequence is exact and byte-wise.
pub fn sort_key(url: &EntityUrl) -> Vec<String> {
    let parsed = url.to_url();
    let mut tokens = reversed_host_segments(parsed.host_str().unwrap_or_default());

    if let Some(segments) = parsed.path_segments() {
        for segment in segments.filter(|s| !s.is_empty()) {
            tokens.push(format!("/{}", segment));
        }
    }
    if let Some(port) = parsed.port() {
        tokens.push(format!(":{}", port));
    }
    if let Some(query) = parsed.query() {
        tokens.push(format!("?{}", query));
    }
    if let Some(fragment) = parsed.fragment() {
        tokens.push(format!("#{}", fragment));
    }

    tokens
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("https://example.com/a"; "plain")]
    #[test_case("http://example.com"; "http scheme")]
    #[test_case("https://blog.example.com/posts/2024?q=1#top"; "full")]
    fn accepts_valid_urls(input: &str) {
        assert!(EntityUrl::parse(input).is_ok());
    }

    #[test_case(""; "empty")]
    #[test_case("   "; "whitespace")]
    #[test_case("ftp://example.com/a"; "wrong scheme")]
    #[test_case("https://user:pw@example.com/a"; "userinfo")]
    #[test_case("https://user@example.com/a"; "username only")]
    #[test_case("not a url at all"; "unparseable")]
    #[test_case("https://example.com/a\u{200B}b"; "zero width space")]
    #[test_case("https://example.com/a\u{FEFF}"; "byte order mark")]
    #[test_case("https://example.com/\u{00AD}"; "soft hyphen")]
    #[test_case("https://example.com/a\tb"; "control character")]
    fn rejects_invalid_urls(input: &str) {
        assert!(EntityUrl::parse(input).is_err());
    }

    #[test]
    fn rejects_overlong_url() {
        let input = format!("https://example.com/{}", "a".repeat(MAX_ENTITY_URL_LEN));
        assert!(matches!(
            EntityUrl::parse(&input),
            Err(IdentError::TooLong(_))
        ));
    }

    #[test_case("name"; "plain")]
    #[test_case("$type"; "system reserved")]
    #[test_case("_private"; "underscore")]
    #[test_case("camelCase99$"; "mixed")]
    fn accepts_valid_predicates(input: &str) {
        assert!(Predicate::parse(input).is_ok());
    }

    #[test_case(""; "empty")]
    #[test_case("rdf:type"; "colon")]
    #[test_case("has space"; "whitespace")]
    #[test_case("9starts_with_digit"; "leading digit")]
    #[test_case("dash-ed"; "dash")]
    fn rejects_invalid_predicates(input: &str) {
        assert!(Predicate::parse(input).is_err());
    }

    #[test]
    fn system_predicates() {
        assert!(Predicate::parse("$type").unwrap().is_system());
        assert!(!Predicate::parse("type").unwrap().is_system());
    }

    #[test]
    fn namespace_prefix_roundtrip() {
        let ns = Namespace::parse("https://example.com/").unwrap();
        assert_eq!(Some("a/b"), ns.strip_prefix("https://example.com/a/b"));
        assert_eq!("https://example.com/a/b", ns.rejoin("a/b"));
        assert_eq!(None, ns.strip_prefix("https://other.org/a"));
        assert_eq!("example.com", ns.host());
    }

    #[test]
    fn sort_key_tokens() {
        let url = EntityUrl::parse("https://blog.example.com/posts/2024/hello?q=foo#top").unwrap();
        assert_eq!(
            vec!["com", "example", "blog", "/posts", "/2024", "/hello", "?q=foo", "#top"],
            sort_key(&url)
        );
    }

    #[test]
    fn sort_key_explicit_port() {
        let url = EntityUrl::parse("https://example.com:8443/a").unwrap();
        assert_eq!(vec!["com", "example", "/a", ":8443"], sort_key(&url));
    }

    #[test]
    fn reversed_host() {
        assert_eq!(
            vec!["com", "example", "blog"],
            reversed_host_segments("blog.example.com")
        );
    }
}
