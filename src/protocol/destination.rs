//! Destination URI construction.
//!
//! # Design Decisions
//! - The path is re-encoded: characters outside the RFC 3986 `pchar` set are
//!   percent-encoded as UTF-8, `/` is kept as the segment separator
//! - Existing `%XX` escapes are kept, so a path taken straight off a hyper URI
//!   (already encoded) is not double-encoded
//! - The query is already encoded; it is appended as-is apart from bytes a URI
//!   cannot carry (non-ASCII, controls, whitespace)

use axum::http::uri::{InvalidUri, InvalidUriParts, PathAndQuery, Uri};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt::Write;
use thiserror::Error;

/// Shortest acceptable destination prefix, `http://a`.
pub const MINIMUM_PREFIX_LEN: usize = "http://a".len();

const QUERY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Errors raised while building a destination URI.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination prefix '{0}' is not an absolute URI")]
    PrefixTooShort(String),

    #[error("invalid destination URI: {0}")]
    InvalidUri(#[from] InvalidUri),

    #[error("invalid destination URI: {0}")]
    InvalidParts(#[from] InvalidUriParts),
}

/// Concatenate `destination_prefix`, the encoded `path` and the `query`.
///
/// `path` is empty or starts with `/`; `query` is empty or starts with `?`.
pub fn make_destination_address(
    destination_prefix: &str,
    path: &str,
    query: &str,
) -> Result<Uri, DestinationError> {
    if destination_prefix.len() < MINIMUM_PREFIX_LEN {
        return Err(DestinationError::PrefixTooShort(destination_prefix.to_string()));
    }

    let prefix = if !path.is_empty() {
        destination_prefix.strip_suffix('/').unwrap_or(destination_prefix)
    } else {
        destination_prefix
    };

    let mut target = String::with_capacity(prefix.len() + path.len() * 3 + query.len());
    target.push_str(prefix);
    encode_path(path, &mut target);
    target.extend(utf8_percent_encode(query, QUERY_ENCODE_SET));

    let uri: Uri = target.parse()?;
    if uri.path_and_query().is_some_and(|pq| !pq.as_str().is_empty()) {
        return Ok(uri);
    }

    let mut parts = uri.into_parts();
    parts.path_and_query = Some(PathAndQuery::from_static("/"));
    Ok(Uri::from_parts(parts)?)
}

/// Percent-encode every byte that is not a valid path character.
pub fn encode_path(path: &str, out: &mut String) {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if is_valid_path_byte(b) {
            out.push(b as char);
        } else if b == b'%' && is_escape(&bytes[i..]) {
            out.push_str(&path[i..i + 3]);
            i += 3;
            continue;
        } else {
            let _ = write!(out, "%{b:02X}");
        }
        i += 1;
    }
}

fn is_escape(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[1].is_ascii_hexdigit() && bytes[2].is_ascii_hexdigit()
}

fn is_valid_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'-' | b'.' | b'_' | b'~'
                | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
                | b':' | b'@' | b'/'
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(prefix: &str, path: &str, query: &str) -> String {
        make_destination_address(prefix, path, query).unwrap().to_string()
    }

    #[test]
    fn empty_path_gets_a_slash() {
        assert_eq!(address("http://localhost", "", ""), "http://localhost/");
        assert_eq!(address("http://localhost/", "", ""), "http://localhost/");
    }

    #[test]
    fn prefix_path_and_query_are_joined() {
        assert_eq!(address("http://localhost/base/", "/a", "?b=c"), "http://localhost/base/a?b=c");
        assert_eq!(address("http://localhost/base", "/a", ""), "http://localhost/base/a");
        assert_eq!(address("http://localhost:8080", "", "?x=1"), "http://localhost:8080/?x=1");
    }

    #[test]
    fn non_ascii_path_is_encoded_and_query_passes() {
        assert_eq!(
            address("http://localhost/base/", "/path/你好", "?q=%C3%A9&r=a+b"),
            "http://localhost/base/path/%E4%BD%A0%E5%A5%BD?q=%C3%A9&r=a+b"
        );
        assert_eq!(
            address("http://localhost/base/", "/path/你好", "?q=é"),
            "http://localhost/base/path/%E4%BD%A0%E5%A5%BD?q=%C3%A9"
        );
    }

    #[test]
    fn reserved_characters_in_path() {
        assert_eq!(address("http://h", "/a b", ""), "http://h/a%20b");
        assert_eq!(address("http://h", "/a?b", ""), "http://h/a%3Fb");
        assert_eq!(address("http://h", "/a#b", ""), "http://h/a%23b");
        assert_eq!(address("http://h", "/!$&'()*+,;=:@", ""), "http://h/!$&'()*+,;=:@");
    }

    #[test]
    fn existing_escapes_are_not_double_encoded() {
        assert_eq!(address("http://h", "/a%20b/%2F", ""), "http://h/a%20b/%2F");
        assert_eq!(address("http://h", "/100%", ""), "http://h/100%25");
        assert_eq!(address("http://h", "/%zz", ""), "http://h/%25zz");
    }

    #[test]
    fn short_prefix_is_rejected() {
        assert!(matches!(
            make_destination_address("http://", "/", ""),
            Err(DestinationError::PrefixTooShort(_))
        ));
    }
}
