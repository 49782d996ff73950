//! URL rewriting for the upstream agent
//!
//! Replaces the scheme, host and port of a relayed request URL with the configured
//! target address. Path, query and fragment are kept exactly.

use thiserror::Error;
use url::{ParseError, Url};

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Invalid target address {target}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: ParseError,
    },

    #[error("Invalid request URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: ParseError,
    },

    #[error("Target address cannot carry a path: {0}")]
    OpaqueTarget(String),
}

/// Parse a target address such as `http://example.com:1234`
pub fn parse_target(target: &str) -> Result<Url, RewriteError> {
    let url = Url::parse(target).map_err(|source| RewriteError::InvalidTarget {
        target: target.to_string(),
        source,
    })?;
    if url.cannot_be_a_base() {
        return Err(RewriteError::OpaqueTarget(target.to_string()));
    }
    Ok(url)
}

/// Rewrite `url` so it points at `target`.
///
/// `url` may be absolute (`https://otherserver.com/a/b?c`) or origin-form (`/a/b?c`).
/// Any path on `target` itself is discarded, as the request path is absolute.
pub fn rewrite(target: &Url, url: &str) -> Result<Url, RewriteError> {
    let source = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(ParseError::RelativeUrlWithoutBase) if url.starts_with('/') => {
            target.join(url).map_err(|source| RewriteError::InvalidUrl {
                url: url.to_string(),
                source,
            })?
        }
        Err(source) => {
            return Err(RewriteError::InvalidUrl {
                url: url.to_string(),
                source,
            })
        }
    };

    let mut rewritten = target.clone();
    rewritten.set_path(source.path());
    rewritten.set_query(source.query());
    rewritten.set_fragment(source.fragment());
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Url {
        parse_target("http://example.com:1234").unwrap()
    }

    #[test]
    fn test_rewrite_replaces_host_and_port() {
        let out = rewrite(&target(), "http://otherserver.com:7893/a/b/c").unwrap();
        assert_eq!(out.as_str(), "http://example.com:1234/a/b/c");
    }

    #[test]
    fn test_rewrite_replaces_scheme() {
        let out = rewrite(&target(), "https://otherserver.com/a/b/c").unwrap();
        assert_eq!(out.as_str(), "http://example.com:1234/a/b/c");
    }

    #[test]
    fn test_rewrite_keeps_query_and_fragment() {
        let out = rewrite(&target(), "http://otherserver.com/search?q=a%20b&n=1#top").unwrap();
        assert_eq!(out.as_str(), "http://example.com:1234/search?q=a%20b&n=1#top");
    }

    #[test]
    fn test_rewrite_origin_form() {
        let out = rewrite(&target(), "/a/b/c?x=1").unwrap();
        assert_eq!(out.as_str(), "http://example.com:1234/a/b/c?x=1");
    }

    #[test]
    fn test_target_path_is_discarded() {
        let t = parse_target("http://example.com:1234/base/").unwrap();
        let out = rewrite(&t, "http://otherserver.com/a").unwrap();
        assert_eq!(out.as_str(), "http://example.com:1234/a");
    }

    #[test]
    fn test_malformed_url_is_an_error() {
        assert!(matches!(
            rewrite(&target(), "blah/de/blah"),
            Err(RewriteError::InvalidUrl { .. })
        ));
        assert!(matches!(
            rewrite(&target(), "http://[::1"),
            Err(RewriteError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_opaque_target_rejected() {
        assert!(matches!(
            parse_target("mailto:someone@example.com"),
            Err(RewriteError::OpaqueTarget(_))
        ));
    }
}
