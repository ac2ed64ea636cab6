use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Result, StorylineError};

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "dclid", "mc_cid", "mc_eid", "ocid", "cmpid", "smid", "ref"];

fn is_tracking_param(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name.as_str())
}

/// Canonical form used for dedup: http(s) only, lowercase host, no fragment,
/// no tracking parameters, no trailing slash on non-root paths.
pub fn canonicalize(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim()).map_err(|e| StorylineError::Validation(format!("invalid url {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(StorylineError::Validation(format!("unsupported url scheme: {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(StorylineError::Validation(format!("url has no host: {raw}")));
    }

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Ok(url.to_string())
}

/// SHA-256 hex of the canonical URL.
pub fn url_hash(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Host without a leading `www.`.
pub fn source_domain(canonical: &str) -> Option<String> {
    let url = Url::parse(canonical).ok()?;
    let host = url.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_fragment_and_trailing_slash() {
        let canonical =
            canonicalize("HTTPS://WWW.Example.com/politics/story/?utm_source=rss&id=7&fbclid=abc#comments").unwrap();
        assert_eq!(canonical, "https://www.example.com/politics/story?id=7");
    }

    #[test]
    fn equivalent_urls_hash_identically() {
        let a = canonicalize("https://example.com/a/?utm_medium=social").unwrap();
        let b = canonicalize("https://example.com/a").unwrap();
        assert_eq!(url_hash(&a), url_hash(&b));
        assert_eq!(url_hash(&a).len(), 64);
    }

    #[test]
    fn root_path_keeps_its_slash() {
        assert_eq!(canonicalize("https://example.com/").unwrap(), "https://example.com/");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(canonicalize("ftp://example.com/file").is_err());
        assert!(canonicalize("not a url").is_err());
    }

    #[test]
    fn source_domain_drops_www() {
        assert_eq!(source_domain("https://www.reuters.com/world").as_deref(), Some("reuters.com"));
    }
}
