//! URL canonicalization and identity keys.
//!
//! Two URLs that point at the same article must map to the same identity key,
//! whatever scheme, mobile/AMP host, trailing slash or tracking parameters the
//! publisher happened to hand out. Canonicalization is pure and never fails:
//! input that cannot be parsed as an absolute URL is returned unchanged so an
//! identity key can still be derived from it.

use sha1::{Digest, Sha1};
use url::{Url, form_urlencoded};

/// Host labels stripped from the front of the hostname.
const HOST_PREFIXES: &[&str] = &["m.", "amp.", "www."];

/// Query parameters that only carry campaign/referral tracking.
pub const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_id",
    "mbid",
    "partner",
    "ncid",
    "cmpid",
    "icid",
    "ref",
    "refsrc",
    "oref",
    "_hsmi",
    "_hsenc",
    "fbclid",
    "gclid",
    "smid",
    "emc",
    "share",
    "s_cid",
    "sref",
    "rss",
    "output",
    "mod",
    "algo",
    "variant",
];

/// Normalize `raw` into its canonical form.
///
/// Rules, in order: force `https`; strip a leading `m.`, `amp.` or `www.`
/// label; strip trailing slashes; strip a trailing `/amp` segment and collapse
/// internal `/amp/` segments; drop tracking parameters and parameters whose
/// value is `amp`; keep the remaining parameters in their original order.
/// Fragments and userinfo are dropped.
///
/// The function is idempotent: `canonicalize(&canonicalize(u)) == canonicalize(u)`.
pub fn canonicalize(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw.trim()) else {
        return raw.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return raw.to_string();
    };

    let mut out = format!("https://{}", strip_host_prefixes(host));
    if let Some(port) = parsed.port().filter(|p| *p != 443) {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(&normalize_path(parsed.path()));

    let kept = parsed.query_pairs().filter(|(key, value)| {
        let key = key.to_ascii_lowercase();
        !TRACKING_PARAMS.contains(&key.as_str()) && !value.eq_ignore_ascii_case("amp")
    });
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(kept)
        .finish();
    if !query.is_empty() {
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// Hex SHA-1 digest of an already canonical URL.
pub fn identity_key(canonical_url: &str) -> String {
    hex::encode(Sha1::digest(canonical_url.as_bytes()))
}

/// Canonicalize `raw` and return `(canonical_url, identity_key)`.
pub fn identify(raw: &str) -> (String, String) {
    let url = canonicalize(raw);
    let key = identity_key(&url);
    (url, key)
}

fn strip_host_prefixes(host: &str) -> &str {
    let mut host = host;
    'outer: loop {
        for prefix in HOST_PREFIXES {
            if let Some(rest) = host.strip_prefix(prefix) {
                // Never reduce a host to a bare TLD ("m.com" stays as is).
                if rest.contains('.') {
                    host = rest;
                    continue 'outer;
                }
            }
        }
        return host;
    }
}

fn normalize_path(path: &str) -> String {
    let mut path = path.to_string();
    loop {
        let before = path.clone();
        let trimmed = path.trim_end_matches('/').len();
        path.truncate(trimmed);
        if let Some(len) = path.strip_suffix("/amp").map(str::len) {
            path.truncate(len);
        }
        while path.contains("/amp/") {
            path = path.replace("/amp/", "/");
        }
        if path == before {
            return path;
        }
    }
}
