//! Canonical resource keys for link deduplication

use url::Url;

/// Normalize an href into the key used to deduplicate resources.
///
/// `http` and `https` collapse to one resource, the host is lowercased with a
/// leading `www.` removed, default ports and fragments are dropped, `utm_*`
/// tracking parameters are removed, remaining query pairs are sorted and a
/// trailing slash on the path is stripped.
pub fn canonical_href(href: &str) -> String {
    let trimmed = href.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_lowercase();
    };

    if url.scheme() == "http" && url.set_scheme("https").is_err() {
        return trimmed.to_lowercase();
    }
    // Url already elides the scheme's default port, including after the
    // switch to https above.
    url.set_fragment(None);

    let host = url
        .host_str()
        .map(|h| h.strip_prefix("www.").unwrap_or(h).to_string());
    if let Some(host) = host {
        if url.set_host(Some(&host)).is_err() {
            return trimmed.to_lowercase();
        }
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.to_ascii_lowercase().starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let mut out = url.to_string();
    let query_start = out.find('?').unwrap_or(out.len());
    if out[..query_start].ends_with('/') {
        out.remove(query_start - 1);
    }
    out
}
