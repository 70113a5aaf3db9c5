//! Cookie rewriting between the upstream's origin and the caller's.
//!
//! The upstream sets cookies for its own host and security context; the
//! gateway re-issues them for the caller's origin. `Domain` is always
//! stripped (host-only cookie), and on plain HTTP `Secure` is dropped and
//! `SameSite` forced to `Lax` so the rewritten cookie is settable at all.

use axum_extra::extract::cookie::{Cookie, SameSite};
use percent_encoding::percent_decode_str;

/// Name of the gateway's own session cookie.
pub const SESSION_COOKIE: &str = "sid";
/// Name of the access-token cookie the gateway may derive a bearer from.
pub const ACCESS_TOKEN_COOKIE: &str = "AT";

/// Rewrite one upstream `Set-Cookie` value for the caller's origin.
///
/// Unparsable values pass through untouched rather than being dropped —
/// losing a rotated session cookie is worse than forwarding it verbatim.
pub fn normalize_set_cookie(raw: &str, secure_transport: bool) -> String {
    let parsed = match Cookie::parse(raw) {
        Ok(cookie) => cookie,
        Err(_) => return raw.to_string(),
    };

    // Domain is intentionally left off: the cookie becomes host-only for
    // the gateway's origin.
    let mut builder = Cookie::build((parsed.name().to_string(), parsed.value().to_string()))
        .path(parsed.path().unwrap_or("/").to_string());

    if secure_transport {
        if parsed.secure().unwrap_or(false) {
            builder = builder.secure(true);
        }
        builder = builder.same_site(parsed.same_site().unwrap_or(SameSite::Lax));
    } else {
        builder = builder.same_site(SameSite::Lax);
    }

    if parsed.http_only().unwrap_or(false) {
        builder = builder.http_only(true);
    }
    if let Some(max_age) = parsed.max_age() {
        builder = builder.max_age(max_age);
    }
    if let Some(expires) = parsed.expires() {
        builder = builder.expires(expires);
    }

    builder.build().to_string()
}

/// Removal cookie for the gateway session (logout).
pub fn clear_session_cookie() -> String {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .max_age(time::Duration::ZERO)
        .build()
        .to_string()
}

/// Extract a cookie value from a `Cookie` request header,
/// percent-decoded.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    for part in header.split(';') {
        let mut kv = part.trim().splitn(2, '=');
        let (Some(key), Some(value)) = (kv.next(), kv.next()) else {
            continue;
        };
        if key.trim() == name {
            let value = value.trim();
            return Some(percent_decode_str(value).decode_utf8_lossy().into_owned());
        }
    }
    None
}

/// Name/value pairs from a list of `Set-Cookie` values (attributes
/// ignored).
pub fn parse_set_cookie_pairs(set_cookies: &[String]) -> Vec<(String, String)> {
    set_cookies
        .iter()
        .filter_map(|raw| {
            let first = raw.split(';').next()?;
            let eq = first.find('=')?;
            let name = first[..eq].trim();
            let value = first[eq + 1..].trim();
            (!name.is_empty()).then(|| (name.to_string(), value.to_string()))
        })
        .collect()
}

/// Merge rotated cookie pairs into an existing `Cookie` request header.
/// Existing names keep their position but take the new value; unseen
/// names are appended.
pub fn merge_cookie_header(original: Option<&str>, add: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(original) = original {
        for part in original.split(';') {
            let mut kv = part.trim().splitn(2, '=');
            if let (Some(key), Some(value)) = (kv.next(), kv.next()) {
                let key = key.trim();
                if !key.is_empty() {
                    pairs.push((key.to_string(), value.trim().to_string()));
                }
            }
        }
    }
    for (name, value) in add {
        match pairs.iter_mut().find(|(existing, _)| existing == name) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((name.clone(), value.clone())),
        }
    }
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_domain_and_secure_on_plain_http() {
        let rewritten = normalize_set_cookie(
            "AT=token123; Domain=api.internal; Secure; SameSite=None; HttpOnly",
            false,
        );
        assert!(!rewritten.contains("Domain"), "{rewritten}");
        assert!(!rewritten.contains("Secure"), "{rewritten}");
        assert!(rewritten.contains("SameSite=Lax"), "{rewritten}");
        assert!(rewritten.contains("HttpOnly"), "{rewritten}");
        assert!(rewritten.contains("Path=/"), "{rewritten}");
        assert!(rewritten.starts_with("AT=token123"), "{rewritten}");
    }

    #[test]
    fn normalize_keeps_secure_and_same_site_on_tls() {
        let rewritten = normalize_set_cookie(
            "sid=abc; Domain=api.internal; Secure; SameSite=None; Path=/app",
            true,
        );
        assert!(!rewritten.contains("Domain"), "{rewritten}");
        assert!(rewritten.contains("Secure"), "{rewritten}");
        assert!(rewritten.contains("SameSite=None"), "{rewritten}");
        assert!(rewritten.contains("Path=/app"), "{rewritten}");
    }

    #[test]
    fn normalize_defaults_path_and_same_site() {
        let rewritten = normalize_set_cookie("sid=abc", false);
        assert!(rewritten.contains("Path=/"), "{rewritten}");
        assert!(rewritten.contains("SameSite=Lax"), "{rewritten}");
    }

    #[test]
    fn cookie_value_is_percent_decoded() {
        let header = "theme=dark; AT=abc%2Edef; sid=s1";
        assert_eq!(cookie_value(header, "AT").as_deref(), Some("abc.def"));
        assert_eq!(cookie_value(header, "sid").as_deref(), Some("s1"));
        assert_eq!(cookie_value(header, "missing"), None);
    }

    #[test]
    fn merge_overrides_in_place_and_appends_new() {
        let merged = merge_cookie_header(
            Some("sid=old; theme=dark"),
            &[
                ("sid".to_string(), "new".to_string()),
                ("AT".to_string(), "tok".to_string()),
            ],
        );
        assert_eq!(merged, "sid=new; theme=dark; AT=tok");
    }

    #[test]
    fn merge_with_no_original_uses_added_pairs() {
        let merged = merge_cookie_header(None, &[("AT".to_string(), "tok".to_string())]);
        assert_eq!(merged, "AT=tok");
    }

    #[test]
    fn set_cookie_pairs_ignore_attributes() {
        let pairs = parse_set_cookie_pairs(&[
            "AT=tok; Path=/; HttpOnly".to_string(),
            "sid=s2; Secure".to_string(),
        ]);
        assert_eq!(
            pairs,
            vec![
                ("AT".to_string(), "tok".to_string()),
                ("sid".to_string(), "s2".to_string())
            ]
        );
    }

    #[test]
    fn clear_session_cookie_expires_immediately() {
        let cookie = clear_session_cookie();
        assert!(cookie.starts_with("sid="), "{cookie}");
        assert!(cookie.contains("Max-Age=0"), "{cookie}");
        assert!(cookie.contains("Path=/"), "{cookie}");
    }
}
