//! Cookie header parsing

use har_types::{Cookie, Header};

/// Parse a request `Cookie` header value (`a=1; b=2`)
pub fn parse_cookie_header(value: &str) -> Vec<Cookie> {
    value
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some(Cookie {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
                ..Default::default()
            })
        })
        .collect()
}

/// Parse a `Set-Cookie` header value
///
/// Several cookies folded into one value are separated by newlines.
pub fn parse_set_cookie_header(value: &str) -> Vec<Cookie> {
    value
        .lines()
        .filter_map(parse_single_set_cookie)
        .collect()
}

fn parse_single_set_cookie(line: &str) -> Option<Cookie> {
    let mut parts = line.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        ..Default::default()
    };

    for attribute in parts {
        let attribute = attribute.trim();
        let (key, val) = match attribute.split_once('=') {
            Some((key, val)) => (key.trim(), Some(val.trim().to_string())),
            None => (attribute, None),
        };
        match key.to_ascii_lowercase().as_str() {
            "path" => cookie.path = val,
            "domain" => cookie.domain = val,
            "expires" => cookie.expires = val,
            "samesite" => cookie.same_site = val,
            "httponly" => cookie.http_only = true,
            "secure" => cookie.secure = true,
            _ => {}
        }
    }

    Some(cookie)
}

/// Cookies carried by request `Cookie` headers
pub fn request_cookies(headers: &[Header]) -> Vec<Cookie> {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("cookie"))
        .flat_map(|header| parse_cookie_header(&header.value))
        .collect()
}

/// Cookies set by response `Set-Cookie` headers
pub fn response_cookies(headers: &[Header]) -> Vec<Cookie> {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("set-cookie"))
        .flat_map(|header| parse_set_cookie_header(&header.value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("session=abc; theme=dark;;flag");
        let pairs: Vec<(&str, &str)> = cookies
            .iter()
            .map(|c| (c.name.as_str(), c.value.as_str()))
            .collect();
        assert_eq!(pairs, vec![("session", "abc"), ("theme", "dark"), ("flag", "")]);
    }

    #[test]
    fn test_parse_set_cookie_attributes() {
        let cookies = parse_set_cookie_header(
            "id=a3fWa; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Path=/docs; Secure; HttpOnly; SameSite=Lax",
        );
        assert_eq!(cookies.len(), 1);

        let cookie = &cookies[0];
        assert_eq!(cookie.name, "id");
        assert_eq!(cookie.value, "a3fWa");
        assert_eq!(cookie.path.as_deref(), Some("/docs"));
        assert_eq!(cookie.expires.as_deref(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(cookie.same_site.as_deref(), Some("Lax"));
        assert!(cookie.secure);
        assert!(cookie.http_only);
    }

    #[test]
    fn test_parse_folded_set_cookie() {
        let cookies = parse_set_cookie_header("a=1; Path=/\nb=2\ninvalid");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1].name, "b");
    }

    #[test]
    fn test_header_filters() {
        let headers = vec![
            Header::new("Cookie", "a=1; b=2"),
            Header::new("Set-Cookie", "c=3"),
            Header::new("Accept", "*/*"),
        ];
        assert_eq!(request_cookies(&headers).len(), 2);
        assert_eq!(response_cookies(&headers)[0].name, "c");
    }
}
