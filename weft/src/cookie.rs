// src/cookie.rs
//
// RFC 6265 cookies: request-header parsing and Set-Cookie serialization.

use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub expires: Option<SystemTime>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    /// Free-form extension attribute, appended verbatim.
    pub extension: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// A deletion cookie: empty value, `Max-Age=-1`.
    pub fn delete(name: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: String::new(),
            max_age: Some(-1),
            ..Default::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn same_site(mut self, mode: SameSite) -> Self {
        self.same_site = Some(mode);
        self
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    /// Serialize for a Set-Cookie header.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(ref p) = self.path {
            out.push_str("; Path=");
            out.push_str(p);
        }
        if let Some(ref d) = self.domain {
            out.push_str("; Domain=");
            out.push_str(d);
        }
        if let Some(at) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(at));
        }
        if let Some(age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&age.to_string());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(ss) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(ss.as_str());
        }
        if let Some(ref ext) = self.extension {
            out.push_str("; ");
            out.push_str(ext);
        }
        out
    }
}

/// Parse a request `Cookie:` header into name/value pairs. Pairs without
/// '=' are skipped.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some(eq) = pair.find('=') {
            let name = pair[..eq].trim();
            let value = pair[eq + 1..].trim().trim_matches('"');
            if !name.is_empty() {
                out.push((name.to_string(), value.to_string()));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_cookie_header("sid=abc123; theme=\"dark\"; broken");
        assert_eq!(
            pairs,
            vec![
                ("sid".to_string(), "abc123".to_string()),
                ("theme".to_string(), "dark".to_string())
            ]
        );
    }

    #[test]
    fn test_serialize_attributes() {
        let c = Cookie::new("sid", "v")
            .path("/")
            .domain("example.com")
            .max_age(3600)
            .secure()
            .http_only()
            .same_site(SameSite::Lax)
            .extension("Partitioned");
        let s = c.to_header_value();
        assert!(s.starts_with("sid=v"));
        assert!(s.contains("; Path=/"));
        assert!(s.contains("; Domain=example.com"));
        assert!(s.contains("; Max-Age=3600"));
        assert!(s.contains("; Secure"));
        assert!(s.contains("; HttpOnly"));
        assert!(s.contains("; SameSite=Lax"));
        assert!(s.ends_with("; Partitioned"));
    }

    #[test]
    fn test_expires_http_date() {
        let c = Cookie::new("a", "b").expires(UNIX_EPOCH + Duration::from_secs(0));
        assert!(c
            .to_header_value()
            .contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn test_delete_emits_negative_max_age() {
        let c = Cookie::delete("sid");
        assert_eq!(c.to_header_value(), "sid=; Max-Age=-1");
    }
}
