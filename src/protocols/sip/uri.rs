//! SIP URI representation and parsing (`sip:`/`sips:` per RFC 3261 §19.1).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Sip,
    Sips,
}

impl fmt::Display for UriScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriScheme::Sip => write!(f, "sip"),
            UriScheme::Sips => write!(f, "sips"),
        }
    }
}

/// A parsed SIP or SIPS URI.
///
/// Userinfo, host, port, URI parameters and URI headers are kept as
/// originally ordered so that re-serialization is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: UriScheme,
    pub userinfo: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Ordered `;name=value` or bare `;name` URI parameters.
    pub parameters: Vec<(String, Option<String>)>,
    /// Ordered `?name=value` URI headers.
    pub headers: Vec<(String, String)>,
}

impl SipUri {
    pub fn new<S: Into<String>>(scheme: UriScheme, host: S) -> Self {
        Self {
            scheme,
            userinfo: None,
            host: host.into(),
            port: None,
            parameters: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<Option<&str>> {
        self.parameters
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn set_parameter<S: Into<String>>(&mut self, name: &str, value: Option<S>) {
        let value = value.map(Into::into);
        if let Some(entry) = self
            .parameters
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.parameters.push((name.to_string(), value));
        }
    }

    /// `transport=` URI parameter, lower-cased.
    pub fn transport(&self) -> Option<String> {
        self.parameter("transport").flatten().map(|s| s.to_ascii_lowercase())
    }

    pub fn parse(input: &str) -> Result<Self, crate::Error> {
        let (scheme_str, rest) = input
            .split_once(':')
            .ok_or_else(|| crate::Error::parse("URI missing scheme", 0))?;

        let scheme = match scheme_str.to_ascii_lowercase().as_str() {
            "sip" => UriScheme::Sip,
            "sips" => UriScheme::Sips,
            other => {
                return Err(crate::Error::parse(format!("unsupported URI scheme '{other}'"), 0))
            }
        };

        // Split off URI headers (`?name=value&...`) first, then parameters,
        // then userinfo@hostport.
        let (before_headers, headers_str) = match rest.find('?') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        let mut parts = before_headers.split(';');
        let user_host_port = parts.next().unwrap_or_default();

        let mut parameters = Vec::new();
        for param in parts {
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((k, v)) => parameters.push((k.to_string(), Some(v.to_string()))),
                None => parameters.push((param.to_string(), None)),
            }
        }

        let (userinfo, host_port) = match user_host_port.rsplit_once('@') {
            Some((u, hp)) => (Some(u.to_string()), hp),
            None => (None, user_host_port),
        };

        let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
            // IPv6 reference: [::1]:5060
            let (addr, tail) = stripped
                .split_once(']')
                .ok_or_else(|| crate::Error::parse("unterminated IPv6 host", 0))?;
            let port = tail.strip_prefix(':').map(|p| p.parse()).transpose()
                .map_err(|_| crate::Error::parse("invalid port", 0))?;
            (addr.to_string(), port)
        } else {
            match host_port.split_once(':') {
                Some((h, p)) => {
                    let port = p
                        .parse()
                        .map_err(|_| crate::Error::parse("invalid port", 0))?;
                    (h.to_string(), Some(port))
                }
                None => (host_port.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(crate::Error::parse("URI missing host", 0));
        }

        let mut headers = Vec::new();
        if let Some(hstr) = headers_str {
            for kv in hstr.split('&') {
                if kv.is_empty() {
                    continue;
                }
                if let Some((k, v)) = kv.split_once('=') {
                    headers.push((k.to_string(), v.to_string()));
                }
            }
        }

        Ok(Self { scheme, userinfo, host, port, parameters, headers })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.userinfo {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for (name, value) in &self.parameters {
            match value {
                Some(v) => write!(f, ";{name}={v}")?,
                None => write!(f, ";{name}")?,
            }
        }
        if !self.headers.is_empty() {
            write!(f, "?")?;
            for (i, (name, value)) in self.headers.iter().enumerate() {
                if i > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{name}={value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_uri() {
        let uri = SipUri::parse("sip:alice@example.com:5060;transport=tcp").unwrap();
        assert_eq!(uri.scheme, UriScheme::Sip);
        assert_eq!(uri.userinfo.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5060));
        assert_eq!(uri.transport().as_deref(), Some("tcp"));
    }

    #[test]
    fn parses_sips_without_userinfo() {
        let uri = SipUri::parse("sips:example.com").unwrap();
        assert_eq!(uri.scheme, UriScheme::Sips);
        assert!(uri.userinfo.is_none());
        assert_eq!(uri.port, None);
    }

    #[test]
    fn parses_ipv6_host() {
        let uri = SipUri::parse("sip:bob@[::1]:5080").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, Some(5080));
    }

    #[test]
    fn round_trips_to_display() {
        let raw = "sip:alice@example.com:5060;transport=tcp";
        let uri = SipUri::parse(raw).unwrap();
        assert_eq!(uri.to_string(), raw);
    }

    #[test]
    fn rejects_missing_host() {
        assert!(SipUri::parse("sip:").is_err());
    }
}
