//! Host addresses and authentication methods.
//!
//! Host strings follow the `[user@]host[:port]` shape used in role lists.
//! IPv6 literals must be bracketed (`[::1]:2222`).

use std::fmt;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConfigError;
use crate::options::SecretValue;

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*\.?$")
        .expect("hostname pattern is valid")
});

static USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("user pattern is valid"));

/// A parsed host address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub user: Option<String>,
    pub hostname: String,
    pub port: Option<u16>,
}

impl HostAddress {
    /// Hostname formatted for use in a URL-like `host:port` pair.
    fn host_for_display(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        }
    }
}

impl FromStr for HostAddress {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let input = raw.trim();
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            address: raw.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("address is empty"));
        }

        let (user, rest) = match input.split_once('@') {
            Some((user, rest)) => {
                if !USER_RE.is_match(user) {
                    return Err(invalid("user name contains invalid characters"));
                }
                (Some(user.to_string()), rest)
            }
            None => (None, input),
        };

        let (hostname, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (inner, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '[' in IPv6 address"))?;
            inner
                .parse::<Ipv6Addr>()
                .map_err(|_| invalid("not a valid IPv6 address"))?;
            let port = match after {
                "" => None,
                p => Some(parse_port(
                    p.strip_prefix(':')
                        .ok_or_else(|| invalid("unexpected text after IPv6 address"))?,
                    raw,
                )?),
            };
            (inner.to_string(), port)
        } else {
            match rest.matches(':').count() {
                0 => (rest.to_string(), None),
                1 => {
                    let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
                    (host.to_string(), Some(parse_port(port, raw)?))
                }
                _ => return Err(invalid("IPv6 addresses must be written as [addr]")),
            }
        };

        if !hostname.contains(':') {
            validate_hostname(&hostname, raw)?;
        }

        Ok(Self {
            user,
            hostname,
            port,
        })
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host_for_display())?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

fn validate_hostname(hostname: &str, raw: &str) -> Result<(), ConfigError> {
    if hostname.len() > 253 || !HOSTNAME_RE.is_match(hostname) {
        return Err(ConfigError::InvalidAddress {
            address: raw.to_string(),
            reason: format!("'{hostname}' is not a valid hostname or IPv4 address"),
        });
    }
    Ok(())
}

fn parse_port(port: &str, raw: &str) -> Result<u16, ConfigError> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ConfigError::InvalidAddress {
            address: raw.to_string(),
            reason: format!("'{port}' is not a port in 1..=65535"),
        }),
    }
}

/// How a session to a host authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Private key file, known to exist when the stage was loaded.
    KeyFile(PathBuf),
    /// Password taken from a stage secret.
    Password(SecretValue),
    /// Whatever the local SSH agent offers.
    Agent,
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::KeyFile(_) => "key_file",
            AuthMethod::Password(_) => "password",
            AuthMethod::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            AuthMethod::Password(_) => f.write_str("Password([REDACTED])"),
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::KeyFile(path) => write!(f, "key {}", path.display()),
            AuthMethod::Password(_) => f.write_str("password"),
            AuthMethod::Agent => f.write_str("agent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_and_host() {
        let addr: HostAddress = "deployer@vpn.framsteg.de".parse().unwrap();
        assert_eq!(addr.user.as_deref(), Some("deployer"));
        assert_eq!(addr.hostname, "vpn.framsteg.de");
        assert_eq!(addr.port, None);
    }

    #[test]
    fn test_parse_host_with_port() {
        let addr: HostAddress = "10.0.0.5:7047".parse().unwrap();
        assert_eq!(addr.user, None);
        assert_eq!(addr.hostname, "10.0.0.5");
        assert_eq!(addr.port, Some(7047));
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let addr: HostAddress = "root@[2001:db8::1]:2222".parse().unwrap();
        assert_eq!(addr.hostname, "2001:db8::1");
        assert_eq!(addr.port, Some(2222));
        assert_eq!(addr.to_string(), "root@[2001:db8::1]:2222");
    }

    #[test]
    fn test_display_round_trips() {
        for raw in ["web1", "deployer@web1.example.com", "web1:22", "a@b:1"] {
            let addr: HostAddress = raw.parse().unwrap();
            assert_eq!(addr.to_string(), raw);
        }
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        for raw in [
            "",
            "   ",
            "bad host",
            "host:0",
            "host:70000",
            "host:abc",
            "2001:db8::1",
            "[not-ipv6]",
            "[::1",
            "-leading.example.com",
            "user name@host",
        ] {
            assert!(
                raw.parse::<HostAddress>().is_err(),
                "expected '{raw}' to be rejected"
            );
        }
    }

    #[test]
    fn test_password_auth_debug_is_redacted() {
        let auth = AuthMethod::Password(SecretValue::from("hunter2"));
        let debug = format!("{auth:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
        assert_eq!(auth.kind(), "password");
    }
}
