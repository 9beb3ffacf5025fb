//! Store connection URI parsing.
//!
//! Mirrors the connection-string parsing style of the teacher's
//! `config::connection::ConnectionConfig`, adapted to the scheme grammar of
//! §6: `<scheme>://[auth@][host]/<path-or-database>` with an optional
//! `readonly=true` query flag.

use crate::error::Error;

/// Supported backend schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Sqlite,
    Postgresql,
}

impl Scheme {
    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "sqlite" => Ok(Scheme::Sqlite),
            "postgresql" | "postgres" => Ok(Scheme::Postgresql),
            other => Err(Error::InvalidUri(format!("unsupported scheme '{other}'"))),
        }
    }
}

/// A parsed store URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub auth: Option<String>,
    pub host: Option<String>,
    /// File path (sqlite) or database name (postgresql). `":memory:"` for an
    /// in-memory sqlite store.
    pub path: String,
    pub readonly: bool,
}

impl Uri {
    /// Parse a `<scheme>://[auth@][host]/<path-or-database>[?readonly=true]` URI.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (scheme_str, rest) = raw
            .split_once("://")
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme in '{raw}'")))?;
        let scheme = Scheme::parse(scheme_str)?;

        let (body, query) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };

        let readonly = query
            .map(|q| q.split('&').any(|kv| kv == "readonly=true"))
            .unwrap_or(false);

        // `sqlite://:memory:` and `sqlite:///abs/path` and `sqlite://rel/path`
        // all need to preserve the path as given; only split off an auth
        // prefix when an '@' appears before the first '/'.
        let (auth, remainder) = match body.find('@') {
            Some(at) if body[..at].find('/').is_none() => {
                (Some(body[..at].to_string()), &body[at + 1..])
            }
            _ => (None, body),
        };

        let (host, path) = if scheme == Scheme::Sqlite {
            (None, remainder.to_string())
        } else {
            match remainder.split_once('/') {
                Some((h, p)) => (Some(h.to_string()), p.to_string()),
                None => (Some(remainder.to_string()), String::new()),
            }
        };

        if scheme == Scheme::Sqlite && path.is_empty() {
            return Err(Error::InvalidUri(format!(
                "sqlite URI '{raw}' is missing a file path or ':memory:'"
            )));
        }

        Ok(Uri {
            scheme,
            auth,
            host,
            path,
            readonly,
        })
    }

    /// `true` for `:memory:`, where `readonly` has no effect (§6).
    pub fn is_in_memory(&self) -> bool {
        self.scheme == Scheme::Sqlite && self.path == ":memory:"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_in_memory_sqlite() {
        let uri = Uri::parse("sqlite://:memory:").unwrap();
        assert_eq!(uri.scheme, Scheme::Sqlite);
        assert_eq!(uri.path, ":memory:");
        assert!(uri.is_in_memory());
        assert!(!uri.readonly);
    }

    #[test]
    fn parses_file_sqlite_with_readonly_flag() {
        let uri = Uri::parse("sqlite:///var/data/cube.db?readonly=true").unwrap();
        assert_eq!(uri.path, "/var/data/cube.db");
        assert!(uri.readonly);
        assert!(!uri.is_in_memory());
    }

    #[test]
    fn readonly_ignored_for_in_memory() {
        // Parsed as requested, but callers must special-case is_in_memory().
        let uri = Uri::parse("sqlite://:memory:?readonly=true").unwrap();
        assert!(uri.is_in_memory());
        assert!(uri.readonly);
    }

    #[test]
    fn parses_postgresql_with_auth_and_host() {
        let uri = Uri::parse("postgresql://user@localhost/mydb").unwrap();
        assert_eq!(uri.scheme, Scheme::Postgresql);
        assert_eq!(uri.auth.as_deref(), Some("user"));
        assert_eq!(uri.host.as_deref(), Some("localhost"));
        assert_eq!(uri.path, "mydb");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Uri::parse("mongodb://localhost/db").is_err());
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(Uri::parse("/just/a/path").is_err());
    }
}
