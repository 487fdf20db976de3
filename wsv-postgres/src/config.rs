//! PostgreSQL connection options.

use std::fmt;
use std::time::Duration;

use crate::error::{PgError, PgResult};

/// Database used when the options string does not name one.
pub const DEFAULT_DATABASE_NAME: &str = "wsv_default";

/// Immutable connection options for the storage database.
///
/// Holds the target database name together with two renderings of the
/// connection string: the full one and one with the database removed, which is
/// what administrative connections (database creation) use.
#[derive(Clone, PartialEq, Eq)]
pub struct PgOptions {
    dbname: String,
    options: String,
    options_without_dbname: String,
    form: Form,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Form {
    KeyValue,
    Url,
}

impl PgOptions {
    /// Parse a libpq key/value string (`host=localhost user=postgres dbname=db`)
    /// or a `postgres://` URL.
    ///
    /// `default_dbname` is used when the string does not select a database.
    pub fn parse(options: &str, default_dbname: &str) -> PgResult<Self> {
        let trimmed = options.trim();
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            Self::from_url(trimmed, default_dbname)
        } else {
            Self::from_key_values(parse_key_values(trimmed)?, default_dbname)
        }
    }

    fn from_key_values(pairs: Vec<(String, String)>, default_dbname: &str) -> PgResult<Self> {
        let mut dbname = None;
        let mut rest = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            if key == "dbname" {
                dbname = Some(value);
            } else {
                rest.push((key, value));
            }
        }

        let dbname = dbname.unwrap_or_else(|| default_dbname.to_string());
        if dbname.is_empty() {
            return Err(PgError::config("database name must not be empty"));
        }

        let options_without_dbname = render_key_values(&rest);
        let options = join_dbname(&options_without_dbname, &dbname);

        Ok(Self {
            dbname,
            options,
            options_without_dbname,
            form: Form::KeyValue,
        })
    }

    fn from_url(raw: &str, default_dbname: &str) -> PgResult<Self> {
        let mut parsed = url::Url::parse(raw)
            .map_err(|e| PgError::config(format!("invalid database URL: {}", e)))?;

        if parsed.scheme() != "postgresql" && parsed.scheme() != "postgres" {
            return Err(PgError::config(format!(
                "invalid scheme: expected 'postgresql' or 'postgres', got '{}'",
                parsed.scheme()
            )));
        }

        let path = parsed.path().trim_start_matches('/');
        let dbname = if path.is_empty() {
            default_dbname.to_string()
        } else {
            path.to_string()
        };
        if dbname.is_empty() {
            return Err(PgError::config("database name must not be empty"));
        }

        parsed.set_path("");
        let options_without_dbname = parsed.to_string();
        parsed.set_path(&format!("/{}", dbname));
        let options = parsed.to_string();

        Ok(Self {
            dbname,
            options,
            options_without_dbname,
            form: Form::Url,
        })
    }

    /// Create a builder for assembling options from components.
    pub fn builder() -> PgOptionsBuilder {
        PgOptionsBuilder::new()
    }

    /// Target database name.
    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Full connection string, including the database.
    pub fn options_string(&self) -> &str {
        &self.options
    }

    /// Connection string with the database removed.
    pub fn options_string_without_dbname(&self) -> &str {
        &self.options_without_dbname
    }

    /// Driver configuration for the storage database.
    pub fn to_pg_config(&self) -> PgResult<tokio_postgres::Config> {
        parse_pg_config(&self.options)
    }

    /// Driver configuration used when re-establishing a broken session: the
    /// database-less options plus the database and reconnection settings.
    pub fn to_reconnection_config(&self, connect_timeout: Duration) -> PgResult<tokio_postgres::Config> {
        let mut config = parse_pg_config(&self.options_without_dbname)?;
        config.dbname(&self.dbname);
        config.connect_timeout(connect_timeout);
        Ok(config)
    }

    /// Whether the options were given as a URL.
    pub fn is_url(&self) -> bool {
        self.form == Form::Url
    }
}

// Passwords may be embedded in the strings.
impl fmt::Debug for PgOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgOptions")
            .field("dbname", &self.dbname)
            .field("form", &self.form)
            .finish_non_exhaustive()
    }
}

fn parse_pg_config(options: &str) -> PgResult<tokio_postgres::Config> {
    options
        .parse::<tokio_postgres::Config>()
        .map_err(|e| PgError::config(format!("invalid connection options: {}", crate::error::describe(&e))))
}

fn join_dbname(without_dbname: &str, dbname: &str) -> String {
    let db = format!("dbname={}", quote_value(dbname));
    if without_dbname.is_empty() {
        db
    } else {
        format!("{} {}", without_dbname, db)
    }
}

/// Split a libpq key/value string into pairs, honouring single-quoted values
/// and backslash escapes.
pub(crate) fn parse_key_values(input: &str) -> PgResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(PgError::config(format!("missing '=' after option '{}'", key)));
        }
        if key.is_empty() {
            return Err(PgError::config("option without a name"));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => {
                            return Err(PgError::config(format!(
                                "unterminated quoted value for option '{}'",
                                key
                            )));
                        }
                    },
                    Some(c) => value.push(c),
                    None => {
                        return Err(PgError::config(format!(
                            "unterminated quoted value for option '{}'",
                            key
                        )));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

fn render_key_values(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, quote_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Builder for connection options.
#[derive(Debug, Default)]
pub struct PgOptionsBuilder {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    connect_timeout: Option<Duration>,
    application_name: Option<String>,
    extra: Vec<(String, String)>,
}

impl PgOptionsBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the application name (shown in pg_stat_activity).
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Add an arbitrary libpq option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// Build the options. Without an explicit database,
    /// [`DEFAULT_DATABASE_NAME`] is used.
    pub fn build(self) -> PgResult<PgOptions> {
        let mut pairs = vec![
            (
                "host".to_string(),
                self.host.unwrap_or_else(|| "localhost".to_string()),
            ),
            ("port".to_string(), self.port.unwrap_or(5432).to_string()),
            (
                "user".to_string(),
                self.user.unwrap_or_else(|| "postgres".to_string()),
            ),
        ];
        if let Some(password) = self.password {
            pairs.push(("password".to_string(), password));
        }
        if let Some(timeout) = self.connect_timeout {
            pairs.push((
                "connect_timeout".to_string(),
                timeout.as_secs().max(1).to_string(),
            ));
        }
        if let Some(name) = self.application_name {
            pairs.push(("application_name".to_string(), name));
        }
        pairs.extend(self.extra);
        if let Some(database) = self.database {
            pairs.push(("dbname".to_string(), database));
        }

        PgOptions::from_key_values(pairs, DEFAULT_DATABASE_NAME)
    }
}
