//! Typed connection parameters resolved from a data source descriptor.

use crate::dialect::EngineKind;
use crate::error::{EngineError, Result};
use crate::models::DataSource;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Every engine gets the same short connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const ORACLE_DEFAULT_HOST: &str = "oracle";
const ORACLE_DEFAULT_SERVICE: &str = "FREEPDB1";

/// Connection parameters with engine defaults applied.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Database name (MySQL, PostgreSQL, SQL Server) or service name (Oracle).
    pub database: String,
}

// Keep the password out of logs and panics.
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"****")
            .field("database", &self.database)
            .finish()
    }
}

/// A data source resolved to an engine and validated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub engine: EngineKind,
    pub params: ConnectionParams,
}

impl ResolvedConnection {
    /// Connection string with the password masked, for logging.
    pub fn display_target(&self) -> String {
        let p = &self.params;
        match self.engine {
            EngineKind::Oracle => format!(
                "oracle://{}:****@{}:{}/{}",
                p.username, p.host, p.port, p.database
            ),
            EngineKind::Mssql => format!(
                "sqlserver://{}:****@{}:{}?database={}",
                p.username, p.host, p.port, p.database
            ),
            engine => format!(
                "{}://{}:****@{}:{}/{}",
                engine, p.username, p.host, p.port, p.database
            ),
        }
    }

    /// Oracle Easy Connect descriptor carrying the connect timeout.
    pub fn oracle_connect_string(&self) -> String {
        format!(
            "//{}:{}/{}?connect_timeout={}",
            self.params.host,
            self.params.port,
            self.params.database,
            CONNECT_TIMEOUT.as_secs()
        )
    }
}

/// Map a data source descriptor to an engine and typed parameters.
pub fn resolve_connection(source: &DataSource) -> Result<ResolvedConnection> {
    let engine: EngineKind = source.kind.parse()?;
    let params = ConnectionParams::from_config(engine, &source.connection_config)?;
    Ok(ResolvedConnection { engine, params })
}

impl ConnectionParams {
    pub fn from_config(engine: EngineKind, config: &Map<String, Value>) -> Result<Self> {
        let host = string_key(config, "host").unwrap_or_else(|| match engine {
            EngineKind::Oracle => ORACLE_DEFAULT_HOST.to_string(),
            _ => "localhost".to_string(),
        });

        let port = match port_key(config)? {
            Some(port) => port,
            None => default_port(engine),
        };

        let database = match engine {
            EngineKind::Oracle => string_key(config, "service_name")
                .or_else(|| string_key(config, "sid"))
                .unwrap_or_else(|| ORACLE_DEFAULT_SERVICE.to_string()),
            _ => string_key(config, "database").unwrap_or_default(),
        };

        Ok(Self {
            host,
            port,
            username: string_key(config, "username").unwrap_or_default(),
            password: string_key(config, "password").unwrap_or_default(),
            database,
        })
    }
}

fn default_port(engine: EngineKind) -> u16 {
    match engine {
        EngineKind::Mysql => 3306,
        EngineKind::Postgres => 5432,
        EngineKind::Oracle => 1521,
        EngineKind::Mssql => 1433,
    }
}

/// Read a non-empty scalar as text.
pub(crate) fn string_key(config: &Map<String, Value>, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Ports arrive as JSON numbers or numeric strings.
pub(crate) fn port_key(config: &Map<String, Value>) -> Result<Option<u16>> {
    let invalid = |raw: &dyn fmt::Display| EngineError::Connection(format!("invalid port: {raw}"));
    match config.get("port") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid(s)),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|p| u16::try_from(p).ok())
            .map(Some)
            .ok_or_else(|| invalid(n)),
        Some(other) => Err(invalid(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(kind: &str, config: Value) -> DataSource {
        DataSource {
            kind: kind.to_string(),
            connection_config: config.as_object().cloned().unwrap_or_default(),
            ..DataSource::default()
        }
    }

    #[test]
    fn test_oracle_defaults() {
        let resolved = resolve_connection(&source("oracle", json!({"username": "scott"}))).unwrap();
        assert_eq!(resolved.engine, EngineKind::Oracle);
        assert_eq!(resolved.params.host, "oracle");
        assert_eq!(resolved.params.port, 1521);
        assert_eq!(resolved.params.database, "FREEPDB1");
        assert_eq!(
            resolved.oracle_connect_string(),
            "//oracle:1521/FREEPDB1?connect_timeout=5"
        );
    }

    #[test]
    fn test_oracle_sid_fallback() {
        let resolved =
            resolve_connection(&source("oracle", json!({"sid": "ORCL", "service_name": ""}))).unwrap();
        assert_eq!(resolved.params.database, "ORCL");
    }

    #[test]
    fn test_port_as_string_or_number() {
        let a = resolve_connection(&source("postgres", json!({"port": "6543"}))).unwrap();
        let b = resolve_connection(&source("mysql", json!({"port": 3307.0}))).unwrap();
        let c = resolve_connection(&source("mssql", json!({}))).unwrap();
        assert_eq!(a.params.port, 6543);
        assert_eq!(b.params.port, 3307);
        assert_eq!(c.params.port, 1433);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let err = resolve_connection(&source("postgres", json!({"port": "abc"}))).unwrap_err();
        assert_eq!(err.to_string(), "invalid port: abc");
        assert!(resolve_connection(&source("postgres", json!({"port": 70000}))).is_err());
    }

    #[test]
    fn test_unknown_engine() {
        let err = resolve_connection(&source("db2", json!({}))).unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
    }

    #[test]
    fn test_display_target_masks_password() {
        let resolved = resolve_connection(&source(
            "postgres",
            json!({"host": "db", "username": "app", "password": "s3cret", "database": "sales"}),
        ))
        .unwrap();
        let shown = resolved.display_target();
        assert_eq!(shown, "postgres://app:****@db:5432/sales");
        assert!(!format!("{:?}", resolved).contains("s3cret"));
    }
}
