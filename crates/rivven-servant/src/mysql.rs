//! MySQL backend for rivven-servant
//!
//! Connections are dialled with `mysql_async` from the fields of a
//! [`ServerDescriptor`]. Every cell is returned as text; SQL `NULL` maps to
//! `None`.

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Params};
use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, Result};
use crate::server::ServerDescriptor;
use crate::types::{Cell, ExecOutcome, RowSet};

fn params_of(args: &[String]) -> Params {
    if args.is_empty() {
        Params::Empty
    } else {
        Params::Positional(args.iter().map(|a| mysql_async::Value::from(a.as_str())).collect())
    }
}

/// Map a driver error: rejected statements are request errors, everything
/// else points at the server or the link.
fn map_error(context: &str, e: mysql_async::Error) -> Error {
    match e {
        mysql_async::Error::Server(server) => Error::query(format!(
            "{}: {} ({})",
            context, server.message, server.code
        )),
        other => Error::connection_with_source(context.to_string(), other),
    }
}

/// Render a driver value as text
fn cell_of(value: mysql_async::Value, column_type: ColumnType) -> Cell {
    use mysql_async::Value;

    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }),
        Value::Int(n) => Some(n.to_string()),
        Value::UInt(n) => Some(n.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Date(year, month, day, hour, min, sec, micros) => {
            if column_type == ColumnType::MYSQL_TYPE_DATE {
                Some(format!("{:04}-{:02}-{:02}", year, month, day))
            } else if micros == 0 {
                Some(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, min, sec
                ))
            } else {
                Some(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    year, month, day, hour, min, sec, micros
                ))
            }
        }
        Value::Time(negative, days, hours, min, sec, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = u64::from(days) * 24 + u64::from(hours);
            if micros == 0 {
                Some(format!("{}{:02}:{:02}:{:02}", sign, hours, min, sec))
            } else {
                Some(format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, min, sec, micros))
            }
        }
    }
}

/// MySQL connection implementation
pub struct MySqlConnection {
    conn: Mutex<Option<Conn>>,
    server: String,
}

impl MySqlConnection {
    /// Wrap an established driver connection
    pub fn new(conn: Conn, server: String) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            server,
        }
    }

    /// Dial `server`
    pub async fn connect(server: &ServerDescriptor) -> Result<Self> {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(server.host())
            .tcp_port(server.port())
            .db_name(Some(server.db()));

        if !server.username().is_empty() {
            opts = opts.user(Some(server.username()));
        }
        if !server.password().is_empty() {
            opts = opts.pass(Some(server.password()));
        }
        if !server.charset().is_empty() {
            opts = opts.init(vec![format!("SET NAMES {}", server.charset())]);
        }

        let conn = Conn::new(opts).await.map_err(|e| {
            map_error(&format!("failed to connect to {}", server.address()), e)
        })?;

        Ok(Self::new(conn, server.id()))
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[String]) -> Result<RowSet> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::connection("connection closed"))?;

        let mut result = conn
            .exec_iter(sql, params_of(params))
            .await
            .map_err(|e| map_error("query failed", e))?;

        let (columns, types): (Vec<String>, Vec<ColumnType>) = result
            .columns_ref()
            .iter()
            .map(|c| (c.name_str().into_owned(), c.column_type()))
            .unzip();

        let rows: Vec<mysql_async::Row> = result
            .collect()
            .await
            .map_err(|e| map_error("reading rows failed", e))?;
        drop(result);

        let rows = rows
            .into_iter()
            .map(|row| {
                row.unwrap()
                    .into_iter()
                    .zip(types.iter())
                    .map(|(value, ty)| cell_of(value, *ty))
                    .collect()
            })
            .collect();

        Ok(RowSet::new(columns, rows))
    }

    async fn execute(&self, sql: &str, params: &[String]) -> Result<ExecOutcome> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::connection("connection closed"))?;

        conn.exec_drop(sql, params_of(params))
            .await
            .map_err(|e| map_error("execute failed", e))?;

        Ok(ExecOutcome {
            rows_affected: conn.affected_rows(),
            last_insert_id: conn.last_insert_id().unwrap_or(0),
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::connection("connection closed"))?;
        conn.ping().await.map_err(|e| map_error("ping failed", e))
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| map_error(&format!("failed to close connection to {}", self.server), e))?;
        }
        Ok(())
    }
}

/// Dials [`MySqlConnection`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConnectionFactory;

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MySqlConnection::connect(server).await?))
    }

    fn backend(&self) -> &'static str {
        "mysql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_async::Value;

    #[test]
    fn test_null_and_text_cells() {
        assert_eq!(cell_of(Value::NULL, ColumnType::MYSQL_TYPE_VAR_STRING), None);
        assert_eq!(
            cell_of(Value::Bytes(b"".to_vec()), ColumnType::MYSQL_TYPE_VAR_STRING),
            Some(String::new())
        );
        assert_eq!(
            cell_of(Value::Bytes(b"{\"a\":1}".to_vec()), ColumnType::MYSQL_TYPE_JSON),
            Some("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn test_numeric_cells() {
        assert_eq!(cell_of(Value::Int(-7), ColumnType::MYSQL_TYPE_LONG), Some("-7".into()));
        assert_eq!(cell_of(Value::UInt(7), ColumnType::MYSQL_TYPE_LONGLONG), Some("7".into()));
        assert_eq!(cell_of(Value::Double(1.5), ColumnType::MYSQL_TYPE_DOUBLE), Some("1.5".into()));
    }

    #[test]
    fn test_temporal_cells() {
        assert_eq!(
            cell_of(Value::Date(2024, 3, 9, 0, 0, 0, 0), ColumnType::MYSQL_TYPE_DATE),
            Some("2024-03-09".into())
        );
        assert_eq!(
            cell_of(Value::Date(2024, 3, 9, 0, 0, 0, 0), ColumnType::MYSQL_TYPE_DATETIME),
            Some("2024-03-09 00:00:00".into())
        );
        assert_eq!(
            cell_of(Value::Date(2024, 3, 9, 8, 5, 1, 250), ColumnType::MYSQL_TYPE_DATETIME),
            Some("2024-03-09 08:05:01.000250".into())
        );
        assert_eq!(
            cell_of(Value::Time(true, 1, 2, 3, 4, 0), ColumnType::MYSQL_TYPE_TIME),
            Some("-26:03:04".into())
        );
    }

    #[test]
    fn test_params() {
        assert!(matches!(params_of(&[]), Params::Empty));
        match params_of(&["a".into(), "1".into()]) {
            Params::Positional(values) => assert_eq!(values.len(), 2),
            other => panic!("unexpected params {:?}", other),
        }
    }
}
