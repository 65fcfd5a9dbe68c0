use rusqlite::Connection;

use crate::models::UserRow;
use crate::{Database, OptionalExt, db_err};
use waggle_types::ChatResult;

impl Database {
    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> ChatResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, chrono::Utc::now().to_rfc3339()),
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> ChatResult<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(
                conn,
                "SELECT id, username, password, active, created_at FROM users WHERE username = ?1",
                username,
            )
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> ChatResult<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(
                conn,
                "SELECT id, username, password, active, created_at FROM users WHERE id = ?1",
                id,
            )
        })
    }
}

fn query_user(conn: &Connection, sql: &str, key: &str) -> ChatResult<Option<UserRow>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    stmt.query_row([key], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            username: row.get(1)?,
            password: row.get(2)?,
            active: row.get::<_, i64>(3)? != 0,
            created_at: row.get(4)?,
        })
    })
    .optional()
}
