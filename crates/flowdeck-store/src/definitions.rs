use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::traits::DefinitionStore;
use flowdeck_core::types::{
    new_id, Definition, DefinitionKind, DefinitionVersion, GraphDefinition, SavedVersion,
};

use crate::store::{conversion_err, db_err, fmt_time, json_col, time_col, SqliteStore};

const VERSION_COLUMNS: &str = "id, definition_id, version, graph, is_active, created_at";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<DefinitionVersion> {
    Ok(DefinitionVersion {
        id: row.get(0)?,
        definition_id: row.get(1)?,
        version: row.get::<_, i64>(2)? as u32,
        graph: json_col(row, 3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: time_col(row, 5)?,
    })
}

fn definition_from_row(row: &Row<'_>) -> rusqlite::Result<Definition> {
    let kind: String = row.get(1)?;
    Ok(Definition {
        id: row.get(0)?,
        kind: kind
            .parse::<DefinitionKind>()
            .map_err(|e| conversion_err(1, e))?,
        name: row.get(2)?,
        draft: json_col(row, 3)?,
        created_at: time_col(row, 4)?,
        updated_at: time_col(row, 5)?,
    })
}

fn load_definition(conn: &Connection, definition_id: &str) -> Result<Option<Definition>> {
    conn.query_row(
        "SELECT id, kind, name, draft, created_at, updated_at
         FROM definitions WHERE id = ?1",
        params![definition_id],
        definition_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn load_version(conn: &Connection, version_id: &str) -> Result<Option<DefinitionVersion>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM definition_versions WHERE id = ?1",
            VERSION_COLUMNS
        ),
        params![version_id],
        version_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn active_version_ids(conn: &Connection, definition_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM definition_versions WHERE definition_id = ?1 AND is_active = 1")
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![definition_id], |row| row.get::<_, String>(0))
        .map_err(db_err)?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(db_err)?);
    }
    Ok(ids)
}

impl DefinitionStore for SqliteStore {
    fn create_definition(
        &self,
        kind: DefinitionKind,
        name: &str,
        draft: GraphDefinition,
    ) -> BoxFuture<'_, Result<Definition>> {
        let name = name.to_string();

        Box::pin(async move {
            let now = Utc::now();
            let definition = Definition {
                id: new_id(),
                kind,
                name,
                draft,
                created_at: now,
                updated_at: now,
            };

            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO definitions (id, kind, name, draft, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    definition.id,
                    definition.kind.as_str(),
                    definition.name,
                    serde_json::to_string(&definition.draft)?,
                    fmt_time(&definition.created_at),
                    fmt_time(&definition.updated_at),
                ],
            )
            .map_err(db_err)?;

            debug!(definition_id = %definition.id, kind = %definition.kind, "Definition created");
            Ok(definition)
        })
    }

    fn get_definition(&self, definition_id: &str) -> BoxFuture<'_, Result<Option<Definition>>> {
        let definition_id = definition_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            load_definition(&conn, &definition_id)
        })
    }

    fn update_draft(
        &self,
        definition_id: &str,
        draft: GraphDefinition,
    ) -> BoxFuture<'_, Result<()>> {
        let definition_id = definition_id.to_string();

        Box::pin(async move {
            let draft_json = serde_json::to_string(&draft)?;
            let conn = self.conn.lock().map_err(db_err)?;
            let updated = conn
                .execute(
                    "UPDATE definitions SET draft = ?1, updated_at = ?2 WHERE id = ?3",
                    params![draft_json, fmt_time(&Utc::now()), definition_id],
                )
                .map_err(db_err)?;

            if updated == 0 {
                return Err(FlowError::DefinitionNotFound(definition_id));
            }
            Ok(())
        })
    }

    fn save_version(&self, definition_id: &str) -> BoxFuture<'_, Result<SavedVersion>> {
        let definition_id = definition_id.to_string();

        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;

            let definition = load_definition(&tx, &definition_id)?
                .ok_or_else(|| FlowError::DefinitionNotFound(definition_id.clone()))?;

            let next_version: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM definition_versions
                     WHERE definition_id = ?1",
                    params![definition_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;

            // Deactivate before inserting: the partial unique index allows
            // only one active row per definition.
            let deactivated = active_version_ids(&tx, &definition_id)?;
            tx.execute(
                "UPDATE definition_versions SET is_active = 0
                 WHERE definition_id = ?1 AND is_active = 1",
                params![definition_id],
            )
            .map_err(db_err)?;

            let version = DefinitionVersion {
                id: new_id(),
                definition_id: definition_id.clone(),
                version: next_version as u32,
                graph: definition.draft,
                is_active: true,
                created_at: Utc::now(),
            };
            tx.execute(
                "INSERT INTO definition_versions (id, definition_id, version, graph, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    version.id,
                    version.definition_id,
                    next_version,
                    serde_json::to_string(&version.graph)?,
                    fmt_time(&version.created_at),
                ],
            )
            .map_err(db_err)?;

            tx.commit().map_err(db_err)?;

            info!(
                definition_id = %definition_id,
                version_id = %version.id,
                version = version.version,
                deactivated = deactivated.len(),
                "Definition version saved"
            );
            Ok(SavedVersion {
                version,
                deactivated,
            })
        })
    }

    fn activate_version(&self, version_id: &str) -> BoxFuture<'_, Result<SavedVersion>> {
        let version_id = version_id.to_string();

        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;

            let mut version = load_version(&tx, &version_id)?
                .ok_or_else(|| FlowError::VersionNotFound(version_id.clone()))?;

            let deactivated: Vec<String> = active_version_ids(&tx, &version.definition_id)?
                .into_iter()
                .filter(|id| *id != version_id)
                .collect();

            tx.execute(
                "UPDATE definition_versions SET is_active = 0
                 WHERE definition_id = ?1 AND is_active = 1",
                params![version.definition_id],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE definition_versions SET is_active = 1 WHERE id = ?1",
                params![version_id],
            )
            .map_err(db_err)?;

            tx.commit().map_err(db_err)?;

            version.is_active = true;
            info!(
                definition_id = %version.definition_id,
                version_id = %version.id,
                "Definition version activated"
            );
            Ok(SavedVersion {
                version,
                deactivated,
            })
        })
    }

    fn get_version(&self, version_id: &str) -> BoxFuture<'_, Result<Option<DefinitionVersion>>> {
        let version_id = version_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            load_version(&conn, &version_id)
        })
    }

    fn active_version(
        &self,
        definition_id: &str,
    ) -> BoxFuture<'_, Result<Option<DefinitionVersion>>> {
        let definition_id = definition_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM definition_versions
                     WHERE definition_id = ?1 AND is_active = 1
                     ORDER BY created_at DESC, version DESC
                     LIMIT 1",
                    VERSION_COLUMNS
                ),
                params![definition_id],
                version_from_row,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn list_versions(
        &self,
        definition_id: &str,
    ) -> BoxFuture<'_, Result<Vec<DefinitionVersion>>> {
        let definition_id = definition_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM definition_versions
                     WHERE definition_id = ?1
                     ORDER BY created_at DESC, version DESC",
                    VERSION_COLUMNS
                ))
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![definition_id], version_from_row)
                .map_err(db_err)?;

            let mut versions = Vec::new();
            for row in rows {
                versions.push(row.map_err(db_err)?);
            }
            Ok(versions)
        })
    }
}
