use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::traits::ExecutionStore;
use flowdeck_core::types::{
    AgentExecution, Completion, ExecutionRecord, ScenarioExecution, StepExecution,
};

use crate::store::{
    db_err, fmt_time, json_col, opt_json_col, opt_json_text, opt_time_col, opt_u64_col,
    status_col, time_col, to_json_text, SqliteStore,
};

const SCENARIO_COLUMNS: &str = "id, scenario_id, definition_version_id, status, input, output, \
     error, started_at, completed_at, duration_ms, conversation_id, triggered_by";

const AGENT_COLUMNS: &str = "id, scenario_execution_id, agent_id, definition_version_id, \
     orchestration_node_id, status, input, output, error, started_at, completed_at, duration_ms";

const STEP_COLUMNS: &str = "id, agent_execution_id, step_index, node_id, node_type, status, \
     input, output, error, started_at, completed_at, duration_ms";

/// Every audit table, in lookup order.
const TABLES: [&str; 3] = ["scenario_executions", "agent_executions", "step_executions"];

fn scenario_from_row(row: &Row<'_>) -> rusqlite::Result<ScenarioExecution> {
    Ok(ScenarioExecution {
        id: row.get(0)?,
        scenario_id: row.get(1)?,
        definition_version_id: row.get(2)?,
        status: status_col(row, 3)?,
        input: json_col(row, 4)?,
        output: opt_json_col(row, 5)?,
        error: row.get(6)?,
        started_at: time_col(row, 7)?,
        completed_at: opt_time_col(row, 8)?,
        duration_ms: opt_u64_col(row, 9)?,
        conversation_id: row.get(10)?,
        triggered_by: row.get(11)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentExecution> {
    Ok(AgentExecution {
        id: row.get(0)?,
        scenario_execution_id: row.get(1)?,
        agent_id: row.get(2)?,
        definition_version_id: row.get(3)?,
        orchestration_node_id: row.get(4)?,
        status: status_col(row, 5)?,
        input: json_col(row, 6)?,
        output: opt_json_col(row, 7)?,
        error: row.get(8)?,
        started_at: time_col(row, 9)?,
        completed_at: opt_time_col(row, 10)?,
        duration_ms: opt_u64_col(row, 11)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepExecution> {
    Ok(StepExecution {
        id: row.get(0)?,
        agent_execution_id: row.get(1)?,
        step_index: row.get::<_, i64>(2)? as u32,
        node_id: row.get(3)?,
        node_type: row.get(4)?,
        status: status_col(row, 5)?,
        input: json_col(row, 6)?,
        output: opt_json_col(row, 7)?,
        error: row.get(8)?,
        started_at: time_col(row, 9)?,
        completed_at: opt_time_col(row, 10)?,
        duration_ms: opt_u64_col(row, 11)?,
    })
}

fn record_exists(conn: &Connection, id: &str) -> Result<bool> {
    for table in TABLES {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", table),
                params![id],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?;
        if found.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Apply a terminal update if, and only if, the record is still live.
fn complete_in(
    conn: &Connection,
    table: &str,
    id: &str,
    completion: &Completion,
) -> Result<bool> {
    let updated = conn
        .execute(
            &format!(
                "UPDATE {} SET status = ?1, output = ?2, error = ?3, completed_at = ?4, duration_ms = ?5
                 WHERE id = ?6 AND status IN ('pending', 'running')",
                table
            ),
            params![
                completion.status.as_str(),
                opt_json_text(&completion.output),
                completion.error,
                fmt_time(&completion.completed_at),
                completion.duration_ms as i64,
                id,
            ],
        )
        .map_err(db_err)?;

    if updated == 1 {
        return Ok(true);
    }
    if !record_exists(conn, id)? {
        return Err(FlowError::ExecutionNotFound(id.to_string()));
    }
    warn!(
        execution_id = %id,
        table,
        status = %completion.status,
        "Record already terminal, completion ignored"
    );
    Ok(false)
}

fn list_agents(conn: &Connection, scenario_execution_id: &str) -> Result<Vec<AgentExecution>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM agent_executions
             WHERE scenario_execution_id = ?1
             ORDER BY started_at ASC, rowid ASC",
            AGENT_COLUMNS
        ))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![scenario_execution_id], agent_from_row)
        .map_err(db_err)?;

    let mut agents = Vec::new();
    for row in rows {
        agents.push(row.map_err(db_err)?);
    }
    Ok(agents)
}

impl ExecutionStore for SqliteStore {
    fn create_scenario_execution(
        &self,
        execution: &ScenarioExecution,
    ) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                &format!(
                    "INSERT INTO scenario_executions ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    SCENARIO_COLUMNS
                ),
                params![
                    execution.id,
                    execution.scenario_id,
                    execution.definition_version_id,
                    execution.status.as_str(),
                    to_json_text(&execution.input),
                    opt_json_text(&execution.output),
                    execution.error,
                    fmt_time(&execution.started_at),
                    execution.completed_at.as_ref().map(fmt_time),
                    execution.duration_ms.map(|d| d as i64),
                    execution.conversation_id,
                    execution.triggered_by,
                ],
            )
            .map_err(db_err)?;
            debug!(execution_id = %execution.id, "Scenario execution recorded");
            Ok(())
        })
    }

    fn complete_scenario_execution(
        &self,
        execution_id: &str,
        completion: Completion,
    ) -> BoxFuture<'_, Result<bool>> {
        let execution_id = execution_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            complete_in(&conn, "scenario_executions", &execution_id, &completion)
        })
    }

    fn create_agent_execution(&self, execution: &AgentExecution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                &format!(
                    "INSERT INTO agent_executions ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    AGENT_COLUMNS
                ),
                params![
                    execution.id,
                    execution.scenario_execution_id,
                    execution.agent_id,
                    execution.definition_version_id,
                    execution.orchestration_node_id,
                    execution.status.as_str(),
                    to_json_text(&execution.input),
                    opt_json_text(&execution.output),
                    execution.error,
                    fmt_time(&execution.started_at),
                    execution.completed_at.as_ref().map(fmt_time),
                    execution.duration_ms.map(|d| d as i64),
                ],
            )
            .map_err(db_err)?;
            debug!(execution_id = %execution.id, "Agent execution recorded");
            Ok(())
        })
    }

    fn complete_agent_execution(
        &self,
        execution_id: &str,
        completion: Completion,
    ) -> BoxFuture<'_, Result<bool>> {
        let execution_id = execution_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            complete_in(&conn, "agent_executions", &execution_id, &completion)
        })
    }

    fn create_step_execution(&self, step: &StepExecution) -> BoxFuture<'_, Result<()>> {
        let step = step.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                &format!(
                    "INSERT INTO step_executions ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    STEP_COLUMNS
                ),
                params![
                    step.id,
                    step.agent_execution_id,
                    step.step_index as i64,
                    step.node_id,
                    step.node_type,
                    step.status.as_str(),
                    to_json_text(&step.input),
                    opt_json_text(&step.output),
                    step.error,
                    fmt_time(&step.started_at),
                    step.completed_at.as_ref().map(fmt_time),
                    step.duration_ms.map(|d| d as i64),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn complete_step_execution(
        &self,
        step_id: &str,
        completion: Completion,
    ) -> BoxFuture<'_, Result<bool>> {
        let step_id = step_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            complete_in(&conn, "step_executions", &step_id, &completion)
        })
    }

    fn get_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            let scenario = conn
                .query_row(
                    &format!("SELECT {} FROM scenario_executions WHERE id = ?1", SCENARIO_COLUMNS),
                    params![execution_id],
                    scenario_from_row,
                )
                .optional()
                .map_err(db_err)?;
            if let Some(execution) = scenario {
                let agents = list_agents(&conn, &execution.id)?;
                return Ok(Some(ExecutionRecord::Scenario { execution, agents }));
            }

            let agent = conn
                .query_row(
                    &format!("SELECT {} FROM agent_executions WHERE id = ?1", AGENT_COLUMNS),
                    params![execution_id],
                    agent_from_row,
                )
                .optional()
                .map_err(db_err)?;
            if let Some(execution) = agent {
                return Ok(Some(ExecutionRecord::Agent(execution)));
            }

            let step = conn
                .query_row(
                    &format!("SELECT {} FROM step_executions WHERE id = ?1", STEP_COLUMNS),
                    params![execution_id],
                    step_from_row,
                )
                .optional()
                .map_err(db_err)?;
            Ok(step.map(ExecutionRecord::Step))
        })
    }

    fn list_steps(&self, agent_execution_id: &str) -> BoxFuture<'_, Result<Vec<StepExecution>>> {
        let agent_execution_id = agent_execution_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM step_executions
                     WHERE agent_execution_id = ?1
                     ORDER BY step_index ASC",
                    STEP_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![agent_execution_id], step_from_row)
                .map_err(db_err)?;

            let mut steps = Vec::new();
            for row in rows {
                steps.push(row.map_err(db_err)?);
            }
            Ok(steps)
        })
    }

    fn list_agent_executions(
        &self,
        scenario_execution_id: &str,
    ) -> BoxFuture<'_, Result<Vec<AgentExecution>>> {
        let scenario_execution_id = scenario_execution_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            list_agents(&conn, &scenario_execution_id)
        })
    }

    fn cancel_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<bool>> {
        let execution_id = execution_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let now = fmt_time(&Utc::now());

            for table in TABLES {
                let updated = conn
                    .execute(
                        &format!(
                            "UPDATE {} SET status = 'cancelled', completed_at = ?1
                             WHERE id = ?2 AND status IN ('pending', 'running')",
                            table
                        ),
                        params![now, execution_id],
                    )
                    .map_err(db_err)?;
                if updated == 1 {
                    debug!(execution_id = %execution_id, table, "Execution cancelled");
                    return Ok(true);
                }
            }

            if record_exists(&conn, &execution_id)? {
                Ok(false)
            } else {
                Err(FlowError::ExecutionNotFound(execution_id))
            }
        })
    }
}
