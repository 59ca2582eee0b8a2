//! SQLite implementation of the inventory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::models::{
    Claim, Edge, FailureKind, GroupRecord, GroupUpdate, HostRecord, HostUpdate, InventoryRecord,
    NewGroup, NewHost, OrganizationRecord, RunRecord, RunStatus,
};
use super::pool::{create_pool, create_pool_with_options, PoolOptions};
use super::schema::run_migrations;
use super::{DbError, InventoryRepository, InventoryStore, InventoryTransaction};
use crate::graph::Variables;

const HOST_COLUMNS: &str = "id, inventory_id, name, description, variables, enabled, instance_id";
const GROUP_COLUMNS: &str = "id, inventory_id, name, description, variables";

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|e| DbError::Decode(e.to_string()))
        .map(|dt| dt.with_timezone(&Utc))
}

/// SQLite implementation of [`InventoryStore`].
#[derive(Clone)]
pub struct SqliteInventoryStore {
    pool: SqlitePool,
}

impl SqliteInventoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the database at `database_url` and applies migrations.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Like [`connect`](Self::connect) with explicit pool options.
    pub async fn connect_with_options(
        database_url: &str,
        options: PoolOptions,
    ) -> Result<Self, DbError> {
        let pool = create_pool_with_options(database_url, options).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_organization(&self, name: &str, max_hosts: u32) -> Result<i64, DbError> {
        let result = sqlx::query("INSERT INTO organizations (name, max_hosts) VALUES (?, ?)")
            .bind(name)
            .bind(max_hosts as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn create_inventory(
        &self,
        name: &str,
        organization_id: Option<i64>,
    ) -> Result<i64, DbError> {
        let result = sqlx::query("INSERT INTO inventories (name, organization_id) VALUES (?, ?)")
            .bind(name)
            .bind(organization_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn create_source(&self, inventory_id: i64, name: &str) -> Result<i64, DbError> {
        let result = sqlx::query("INSERT INTO inventory_sources (inventory_id, name) VALUES (?, ?)")
            .bind(inventory_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl InventoryStore for SqliteInventoryStore {
    async fn begin(&self, inventory_id: i64) -> Result<Box<dyn InventoryTransaction>, DbError> {
        let mut tx = self.pool.begin().await?;
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM inventories WHERE id = ?)")
            .bind(inventory_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            tx.rollback().await?;
            return Err(DbError::not_found("Inventory", inventory_id));
        }
        Ok(Box::new(SqliteInventoryTransaction {
            inventory_id,
            tx: Mutex::new(tx),
        }))
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), DbError> {
        let summary = record
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO import_runs (
                run_id, inventory_id, source_id, status, failure, license_error,
                org_host_limit_error, detail, summary, started_at, finished_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(record.inventory_id)
        .bind(record.source_id)
        .bind(record.status.as_db_str())
        .bind(record.failure.map(|f| f.as_db_str()))
        .bind(record.license_error)
        .bind(record.org_host_limit_error)
        .bind(&record.detail)
        .bind(&summary)
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, DbError> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT run_id, inventory_id, source_id, status, failure, license_error,
                   org_host_limit_error, detail, summary, started_at, finished_at
            FROM import_runs
            WHERE run_id = ?
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }
}

/// A transaction on a [`SqliteInventoryStore`].
pub struct SqliteInventoryTransaction {
    inventory_id: i64,
    tx: Mutex<Transaction<'static, Sqlite>>,
}

impl SqliteInventoryTransaction {
    async fn host_by_pk(&self, pk: i64) -> Result<HostRecord, DbError> {
        self.find_hosts_by_pks(&[pk])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::not_found("Host", pk))
    }

    async fn group_by_pk(&self, pk: i64) -> Result<GroupRecord, DbError> {
        let sql = format!(
            "SELECT {} FROM inventory_groups WHERE inventory_id = ? AND id = ?",
            GROUP_COLUMNS
        );
        let mut tx = self.tx.lock().await;
        let row: Option<GroupRow> = sqlx::query_as(&sql)
            .bind(self.inventory_id)
            .bind(pk)
            .fetch_optional(&mut **tx)
            .await?;
        row.ok_or_else(|| DbError::not_found("Group", pk))?.try_into()
    }

    async fn host_by_name(&self, name: &str) -> Result<Option<HostRecord>, DbError> {
        Ok(self
            .find_hosts_by_names(&[name.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn group_by_name(&self, name: &str) -> Result<Option<GroupRecord>, DbError> {
        Ok(self
            .find_groups_by_names(&[name.to_string()])
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl InventoryRepository for SqliteInventoryTransaction {
    fn inventory_id(&self) -> i64 {
        self.inventory_id
    }

    async fn inventory(&self) -> Result<InventoryRecord, DbError> {
        let mut tx = self.tx.lock().await;
        let row: Option<InventoryRow> = sqlx::query_as(
            "SELECT id, name, organization_id, variables FROM inventories WHERE id = ?",
        )
        .bind(self.inventory_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or_else(|| DbError::not_found("Inventory", self.inventory_id))?
            .try_into()
    }

    async fn update_inventory_variables(&self, variables: &Variables) -> Result<(), DbError> {
        let variables = serde_json::to_string(variables)?;
        let mut tx = self.tx.lock().await;
        sqlx::query("UPDATE inventories SET variables = ? WHERE id = ?")
            .bind(&variables)
            .bind(self.inventory_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn organization(&self, id: i64) -> Result<Option<OrganizationRecord>, DbError> {
        let mut tx = self.tx.lock().await;
        let row: Option<(i64, String, i64)> =
            sqlx::query_as("SELECT id, name, max_hosts FROM organizations WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(row.map(|(id, name, max_hosts)| OrganizationRecord {
            id,
            name,
            max_hosts: max_hosts.max(0) as u32,
        }))
    }

    async fn active_host_count(&self) -> Result<u64, DbError> {
        let mut tx = self.tx.lock().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT name) FROM hosts")
            .fetch_one(&mut **tx)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn organization_host_count(&self, organization_id: i64) -> Result<u64, DbError> {
        let mut tx = self.tx.lock().await;
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT h.name)
            FROM hosts h
            JOIN inventories i ON i.id = h.inventory_id
            WHERE i.organization_id = ?
            "#,
        )
        .bind(organization_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn owned_hosts(&self, source_id: i64) -> Result<Vec<HostRecord>, DbError> {
        let mut tx = self.tx.lock().await;
        let rows: Vec<HostRow> = sqlx::query_as(
            r#"
            SELECT h.id, h.inventory_id, h.name, h.description, h.variables, h.enabled, h.instance_id
            FROM hosts h
            JOIN ownership_claims c ON c.kind = 'host' AND c.first_id = h.id
            WHERE c.source_id = ? AND h.inventory_id = ?
            ORDER BY h.id
            "#,
        )
        .bind(source_id)
        .bind(self.inventory_id)
        .fetch_all(&mut **tx)
        .await?;
        rows.into_iter().map(HostRecord::try_from).collect()
    }

    async fn owned_groups(&self, source_id: i64) -> Result<Vec<GroupRecord>, DbError> {
        let mut tx = self.tx.lock().await;
        let rows: Vec<GroupRow> = sqlx::query_as(
            r#"
            SELECT g.id, g.inventory_id, g.name, g.description, g.variables
            FROM inventory_groups g
            JOIN ownership_claims c ON c.kind = 'group' AND c.first_id = g.id
            WHERE c.source_id = ? AND g.inventory_id = ?
            ORDER BY g.id
            "#,
        )
        .bind(source_id)
        .bind(self.inventory_id)
        .fetch_all(&mut **tx)
        .await?;
        rows.into_iter().map(GroupRecord::try_from).collect()
    }

    async fn owned_edges(&self, source_id: i64) -> Result<Vec<Edge>, DbError> {
        let mut tx = self.tx.lock().await;
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT kind, first_id, second_id
            FROM ownership_claims
            WHERE source_id = ? AND inventory_id = ? AND kind IN ('group_child', 'group_host')
            ORDER BY kind, first_id, second_id
            "#,
        )
        .bind(source_id)
        .bind(self.inventory_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(kind, first, second)| match Claim::from_db_parts(&kind, first, second) {
                Some(Claim::Edge(edge)) => Some(edge),
                _ => None,
            })
            .collect())
    }

    async fn find_hosts_by_pks(&self, pks: &[i64]) -> Result<Vec<HostRecord>, DbError> {
        if pks.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM hosts WHERE inventory_id = ? AND id IN ({}) ORDER BY id",
            HOST_COLUMNS,
            placeholders(pks.len())
        );
        let mut query = sqlx::query_as::<_, HostRow>(&sql).bind(self.inventory_id);
        for pk in pks {
            query = query.bind(*pk);
        }
        let mut tx = self.tx.lock().await;
        let rows = query.fetch_all(&mut **tx).await?;
        rows.into_iter().map(HostRecord::try_from).collect()
    }

    async fn find_hosts_by_instance_ids(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<HostRecord>, DbError> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM hosts WHERE inventory_id = ? AND instance_id != '' AND instance_id IN ({}) ORDER BY id",
            HOST_COLUMNS,
            placeholders(instance_ids.len())
        );
        let mut query = sqlx::query_as::<_, HostRow>(&sql).bind(self.inventory_id);
        for id in instance_ids {
            query = query.bind(id.as_str());
        }
        let mut tx = self.tx.lock().await;
        let rows = query.fetch_all(&mut **tx).await?;
        rows.into_iter().map(HostRecord::try_from).collect()
    }

    async fn find_hosts_by_names(&self, names: &[String]) -> Result<Vec<HostRecord>, DbError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM hosts WHERE inventory_id = ? AND name IN ({}) ORDER BY id",
            HOST_COLUMNS,
            placeholders(names.len())
        );
        let mut query = sqlx::query_as::<_, HostRow>(&sql).bind(self.inventory_id);
        for name in names {
            query = query.bind(name.as_str());
        }
        let mut tx = self.tx.lock().await;
        let rows = query.fetch_all(&mut **tx).await?;
        rows.into_iter().map(HostRecord::try_from).collect()
    }

    async fn find_groups_by_names(&self, names: &[String]) -> Result<Vec<GroupRecord>, DbError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM inventory_groups WHERE inventory_id = ? AND name IN ({}) ORDER BY id",
            GROUP_COLUMNS,
            placeholders(names.len())
        );
        let mut query = sqlx::query_as::<_, GroupRow>(&sql).bind(self.inventory_id);
        for name in names {
            query = query.bind(name.as_str());
        }
        let mut tx = self.tx.lock().await;
        let rows = query.fetch_all(&mut **tx).await?;
        rows.into_iter().map(GroupRecord::try_from).collect()
    }

    async fn get_or_create_group(&self, group: &NewGroup) -> Result<(GroupRecord, bool), DbError> {
        if let Some(existing) = self.group_by_name(&group.name).await? {
            return Ok((existing, false));
        }
        let variables = serde_json::to_string(&group.variables)?;
        let id = {
            let mut tx = self.tx.lock().await;
            sqlx::query(
                "INSERT INTO inventory_groups (inventory_id, name, description, variables) VALUES (?, ?, ?, ?)",
            )
            .bind(self.inventory_id)
            .bind(&group.name)
            .bind(&group.description)
            .bind(&variables)
            .execute(&mut **tx)
            .await?
            .last_insert_rowid()
        };
        Ok((self.group_by_pk(id).await?, true))
    }

    async fn get_or_create_host(&self, host: &NewHost) -> Result<(HostRecord, bool), DbError> {
        if let Some(existing) = self.host_by_name(&host.name).await? {
            return Ok((existing, false));
        }
        let variables = serde_json::to_string(&host.variables)?;
        let id = {
            let mut tx = self.tx.lock().await;
            sqlx::query(
                r#"
                INSERT INTO hosts (inventory_id, name, description, variables, enabled, instance_id)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(self.inventory_id)
            .bind(&host.name)
            .bind(&host.description)
            .bind(&variables)
            .bind(host.enabled)
            .bind(host.instance_id.as_deref().unwrap_or(""))
            .execute(&mut **tx)
            .await?
            .last_insert_rowid()
        };
        Ok((self.host_by_pk(id).await?, true))
    }

    async fn update_group(&self, pk: i64, update: &GroupUpdate) -> Result<GroupRecord, DbError> {
        let mut group = self.group_by_pk(pk).await?;
        update.apply_to(&mut group);
        let variables = serde_json::to_string(&group.variables)?;
        let mut tx = self.tx.lock().await;
        sqlx::query(
            "UPDATE inventory_groups SET description = ?, variables = ? WHERE id = ? AND inventory_id = ?",
        )
        .bind(&group.description)
        .bind(&variables)
        .bind(pk)
        .bind(self.inventory_id)
        .execute(&mut **tx)
        .await?;
        Ok(group)
    }

    async fn update_host(&self, pk: i64, update: &HostUpdate) -> Result<HostRecord, DbError> {
        let mut host = self.host_by_pk(pk).await?;
        update.apply_to(&mut host);
        let variables = serde_json::to_string(&host.variables)?;
        let mut tx = self.tx.lock().await;
        sqlx::query(
            r#"
            UPDATE hosts
            SET name = ?, description = ?, variables = ?, enabled = ?, instance_id = ?
            WHERE id = ? AND inventory_id = ?
            "#,
        )
        .bind(&host.name)
        .bind(&host.description)
        .bind(&variables)
        .bind(host.enabled)
        .bind(host.instance_id.as_deref().unwrap_or(""))
        .bind(pk)
        .bind(self.inventory_id)
        .execute(&mut **tx)
        .await?;
        Ok(host)
    }

    async fn delete_hosts(&self, pks: &[i64]) -> Result<usize, DbError> {
        let mut tx = self.tx.lock().await;
        let mut deleted = 0;
        for pk in pks {
            sqlx::query(
                r#"
                DELETE FROM ownership_claims
                WHERE inventory_id = ?
                  AND ((kind = 'host' AND first_id = ?) OR (kind = 'group_host' AND second_id = ?))
                "#,
            )
            .bind(self.inventory_id)
            .bind(*pk)
            .bind(*pk)
            .execute(&mut **tx)
            .await?;
            let result = sqlx::query("DELETE FROM hosts WHERE id = ? AND inventory_id = ?")
                .bind(*pk)
                .bind(self.inventory_id)
                .execute(&mut **tx)
                .await?;
            if result.rows_affected() > 0 {
                debug!(pk = *pk, "Host row deleted");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_groups(&self, pks: &[i64]) -> Result<usize, DbError> {
        let mut tx = self.tx.lock().await;
        let mut deleted = 0;
        for pk in pks {
            sqlx::query(
                r#"
                DELETE FROM ownership_claims
                WHERE inventory_id = ?
                  AND ((kind IN ('group', 'group_host') AND first_id = ?)
                       OR (kind = 'group_child' AND (first_id = ? OR second_id = ?)))
                "#,
            )
            .bind(self.inventory_id)
            .bind(*pk)
            .bind(*pk)
            .bind(*pk)
            .execute(&mut **tx)
            .await?;
            let result = sqlx::query("DELETE FROM inventory_groups WHERE id = ? AND inventory_id = ?")
                .bind(*pk)
                .bind(self.inventory_id)
                .execute(&mut **tx)
                .await?;
            if result.rows_affected() > 0 {
                debug!(pk = *pk, "Group row deleted");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn edges_from(&self, groups: &[i64]) -> Result<Vec<Edge>, DbError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let marks = placeholders(groups.len());
        let children_sql = format!(
            "SELECT parent_id, child_id FROM group_children WHERE parent_id IN ({})",
            marks
        );
        let hosts_sql = format!(
            "SELECT group_id, host_id FROM group_hosts WHERE group_id IN ({})",
            marks
        );

        let mut children = sqlx::query_as::<_, (i64, i64)>(&children_sql);
        let mut hosts = sqlx::query_as::<_, (i64, i64)>(&hosts_sql);
        for group in groups {
            children = children.bind(*group);
            hosts = hosts.bind(*group);
        }

        let mut tx = self.tx.lock().await;
        let mut edges: Vec<Edge> = children
            .fetch_all(&mut **tx)
            .await?
            .into_iter()
            .map(|(parent, child)| Edge::GroupChild { parent, child })
            .collect();
        edges.extend(
            hosts
                .fetch_all(&mut **tx)
                .await?
                .into_iter()
                .map(|(group, host)| Edge::GroupHost { group, host }),
        );
        Ok(edges)
    }

    async fn existing_edges(&self, edges: &[Edge]) -> Result<Vec<Edge>, DbError> {
        let mut children = Vec::new();
        let mut members = Vec::new();
        for edge in edges {
            match *edge {
                Edge::GroupChild { parent, child } => children.push((parent, child)),
                Edge::GroupHost { group, host } => members.push((group, host)),
            }
        }

        let lookups: [(&str, &[(i64, i64)], fn(i64, i64) -> Edge); 2] = [
            (
                "SELECT parent_id, child_id FROM group_children WHERE (parent_id, child_id)",
                &children,
                |parent, child| Edge::GroupChild { parent, child },
            ),
            (
                "SELECT group_id, host_id FROM group_hosts WHERE (group_id, host_id)",
                &members,
                |group, host| Edge::GroupHost { group, host },
            ),
        ];

        let mut tx = self.tx.lock().await;
        let mut found = Vec::new();
        for (select, pairs, edge) in lookups {
            if pairs.is_empty() {
                continue;
            }
            let sql = format!(
                "{} IN (VALUES {})",
                select,
                vec!["(?, ?)"; pairs.len()].join(", ")
            );
            let mut query = sqlx::query_as::<_, (i64, i64)>(&sql);
            for (first, second) in pairs {
                query = query.bind(*first).bind(*second);
            }
            let rows = query.fetch_all(&mut **tx).await?;
            found.extend(rows.into_iter().map(|(first, second)| edge(first, second)));
        }
        Ok(found)
    }

    async fn add_edge(&self, edge: Edge) -> Result<bool, DbError> {
        let (sql, first, second) = match edge {
            Edge::GroupChild { parent, child } => (
                "INSERT OR IGNORE INTO group_children (parent_id, child_id) VALUES (?, ?)",
                parent,
                child,
            ),
            Edge::GroupHost { group, host } => (
                "INSERT OR IGNORE INTO group_hosts (group_id, host_id) VALUES (?, ?)",
                group,
                host,
            ),
        };
        let mut tx = self.tx.lock().await;
        let result = sqlx::query(sql)
            .bind(first)
            .bind(second)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_edge(&self, edge: Edge) -> Result<bool, DbError> {
        let (kind, first, second) = Claim::Edge(edge).as_db_parts();
        let sql = match edge {
            Edge::GroupChild { .. } => "DELETE FROM group_children WHERE parent_id = ? AND child_id = ?",
            Edge::GroupHost { .. } => "DELETE FROM group_hosts WHERE group_id = ? AND host_id = ?",
        };
        let mut tx = self.tx.lock().await;
        sqlx::query(
            "DELETE FROM ownership_claims WHERE inventory_id = ? AND kind = ? AND first_id = ? AND second_id = ?",
        )
        .bind(self.inventory_id)
        .bind(kind)
        .bind(first)
        .bind(second)
        .execute(&mut **tx)
        .await?;
        let result = sqlx::query(sql)
            .bind(first)
            .bind(second)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_ownership(&self, source_id: i64, claims: &[Claim]) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        for claim in claims {
            let (kind, first, second) = claim.as_db_parts();
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO ownership_claims (source_id, inventory_id, kind, first_id, second_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(source_id)
            .bind(self.inventory_id)
            .bind(kind)
            .bind(first)
            .bind(second)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn release_ownership(&self, source_id: i64, claims: &[Claim]) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        for claim in claims {
            let (kind, first, second) = claim.as_db_parts();
            sqlx::query(
                r#"
                DELETE FROM ownership_claims
                WHERE source_id = ? AND kind = ? AND first_id = ? AND second_id = ?
                "#,
            )
            .bind(source_id)
            .bind(kind)
            .bind(first)
            .bind(second)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn claimed_by_others(
        &self,
        source_id: i64,
        claims: &[Claim],
    ) -> Result<Vec<Claim>, DbError> {
        let mut tx = self.tx.lock().await;
        let mut shared = Vec::new();
        for claim in claims {
            let (kind, first, second) = claim.as_db_parts();
            let other: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM ownership_claims
                    WHERE inventory_id = ? AND kind = ? AND first_id = ? AND second_id = ?
                      AND source_id != ?
                )
                "#,
            )
            .bind(self.inventory_id)
            .bind(kind)
            .bind(first)
            .bind(second)
            .bind(source_id)
            .fetch_one(&mut **tx)
            .await?;
            if other {
                shared.push(*claim);
            }
        }
        Ok(shared)
    }

    async fn edges_claimed_by_others(
        &self,
        source_id: i64,
        hosts: &[i64],
        groups: &[i64],
    ) -> Result<Vec<Edge>, DbError> {
        let mut touches = Vec::new();
        if !hosts.is_empty() {
            touches.push(format!(
                "(kind = 'group_host' AND second_id IN ({}))",
                placeholders(hosts.len())
            ));
        }
        if !groups.is_empty() {
            let list = placeholders(groups.len());
            touches.push(format!(
                "(kind IN ('group_child', 'group_host') AND first_id IN ({}))",
                list
            ));
            touches.push(format!("(kind = 'group_child' AND second_id IN ({}))", list));
        }
        if touches.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT kind, first_id, second_id FROM ownership_claims \
             WHERE inventory_id = ? AND source_id != ? AND ({}) \
             ORDER BY kind, first_id, second_id",
            touches.join(" OR ")
        );

        let mut query = sqlx::query_as::<_, (String, i64, i64)>(&sql)
            .bind(self.inventory_id)
            .bind(source_id);
        for pk in hosts {
            query = query.bind(*pk);
        }
        for _ in 0..2 {
            for pk in groups {
                query = query.bind(*pk);
            }
        }
        let mut tx = self.tx.lock().await;
        let rows = query.fetch_all(&mut **tx).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(kind, first, second)| match Claim::from_db_parts(&kind, first, second) {
                Some(Claim::Edge(edge)) => Some(edge),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl InventoryTransaction for SqliteInventoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let inventory_id = self.inventory_id;
        self.tx
            .into_inner()
            .commit()
            .await?;
        debug!(inventory_id, "Committed inventory transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        let inventory_id = self.inventory_id;
        self.tx
            .into_inner()
            .rollback()
            .await?;
        debug!(inventory_id, "Rolled back inventory transaction");
        Ok(())
    }
}

// Helper structs for SQLx row mapping

#[derive(sqlx::FromRow)]
struct InventoryRow {
    id: i64,
    name: String,
    organization_id: Option<i64>,
    variables: String,
}

impl TryFrom<InventoryRow> for InventoryRecord {
    type Error = DbError;

    fn try_from(row: InventoryRow) -> Result<Self, Self::Error> {
        Ok(InventoryRecord {
            id: row.id,
            name: row.name,
            organization_id: row.organization_id,
            variables: serde_json::from_str(&row.variables)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HostRow {
    id: i64,
    inventory_id: i64,
    name: String,
    description: String,
    variables: String,
    enabled: bool,
    instance_id: String,
}

impl TryFrom<HostRow> for HostRecord {
    type Error = DbError;

    fn try_from(row: HostRow) -> Result<Self, Self::Error> {
        Ok(HostRecord {
            id: row.id,
            inventory_id: row.inventory_id,
            name: row.name,
            description: row.description,
            variables: serde_json::from_str(&row.variables)?,
            enabled: row.enabled,
            instance_id: (!row.instance_id.is_empty()).then_some(row.instance_id),
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: i64,
    inventory_id: i64,
    name: String,
    description: String,
    variables: String,
}

impl TryFrom<GroupRow> for GroupRecord {
    type Error = DbError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        Ok(GroupRecord {
            id: row.id,
            inventory_id: row.inventory_id,
            name: row.name,
            description: row.description,
            variables: serde_json::from_str(&row.variables)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    inventory_id: i64,
    source_id: i64,
    status: String,
    failure: Option<String>,
    license_error: bool,
    org_host_limit_error: bool,
    detail: Option<String>,
    summary: Option<String>,
    started_at: String,
    finished_at: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = DbError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = RunStatus::from_db_str(&row.status)
            .ok_or_else(|| DbError::Decode(format!("Unknown run status: {}", row.status)))?;
        let failure = row
            .failure
            .map(|f| {
                FailureKind::from_db_str(&f)
                    .ok_or_else(|| DbError::Decode(format!("Unknown failure kind: {}", f)))
            })
            .transpose()?;

        Ok(RunRecord {
            run_id: Uuid::parse_str(&row.run_id).map_err(|e| DbError::Decode(e.to_string()))?,
            inventory_id: row.inventory_id,
            source_id: row.source_id,
            status,
            failure,
            license_error: row.license_error,
            org_host_limit_error: row.org_host_limit_error,
            detail: row.detail,
            summary: row.summary.map(|s| serde_json::from_str(&s)).transpose()?,
            started_at: parse_timestamp(&row.started_at)?,
            finished_at: parse_timestamp(&row.finished_at)?,
        })
    }
}
