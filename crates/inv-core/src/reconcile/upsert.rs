//! Phases 3 to 5: inventory variables, groups and hosts.

use std::collections::HashMap;
use tracing::{debug, info};

use super::batch::ClaimBatch;
use super::matcher::Matches;
use super::{merge_variables, split_description, ImportSummary, ReconcileOptions};
use crate::db::{
    Claim, DbError, GroupUpdate, HostRecord, HostUpdate, InventoryRepository, NewGroup, NewHost,
    DEFAULT_DESCRIPTION,
};
use crate::graph::{GroupId, Host, HostId, InventoryGraph};

/// Phase 3: merges the root group's variables onto the inventory. Returns
/// `true` if the inventory was written.
pub(crate) async fn merge_root_variables<R>(
    graph: &InventoryGraph,
    repo: &R,
    overwrite_vars: bool,
) -> Result<bool, DbError>
where
    R: InventoryRepository + ?Sized,
{
    let inventory = repo.inventory().await?;
    let root = graph.group(graph.root()).variables();
    let merged = merge_variables(&inventory.variables, root, overwrite_vars);
    if merged == inventory.variables {
        debug!(inventory = %inventory.name, "Inventory variables unchanged");
        return Ok(false);
    }
    repo.update_inventory_variables(&merged).await?;
    info!(inventory = %inventory.name, "Inventory variables updated");
    Ok(true)
}

/// The description to write over `current`, if any. Without a description
/// variable the row keeps its description, or falls back to the default when
/// the source owns the whole row.
fn description_change(found: Option<String>, current: &str, overwrite: bool) -> Option<String> {
    let wanted = found.or_else(|| overwrite.then(|| DEFAULT_DESCRIPTION.to_string()))?;
    (wanted != current).then_some(wanted)
}

/// Phase 4: updates matched groups, creates the rest and claims them all.
pub(crate) async fn upsert_groups<R>(
    graph: &InventoryGraph,
    matches: &Matches,
    repo: &R,
    source_id: i64,
    options: &ReconcileOptions,
    summary: &mut ImportSummary,
) -> Result<HashMap<GroupId, i64>, DbError>
where
    R: InventoryRepository + ?Sized,
{
    let mut pks = HashMap::with_capacity(graph.group_count());
    let mut claims = ClaimBatch::new(source_id, options.batch_size);

    for (id, group) in graph.groups() {
        let (variables, description) = split_description(group.variables());
        let pk = match matches.groups.get(&id) {
            Some(row) => {
                let mut update = GroupUpdate::default();
                let merged = merge_variables(&row.variables, &variables, options.overwrite_vars);
                if merged != row.variables {
                    update.variables = Some(merged);
                }
                update.description =
                    description_change(description, &row.description, options.overwrite);
                if !update.is_empty() {
                    repo.update_group(row.id, &update).await?;
                    summary.groups_updated += 1;
                    debug!(group = %group.name(), "Group updated");
                }
                row.id
            }
            None => {
                let new = NewGroup {
                    name: group.name().to_string(),
                    description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
                    variables,
                };
                let (row, created) = repo.get_or_create_group(&new).await?;
                if created {
                    summary.groups_created += 1;
                    debug!(group = %group.name(), "Group added");
                }
                row.id
            }
        };
        pks.insert(id, pk);
        claims.push(repo, Claim::Group(pk)).await?;
    }

    claims.finish(repo).await?;
    info!(
        created = summary.groups_created,
        updated = summary.groups_updated,
        "Groups upserted"
    );
    Ok(pks)
}

/// Field-level changes that bring `row` in line with `host`.
fn host_update(row: &HostRecord, host: &Host, options: &ReconcileOptions) -> HostUpdate {
    let (variables, description) = split_description(host.variables());
    let mut update = HostUpdate::default();

    let merged = merge_variables(&row.variables, &variables, options.overwrite_vars);
    if merged != row.variables {
        update.variables = Some(merged);
    }
    update.enabled = options
        .identity
        .enabled(host.variables())
        .filter(|enabled| *enabled != row.enabled);
    if host.name() != row.name {
        update.name = Some(host.name().to_string());
    }
    if let Some(instance_id) = host.instance_id() {
        if row.instance_id.as_deref() != Some(instance_id) {
            update.instance_id = Some(instance_id.to_string());
        }
    }
    update.description = description_change(description, &row.description, options.overwrite);
    update
}

async fn update_host_row<R>(
    repo: &R,
    row: &HostRecord,
    host: &Host,
    options: &ReconcileOptions,
) -> Result<bool, DbError>
where
    R: InventoryRepository + ?Sized,
{
    let update = host_update(row, host, options);
    if update.is_empty() {
        return Ok(false);
    }
    repo.update_host(row.id, &update).await?;
    if update.name.is_some() {
        debug!(from = %row.name, to = %host.name(), "Host renamed");
    }
    debug!(host = %host.name(), fields = ?update.changed_fields(), "Host updated");
    Ok(true)
}

/// Phase 5: updates matched hosts, creates the rest and claims them all.
///
/// Matched rows are written first so a rename frees its old name before a
/// new row may take it.
pub(crate) async fn upsert_hosts<R>(
    graph: &InventoryGraph,
    matches: &Matches,
    repo: &R,
    source_id: i64,
    options: &ReconcileOptions,
    summary: &mut ImportSummary,
) -> Result<HashMap<HostId, i64>, DbError>
where
    R: InventoryRepository + ?Sized,
{
    let mut pks = HashMap::with_capacity(graph.host_count());
    let mut claims = ClaimBatch::new(source_id, options.batch_size);

    for (id, host) in graph.hosts() {
        let Some(row) = matches.hosts.get(&id) else {
            continue;
        };
        if update_host_row(repo, row, host, options).await? {
            summary.hosts_updated += 1;
        }
        pks.insert(id, row.id);
        claims.push(repo, Claim::Host(row.id)).await?;
    }

    for (id, host) in graph.hosts() {
        if matches.hosts.contains_key(&id) {
            continue;
        }
        let (variables, description) = split_description(host.variables());
        let new = NewHost {
            name: host.name().to_string(),
            description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            variables,
            enabled: options.identity.enabled(host.variables()).unwrap_or(true),
            instance_id: host.instance_id().map(str::to_string),
        };
        let (row, created) = repo.get_or_create_host(&new).await?;
        if created {
            summary.hosts_created += 1;
            debug!(host = %host.name(), "Host added");
        } else if update_host_row(repo, &row, host, options).await? {
            summary.hosts_updated += 1;
        }
        pks.insert(id, row.id);
        claims.push(repo, Claim::Host(row.id)).await?;
    }

    claims.finish(repo).await?;
    info!(
        created = summary.hosts_created,
        updated = summary.hosts_updated,
        "Hosts upserted"
    );
    Ok(pks)
}
