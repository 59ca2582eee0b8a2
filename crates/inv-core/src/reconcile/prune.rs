//! Phase 2: removal of rows and relationships the source no longer reports.
//!
//! Only what this source claims is considered. Anything another source also
//! claims, and any row carrying a relationship another source claims, stays
//! in place and just loses this source's claim.

use std::collections::HashMap;
use tracing::{debug, info};

use super::batch::{keep_linked_rows, partition_shared};
use super::matcher::Matches;
use super::relations::desired_edges;
use super::ImportSummary;
use crate::db::{Claim, DbError, InventoryRepository};
use crate::graph::{GroupId, HostId, InventoryGraph};

pub(crate) async fn delete_stale<R>(
    graph: &InventoryGraph,
    matches: &Matches,
    repo: &R,
    source_id: i64,
    batch_size: usize,
    summary: &mut ImportSummary,
) -> Result<(), DbError>
where
    R: InventoryRepository + ?Sized,
{
    delete_stale_hosts(matches, repo, source_id, batch_size, summary).await?;
    delete_stale_groups(matches, repo, source_id, batch_size, summary).await?;
    remove_stale_edges(graph, matches, repo, source_id, batch_size, summary).await?;
    Ok(())
}

async fn release<R>(
    repo: &R,
    source_id: i64,
    shared: &[Claim],
    batch_size: usize,
    summary: &mut ImportSummary,
) -> Result<(), DbError>
where
    R: InventoryRepository + ?Sized,
{
    for chunk in shared.chunks(batch_size) {
        repo.release_ownership(source_id, chunk).await?;
    }
    summary.claims_released += shared.len() as u64;
    Ok(())
}

async fn delete_stale_hosts<R>(
    matches: &Matches,
    repo: &R,
    source_id: i64,
    batch_size: usize,
    summary: &mut ImportSummary,
) -> Result<(), DbError>
where
    R: InventoryRepository + ?Sized,
{
    let referenced = matches.host_pks();
    let stale: HashMap<i64, String> = repo
        .owned_hosts(source_id)
        .await?
        .into_iter()
        .filter(|row| !referenced.contains(&row.id))
        .map(|row| (row.id, row.name))
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    let mut claims: Vec<Claim> = stale.keys().map(|pk| Claim::Host(*pk)).collect();
    claims.sort();
    let (exclusive, mut shared) = partition_shared(repo, source_id, &claims, batch_size).await?;
    let exclusive = keep_linked_rows(repo, source_id, exclusive, &mut shared, batch_size).await?;
    release(repo, source_id, &shared, batch_size, summary).await?;

    let pks: Vec<i64> = exclusive
        .iter()
        .filter_map(|claim| match claim {
            Claim::Host(pk) => Some(*pk),
            _ => None,
        })
        .collect();
    let mut deleted = 0;
    for chunk in pks.chunks(batch_size) {
        for pk in chunk {
            if let Some(name) = stale.get(pk) {
                debug!(host = %name, "Deleting host");
            }
        }
        deleted += repo.delete_hosts(chunk).await?;
    }
    summary.hosts_deleted += deleted as u64;
    info!(deleted, kept_shared = shared.len(), "Stale hosts removed");
    Ok(())
}

async fn delete_stale_groups<R>(
    matches: &Matches,
    repo: &R,
    source_id: i64,
    batch_size: usize,
    summary: &mut ImportSummary,
) -> Result<(), DbError>
where
    R: InventoryRepository + ?Sized,
{
    let referenced = matches.group_pks();
    let stale: HashMap<i64, String> = repo
        .owned_groups(source_id)
        .await?
        .into_iter()
        .filter(|row| !referenced.contains(&row.id))
        .map(|row| (row.id, row.name))
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    let mut claims: Vec<Claim> = stale.keys().map(|pk| Claim::Group(*pk)).collect();
    claims.sort();
    let (exclusive, mut shared) = partition_shared(repo, source_id, &claims, batch_size).await?;
    let exclusive = keep_linked_rows(repo, source_id, exclusive, &mut shared, batch_size).await?;
    release(repo, source_id, &shared, batch_size, summary).await?;

    let pks: Vec<i64> = exclusive
        .iter()
        .filter_map(|claim| match claim {
            Claim::Group(pk) => Some(*pk),
            _ => None,
        })
        .collect();
    let mut deleted = 0;
    for chunk in pks.chunks(batch_size) {
        for pk in chunk {
            if let Some(name) = stale.get(pk) {
                debug!(group = %name, "Deleting group");
            }
        }
        deleted += repo.delete_groups(chunk).await?;
    }
    summary.groups_deleted += deleted as u64;
    info!(deleted, kept_shared = shared.len(), "Stale groups removed");
    Ok(())
}

async fn remove_stale_edges<R>(
    graph: &InventoryGraph,
    matches: &Matches,
    repo: &R,
    source_id: i64,
    batch_size: usize,
    summary: &mut ImportSummary,
) -> Result<(), DbError>
where
    R: InventoryRepository + ?Sized,
{
    let group_pks: HashMap<GroupId, i64> =
        matches.groups.iter().map(|(id, row)| (*id, row.id)).collect();
    let host_pks: HashMap<HostId, i64> =
        matches.hosts.iter().map(|(id, row)| (*id, row.id)).collect();
    let desired = desired_edges(graph, &group_pks, &host_pks);

    let mut stale: Vec<Claim> = repo
        .owned_edges(source_id)
        .await?
        .into_iter()
        .filter(|edge| !desired.contains(edge))
        .map(Claim::Edge)
        .collect();
    if stale.is_empty() {
        return Ok(());
    }
    stale.sort();

    let (exclusive, shared) = partition_shared(repo, source_id, &stale, batch_size).await?;
    release(repo, source_id, &shared, batch_size, summary).await?;

    let mut removed = 0u64;
    for claim in exclusive {
        if let Claim::Edge(edge) = claim {
            if repo.remove_edge(edge).await? {
                debug!(edge = ?edge, "Relationship removed");
                removed += 1;
            }
        }
    }
    summary.edges_removed += removed;
    info!(removed, kept_shared = shared.len(), "Stale relationships removed");
    Ok(())
}
