//! Group-to-group and group-to-host relationships.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::batch::ClaimBatch;
use super::ImportSummary;
use crate::db::{Claim, DbError, Edge, InventoryRepository};
use crate::graph::{GroupId, HostId, InventoryGraph};

/// Relationships of one graph group whose rows are known, with the member's
/// name for logging. Root-level membership is not persisted.
pub(crate) fn edges_of<'g>(
    graph: &'g InventoryGraph,
    group: GroupId,
    group_pks: &HashMap<GroupId, i64>,
    host_pks: &HashMap<HostId, i64>,
) -> Vec<(Edge, &'g str)> {
    let Some(parent) = group_pks.get(&group).copied() else {
        return Vec::new();
    };
    let node = graph.group(group);
    let children = node.children().filter_map(|child| {
        group_pks.get(&child).map(|pk| {
            (
                Edge::GroupChild { parent, child: *pk },
                graph.group(child).name(),
            )
        })
    });
    let hosts = node.hosts().filter_map(|host| {
        host_pks
            .get(&host)
            .map(|pk| (Edge::GroupHost { group: parent, host: *pk }, graph.host(host).name()))
    });
    children.chain(hosts).collect()
}

/// Every relationship the graph implies between known rows.
pub(crate) fn desired_edges(
    graph: &InventoryGraph,
    group_pks: &HashMap<GroupId, i64>,
    host_pks: &HashMap<HostId, i64>,
) -> HashSet<Edge> {
    graph
        .groups()
        .flat_map(|(id, _)| edges_of(graph, id, group_pks, host_pks))
        .map(|(edge, _)| edge)
        .collect()
}

/// Phase 6: adds relationships present in the graph but not persisted, and
/// claims every relationship the graph implies. Existence is checked for at
/// most `batch_size` relationships at a time.
pub(crate) async fn materialize_edges<R>(
    graph: &InventoryGraph,
    group_pks: &HashMap<GroupId, i64>,
    host_pks: &HashMap<HostId, i64>,
    repo: &R,
    source_id: i64,
    batch_size: usize,
    summary: &mut ImportSummary,
) -> Result<(), DbError>
where
    R: InventoryRepository + ?Sized,
{
    let wanted: Vec<(Edge, &str, &str)> = graph
        .groups()
        .flat_map(|(id, _)| {
            let parent_name = graph.group(id).name();
            edges_of(graph, id, group_pks, host_pks)
                .into_iter()
                .map(move |(edge, member)| (edge, parent_name, member))
        })
        .collect();
    let mut claims = ClaimBatch::new(source_id, batch_size);
    let mut added = 0u64;

    for chunk in wanted.chunks(batch_size.max(1)) {
        let edges: Vec<Edge> = chunk.iter().map(|(edge, _, _)| *edge).collect();
        let existing: HashSet<Edge> = repo.existing_edges(&edges).await?.into_iter().collect();

        for (edge, parent_name, member) in chunk {
            if !existing.contains(edge) && repo.add_edge(*edge).await? {
                added += 1;
                match edge {
                    Edge::GroupChild { .. } => {
                        debug!(group = %parent_name, child = %member, "Group added as child")
                    }
                    Edge::GroupHost { .. } => {
                        debug!(group = %parent_name, host = %member, "Host added to group")
                    }
                }
            }
            claims.push(repo, Claim::Edge(*edge)).await?;
        }
    }

    let claimed = claims.finish(repo).await?;
    summary.edges_added += added;
    info!(added, claimed, "Relationships materialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_skip_unknown_rows() {
        let mut graph = InventoryGraph::new();
        let web = graph.get_or_create_group("web", None).unwrap();
        let east = graph.get_or_create_group("east", Some(web)).unwrap();
        let h1 = graph.get_or_create_host("h1").unwrap();
        let h2 = graph.get_or_create_host("h2").unwrap();
        graph.add_host(web, h1);
        graph.add_host(web, h2);

        let group_pks = HashMap::from([(web, 1), (east, 2)]);
        let host_pks = HashMap::from([(h1, 10)]);
        let edges = desired_edges(&graph, &group_pks, &host_pks);

        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&Edge::GroupChild {
            parent: 1,
            child: 2
        }));
        assert!(edges.contains(&Edge::GroupHost { group: 1, host: 10 }));
    }
}
