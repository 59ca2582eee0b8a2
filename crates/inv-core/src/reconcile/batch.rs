//! Chunking helpers that bound the size of any single set operation.

use crate::db::{Claim, DbError, InventoryRepository};

/// Ownership claims buffered until `batch_size` of them are pending.
pub(crate) struct ClaimBatch {
    source_id: i64,
    batch_size: usize,
    pending: Vec<Claim>,
    flushed: usize,
}

impl ClaimBatch {
    pub(crate) fn new(source_id: i64, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            source_id,
            batch_size,
            pending: Vec::with_capacity(batch_size.min(1024)),
            flushed: 0,
        }
    }

    pub(crate) async fn push<R>(&mut self, repo: &R, claim: Claim) -> Result<(), DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        self.pending.push(claim);
        if self.pending.len() >= self.batch_size {
            self.flush(repo).await?;
        }
        Ok(())
    }

    pub(crate) async fn flush<R>(&mut self, repo: &R) -> Result<(), DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        if self.pending.is_empty() {
            return Ok(());
        }
        repo.claim_ownership(self.source_id, &self.pending).await?;
        self.flushed += self.pending.len();
        self.pending.clear();
        Ok(())
    }

    /// Flushes what is left and returns the total number of claims written.
    pub(crate) async fn finish<R>(mut self, repo: &R) -> Result<usize, DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        self.flush(repo).await?;
        Ok(self.flushed)
    }
}

/// Splits `claims` into those held only by `source_id` and those another
/// source also holds, querying in chunks.
pub(crate) async fn partition_shared<R>(
    repo: &R,
    source_id: i64,
    claims: &[Claim],
    batch_size: usize,
) -> Result<(Vec<Claim>, Vec<Claim>), DbError>
where
    R: InventoryRepository + ?Sized,
{
    let mut exclusive = Vec::new();
    let mut shared = Vec::new();
    for chunk in claims.chunks(batch_size.max(1)) {
        let others = repo.claimed_by_others(source_id, chunk).await?;
        for claim in chunk {
            if others.contains(claim) {
                shared.push(*claim);
            } else {
                exclusive.push(*claim);
            }
        }
    }
    Ok((exclusive, shared))
}

/// Moves every host or group row in `exclusive` that another source still
/// links to over to `shared`. Returns the rows left to delete.
pub(crate) async fn keep_linked_rows<R>(
    repo: &R,
    source_id: i64,
    exclusive: Vec<Claim>,
    shared: &mut Vec<Claim>,
    batch_size: usize,
) -> Result<Vec<Claim>, DbError>
where
    R: InventoryRepository + ?Sized,
{
    let mut deletable = Vec::with_capacity(exclusive.len());
    for chunk in exclusive.chunks(batch_size.max(1)) {
        let mut hosts = Vec::new();
        let mut groups = Vec::new();
        for claim in chunk {
            match claim {
                Claim::Host(pk) => hosts.push(*pk),
                Claim::Group(pk) => groups.push(*pk),
                Claim::Edge(_) => {}
            }
        }
        let linked = repo
            .edges_claimed_by_others(source_id, &hosts, &groups)
            .await?;
        for claim in chunk {
            let still_linked = linked.iter().any(|edge| match claim {
                Claim::Host(pk) => Claim::Edge(*edge).involves_host(*pk),
                Claim::Group(pk) => Claim::Edge(*edge).involves_group(*pk),
                Claim::Edge(_) => false,
            });
            if still_linked {
                shared.push(*claim);
            } else {
                deletable.push(*claim);
            }
        }
    }
    Ok(deletable)
}
