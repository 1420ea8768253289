//! Destination-side chunk replication: fetch a cover of the chunk from the
//! source servers named by the master, reconstruct the logical blocks, and
//! assemble the part image this chunkserver was told to create.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use wire_proto::{ChunkPartType, ChunkTypeWithAddress};

use crate::part::{block_at_stripe, blocks_in_part, is_parity};
use crate::plan::{execute_post_process, MultiVariantReadPlanner};
use crate::{
    block_xor, ChunkIoError, ChunkIoResult, ChunkserverStats, BLOCKS_IN_CHUNK, BLOCK_SIZE,
};

/// Fetches a byte range of one chunk part from a remote chunkserver.
#[async_trait]
pub trait PartRangeSource: Send + Sync {
    async fn read_part_range(
        &self,
        source: &ChunkTypeWithAddress,
        chunk_id: u64,
        version: u32,
        offset: u32,
        size: u32,
    ) -> ChunkIoResult<Vec<u8>>;
}

pub struct ChunkReplicator {
    stats: Arc<ChunkserverStats>,
    replicated: AtomicU32,
}

impl ChunkReplicator {
    pub fn new(stats: Arc<ChunkserverStats>) -> Self {
        Self {
            stats,
            replicated: AtomicU32::new(0),
        }
    }

    pub fn replication_count(&self) -> u32 {
        self.replicated.load(Ordering::Relaxed)
    }

    /// Replicate `target_part` of the chunk, reading from `sources`. A
    /// failing source gets avoided and the read is replanned; the operation
    /// succeeds iff some cover can still be completed.
    pub async fn replicate(
        &self,
        chunk_id: u64,
        version: u32,
        target_part: ChunkPartType,
        chunk_blocks: u32,
        sources: &[ChunkTypeWithAddress],
        reader: &dyn PartRangeSource,
    ) -> ChunkIoResult<Vec<u8>> {
        if chunk_blocks == 0 || chunk_blocks > BLOCKS_IN_CHUNK {
            return Err(ChunkIoError::InvalidParam(format!(
                "chunk of {} blocks",
                chunk_blocks
            )));
        }
        let mut avoided: BTreeSet<ChunkPartType> = BTreeSet::new();
        for _attempt in 0..=sources.len() {
            match self
                .try_once(chunk_id, version, chunk_blocks, sources, &avoided, reader)
                .await
            {
                Ok(logical) => {
                    let image = assemble_part(&logical, target_part, chunk_blocks);
                    self.replicated.fetch_add(1, Ordering::Relaxed);
                    return Ok(image);
                }
                Err((Some(bad_part), err)) => {
                    warn!(
                        "replication source for part {} failed: {}; replanning",
                        bad_part, err
                    );
                    avoided.insert(bad_part);
                }
                Err((None, err)) => return Err(err),
            }
        }
        Err(ChunkIoError::Unrecoverable(
            "all replication sources exhausted".to_string(),
        ))
    }

    async fn try_once(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_blocks: u32,
        sources: &[ChunkTypeWithAddress],
        avoided: &BTreeSet<ChunkPartType>,
        reader: &dyn PartRangeSource,
    ) -> Result<Vec<u8>, (Option<ChunkPartType>, ChunkIoError)> {
        let usable: Vec<ChunkTypeWithAddress> = sources
            .iter()
            .copied()
            .filter(|source| !avoided.contains(&source.part_type))
            .collect();
        let available: Vec<ChunkPartType> = usable
            .iter()
            .map(|source| source.part_type)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut planner = MultiVariantReadPlanner::new();
        planner.set_scores(self.stats.part_scores(&usable));
        planner.prepare(&available);
        if !planner.is_reading_possible() {
            return Err((
                None,
                ChunkIoError::Unrecoverable("no remaining cover of the chunk".to_string()),
            ));
        }
        let plan = planner
            .build_plan_for(0, chunk_blocks)
            .map_err(|err| (None, err))?;

        let mut buffer = vec![0u8; plan.required_buffer_size as usize];
        let operations = plan
            .basic_read_operations
            .iter()
            .chain(plan.additional_read_operations.iter());
        for (&part, operation) in operations {
            let source = self
                .best_source_for(part, &usable)
                .ok_or((Some(part), ChunkIoError::NoSource(format!("part {}", part))))?;
            // Short chunks may not contain the whole requested range.
            let part_blocks = blocks_in_part(part, chunk_blocks);
            let part_size = part_blocks * BLOCK_SIZE;
            if operation.request_offset >= part_size {
                continue;
            }
            let size = operation.request_size.min(part_size - operation.request_offset);
            let data = reader
                .read_part_range(&source, chunk_id, version, operation.request_offset, size)
                .await
                .map_err(|err| {
                    self.stats.register_defect(source.address);
                    (Some(part), err)
                })?;
            for (i, &buffer_offset) in operation.buffer_offsets.iter().enumerate() {
                let src = i * BLOCK_SIZE as usize;
                if src >= data.len() {
                    break;
                }
                let end = (src + BLOCK_SIZE as usize).min(data.len());
                let dst = buffer_offset as usize;
                buffer[dst..dst + (end - src)].copy_from_slice(&data[src..end]);
            }
        }

        let post_process = plan
            .post_process_for_basic()
            .map_err(|err| (None, err))?;
        execute_post_process(&mut buffer, &post_process);
        buffer.truncate((chunk_blocks * BLOCK_SIZE) as usize);
        debug!(
            "replication read of chunk {:016x} completed ({} blocks)",
            chunk_id, chunk_blocks
        );
        Ok(buffer)
    }

    fn best_source_for(
        &self,
        part: ChunkPartType,
        sources: &[ChunkTypeWithAddress],
    ) -> Option<ChunkTypeWithAddress> {
        sources
            .iter()
            .copied()
            .filter(|source| source.part_type == part)
            .max_by(|a, b| {
                self.stats
                    .score(a.address)
                    .partial_cmp(&self.stats.score(b.address))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Cut (or compute) the image of `part` from contiguous logical bytes.
pub fn assemble_part(logical: &[u8], part: ChunkPartType, chunk_blocks: u32) -> Vec<u8> {
    let block = BLOCK_SIZE as usize;
    let part_blocks = blocks_in_part(part, chunk_blocks);
    let mut image = vec![0u8; part_blocks as usize * block];
    for stripe in 0..part_blocks {
        let offset = stripe as usize * block;
        match block_at_stripe(part, stripe) {
            Some(logical_block) => {
                let src = logical_block as usize * block;
                image[offset..offset + block].copy_from_slice(&logical[src..src + block]);
            }
            None => {
                // Parity stripe.
                let level = match part {
                    ChunkPartType::Xor { level, .. } => level as u32,
                    ChunkPartType::Standard => unreachable!(),
                };
                debug_assert!(is_parity(part));
                for piece in 0..level {
                    let logical_block = stripe * level + piece;
                    if logical_block >= chunk_blocks {
                        break;
                    }
                    let src = logical_block as usize * block;
                    block_xor(
                        &mut image[offset..offset + block],
                        &logical[src..src + block],
                    );
                }
            }
        }
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use wire_proto::NetworkAddress;

    const CHUNK_BLOCKS: u32 = 12;

    fn logical_chunk() -> Vec<u8> {
        let mut data = vec![0u8; (CHUNK_BLOCKS * BLOCK_SIZE) as usize];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((i / 13) % 251) as u8;
        }
        data
    }

    struct FakeSources {
        images: HashMap<ChunkPartType, Vec<u8>>,
        failing: Mutex<BTreeSet<ChunkPartType>>,
    }

    impl FakeSources {
        fn new(parts: &[ChunkPartType]) -> Self {
            let logical = logical_chunk();
            let mut images = HashMap::new();
            for &part in parts {
                images.insert(part, assemble_part(&logical, part, CHUNK_BLOCKS));
            }
            Self {
                images,
                failing: Mutex::new(BTreeSet::new()),
            }
        }

        fn locations(&self) -> Vec<ChunkTypeWithAddress> {
            let mut locations: Vec<ChunkTypeWithAddress> = self
                .images
                .keys()
                .map(|&part_type| ChunkTypeWithAddress {
                    address: NetworkAddress::new(7, 7),
                    part_type,
                    chunkserver_version: 1,
                })
                .collect();
            locations.sort_by_key(|l| l.part_type);
            locations
        }

        fn fail(&self, part: ChunkPartType) {
            self.failing.lock().unwrap().insert(part);
        }
    }

    #[async_trait]
    impl PartRangeSource for FakeSources {
        async fn read_part_range(
            &self,
            source: &ChunkTypeWithAddress,
            _chunk_id: u64,
            _version: u32,
            offset: u32,
            size: u32,
        ) -> ChunkIoResult<Vec<u8>> {
            if self.failing.lock().unwrap().contains(&source.part_type) {
                return Err(ChunkIoError::Connection("simulated failure".to_string()));
            }
            let image = &self.images[&source.part_type];
            let offset = offset as usize;
            let end = (offset + size as usize).min(image.len());
            Ok(image[offset..end].to_vec())
        }
    }

    fn xor(level: u8, piece: u8) -> ChunkPartType {
        ChunkPartType::Xor { level, piece }
    }

    #[tokio::test]
    async fn replicates_standard_part_from_xor_sources() {
        let parts = [xor(3, 1), xor(3, 2), xor(3, 3), xor(3, 4)];
        let sources = FakeSources::new(&parts);
        let replicator = ChunkReplicator::new(Arc::new(ChunkserverStats::default()));
        let image = replicator
            .replicate(
                9,
                1,
                ChunkPartType::Standard,
                CHUNK_BLOCKS,
                &sources.locations(),
                &sources,
            )
            .await
            .unwrap();
        assert_eq!(image, logical_chunk());
        assert_eq!(replicator.replication_count(), 1);
    }

    #[tokio::test]
    async fn replicates_parity_part() {
        let parts = [xor(2, 1), xor(2, 2)];
        let sources = FakeSources::new(&parts);
        let replicator = ChunkReplicator::new(Arc::new(ChunkserverStats::default()));
        let image = replicator
            .replicate(
                9,
                1,
                xor(2, 3),
                CHUNK_BLOCKS,
                &sources.locations(),
                &sources,
            )
            .await
            .unwrap();
        let expected = assemble_part(&logical_chunk(), xor(2, 3), CHUNK_BLOCKS);
        assert_eq!(image, expected);
    }

    #[tokio::test]
    async fn failing_source_triggers_replanning() {
        let parts = [xor(3, 1), xor(3, 2), xor(3, 3), xor(3, 4)];
        let sources = FakeSources::new(&parts);
        sources.fail(xor(3, 2));
        let replicator = ChunkReplicator::new(Arc::new(ChunkserverStats::default()));
        let image = replicator
            .replicate(
                9,
                1,
                ChunkPartType::Standard,
                CHUNK_BLOCKS,
                &sources.locations(),
                &sources,
            )
            .await
            .unwrap();
        assert_eq!(image, logical_chunk());
    }

    #[tokio::test]
    async fn too_many_failures_fail_the_replication() {
        let parts = [xor(3, 1), xor(3, 2), xor(3, 3), xor(3, 4)];
        let sources = FakeSources::new(&parts);
        sources.fail(xor(3, 2));
        sources.fail(xor(3, 4));
        let replicator = ChunkReplicator::new(Arc::new(ChunkserverStats::default()));
        let result = replicator
            .replicate(
                9,
                1,
                ChunkPartType::Standard,
                CHUNK_BLOCKS,
                &sources.locations(),
                &sources,
            )
            .await;
        assert!(result.is_err());
    }
}
