//! Read planning over replicated and XOR-striped chunk layouts.
//!
//! A plan lists the parallel fetches needed to cover a logical block range
//! and the block-wise copy/XOR steps that turn the fetched scratch buffer
//! into contiguous logical bytes. The multi-variant planner additionally
//! avoids the worst-scoring part and can read from all parts of a level at
//! once, finishing as soon as at most one part is still outstanding.

use std::collections::{BTreeMap, BTreeSet};

use wire_proto::ChunkPartType;

use crate::part::{block_at_stripe, blocks_in_part, is_parity, stripe_size};
use crate::{block_xor, ChunkIoError, ChunkIoResult, BLOCKS_IN_CHUNK, BLOCK_SIZE};

/// One contiguous fetch from one chunk part. `buffer_offsets[i]` is the
/// scratch-buffer byte offset where the i-th fetched block lands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOperation {
    pub request_offset: u32,
    pub request_size: u32,
    pub buffer_offsets: Vec<u32>,
}

impl ReadOperation {
    pub fn block_count(&self) -> u32 {
        self.request_size / BLOCK_SIZE
    }
}

/// A block-wise post-processing step: copy the block at `source_offset` to
/// `destination_offset` (skipped when equal), then XOR every block listed in
/// `xor_source_offsets` into the destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostProcessOperation {
    pub destination_offset: u32,
    pub source_offset: u32,
    pub xor_source_offsets: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadPlan {
    pub first_block: u32,
    pub block_count: u32,
    pub required_buffer_size: u32,
    pub basic_read_operations: BTreeMap<ChunkPartType, ReadOperation>,
    pub additional_read_operations: BTreeMap<ChunkPartType, ReadOperation>,
    /// Set for the read-from-all-XOR-parts variant: the plan is finished
    /// once at most one part is still outstanding.
    pub read_from_all: bool,
}

impl ReadPlan {
    fn new(first_block: u32, block_count: u32) -> Self {
        Self {
            first_block,
            block_count,
            required_buffer_size: block_count * BLOCK_SIZE,
            basic_read_operations: BTreeMap::new(),
            additional_read_operations: BTreeMap::new(),
            read_from_all: false,
        }
    }

    pub fn is_reading_finished(&self, unfinished: &BTreeSet<ChunkPartType>) -> bool {
        if self.read_from_all {
            unfinished.len() <= 1
        } else {
            unfinished.is_empty()
        }
    }

    pub fn all_parts(&self) -> BTreeSet<ChunkPartType> {
        self.basic_read_operations
            .keys()
            .chain(self.additional_read_operations.keys())
            .copied()
            .collect()
    }

    /// Post-processing for the case where every basic fetch succeeded.
    pub fn post_process_for_basic(&self) -> ChunkIoResult<Vec<PostProcessOperation>> {
        let layout = self.layout_after(|part| self.basic_read_operations.contains_key(&part));
        self.guess_post_process(layout)
    }

    /// Post-processing for the extended plan, given the set of parts whose
    /// fetches did not finish.
    pub fn post_process_for_extended(
        &self,
        unfinished: &BTreeSet<ChunkPartType>,
    ) -> ChunkIoResult<Vec<PostProcessOperation>> {
        if !self.is_reading_finished(unfinished) {
            return Err(ChunkIoError::Unrecoverable(format!(
                "{} parts still unfinished",
                unfinished.len()
            )));
        }
        let layout = self.layout_after(|part| !unfinished.contains(&part));
        self.guess_post_process(layout)
    }

    /// Which (part, stripe) landed at each block slot of the scratch buffer.
    fn layout_after<F: Fn(ChunkPartType) -> bool>(
        &self,
        finished: F,
    ) -> Vec<Option<(ChunkPartType, u32)>> {
        let blocks = (self.required_buffer_size / BLOCK_SIZE) as usize;
        let mut layout: Vec<Option<(ChunkPartType, u32)>> = vec![None; blocks];
        let operations = self
            .basic_read_operations
            .iter()
            .chain(self.additional_read_operations.iter());
        for (&part, operation) in operations {
            if !finished(part) {
                continue;
            }
            let first_stripe = operation.request_offset / BLOCK_SIZE;
            for (i, &buffer_offset) in operation.buffer_offsets.iter().enumerate() {
                layout[(buffer_offset / BLOCK_SIZE) as usize] =
                    Some((part, first_stripe + i as u32));
            }
        }
        layout
    }

    fn expected_block(&self, position: u32) -> (ChunkPartType, u32) {
        let block = self.first_block + position;
        let level = self
            .basic_read_operations
            .keys()
            .chain(self.additional_read_operations.keys())
            .find_map(|part| match part {
                ChunkPartType::Standard => None,
                ChunkPartType::Xor { level, .. } => Some(*level),
            });
        match level {
            None => (ChunkPartType::Standard, block),
            Some(level) => {
                let piece = 1 + (block % level as u32) as u8;
                (
                    ChunkPartType::Xor { level, piece },
                    block / level as u32,
                )
            }
        }
    }

    /// Compute the operations that transform `layout` into the expected
    /// contiguous output in the first `block_count` slots. Two passes: first
    /// fix slots holding nothing usable (they may need blocks that the
    /// second pass would overwrite), then fix misplaced blocks.
    fn guess_post_process(
        &self,
        mut layout: Vec<Option<(ChunkPartType, u32)>>,
    ) -> ChunkIoResult<Vec<PostProcessOperation>> {
        let mut operations = Vec::new();
        for pass in 0..2 {
            for position in 0..self.block_count {
                let expected = self.expected_block(position);
                let actual = layout[position as usize];
                let needs_fix = match pass {
                    0 => actual.is_none(),
                    _ => actual != Some(expected),
                };
                if !needs_fix {
                    continue;
                }
                operations.push(self.operation_for_block(expected, position, &layout)?);
                layout[position as usize] = Some(expected);
            }
        }
        Ok(operations)
    }

    fn operation_for_block(
        &self,
        expected: (ChunkPartType, u32),
        destination_position: u32,
        layout: &[Option<(ChunkPartType, u32)>],
    ) -> ChunkIoResult<PostProcessOperation> {
        let destination_offset = destination_position * BLOCK_SIZE;
        let (_, stripe) = expected;
        let mut positions_to_xor: BTreeSet<u32> = BTreeSet::new();
        let mut parts_seen: BTreeSet<ChunkPartType> = BTreeSet::new();
        for (position, slot) in layout.iter().enumerate() {
            let Some((part, part_stripe)) = slot else {
                continue;
            };
            if (*part, *part_stripe) == expected {
                // An exact copy is available somewhere in the buffer.
                return Ok(PostProcessOperation {
                    destination_offset,
                    source_offset: position as u32 * BLOCK_SIZE,
                    xor_source_offsets: Vec::new(),
                });
            }
            if *part_stripe == stripe && !parts_seen.contains(part) {
                positions_to_xor.insert(position as u32);
                parts_seen.insert(*part);
            }
        }

        // Reconstructing an XOR block needs every other sibling block that
        // exists at this stripe (the stripe may be short at the chunk tail).
        if matches!(expected.0, ChunkPartType::Standard) {
            return Err(ChunkIoError::Unrecoverable(format!(
                "standard block {} not present in buffer",
                stripe
            )));
        }
        let needed: BTreeSet<ChunkPartType> = crate::part::layout_siblings(expected.0)
            .into_iter()
            .filter(|sibling| {
                *sibling != expected.0 && stripe < blocks_in_part(*sibling, BLOCKS_IN_CHUNK)
            })
            .collect();
        if parts_seen != needed {
            return Err(ChunkIoError::Unrecoverable(format!(
                "only {} of {} stripe blocks available for reconstruction",
                parts_seen.len(),
                needed.len()
            )));
        }

        let source_offset = if positions_to_xor.contains(&destination_position) {
            destination_offset
        } else {
            *positions_to_xor.iter().next().unwrap() * BLOCK_SIZE
        };
        positions_to_xor.remove(&(source_offset / BLOCK_SIZE));
        Ok(PostProcessOperation {
            destination_offset,
            source_offset,
            xor_source_offsets: positions_to_xor
                .iter()
                .map(|position| position * BLOCK_SIZE)
                .collect(),
        })
    }
}

/// Apply post-processing to the scratch buffer in place.
pub fn execute_post_process(buffer: &mut [u8], operations: &[PostProcessOperation]) {
    let block = BLOCK_SIZE as usize;
    for operation in operations {
        let dest = operation.destination_offset as usize;
        let src = operation.source_offset as usize;
        if dest != src {
            let (a, b) = if src < dest {
                let (head, tail) = buffer.split_at_mut(dest);
                (&head[src..src + block], &mut tail[..block])
            } else {
                let (head, tail) = buffer.split_at_mut(src);
                (&tail[..block], &mut head[dest..dest + block])
            };
            b.copy_from_slice(a);
        }
        for &xor_offset in &operation.xor_source_offsets {
            let xor_offset = xor_offset as usize;
            if xor_offset == dest {
                continue;
            }
            let (a, b) = if xor_offset < dest {
                let (head, tail) = buffer.split_at_mut(dest);
                (&head[xor_offset..xor_offset + block], &mut tail[..block])
            } else {
                let (head, tail) = buffer.split_at_mut(xor_offset);
                (&tail[..block], &mut head[dest..dest + block])
            };
            block_xor(b, a);
        }
    }
}

// ========== Standard planner ==========

/// Chooses a minimal cover of the chunk from the available parts and builds
/// plans that fetch exactly the needed blocks.
#[derive(Default)]
pub struct StandardChunkReadPlanner {
    parts_to_use: Vec<ChunkPartType>,
}

impl StandardChunkReadPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare(&mut self, available: &[ChunkPartType]) {
        self.parts_to_use.clear();
        let available: BTreeSet<ChunkPartType> = available.iter().copied().collect();
        if available.contains(&ChunkPartType::Standard) {
            self.parts_to_use.push(ChunkPartType::Standard);
            return;
        }

        let levels: BTreeSet<u8> = available
            .iter()
            .filter_map(|part| match part {
                ChunkPartType::Standard => None,
                ChunkPartType::Xor { level, .. } => Some(*level),
            })
            .collect();

        // Prefer a full data set; fall back to one missing data piece plus
        // parity. Lower levels win ties (fewer fetches).
        for &level in &levels {
            let data: Vec<ChunkPartType> = (1..=level)
                .map(|piece| ChunkPartType::Xor { level, piece })
                .filter(|part| available.contains(part))
                .collect();
            if data.len() == level as usize {
                self.parts_to_use = data;
                return;
            }
        }
        for &level in &levels {
            let parity = ChunkPartType::Xor {
                level,
                piece: level + 1,
            };
            let data: Vec<ChunkPartType> = (1..=level)
                .map(|piece| ChunkPartType::Xor { level, piece })
                .filter(|part| available.contains(part))
                .collect();
            if data.len() == (level - 1) as usize && available.contains(&parity) {
                self.parts_to_use = data;
                self.parts_to_use.push(parity);
                return;
            }
        }
    }

    pub fn is_reading_possible(&self) -> bool {
        !self.parts_to_use.is_empty()
    }

    pub fn parts_to_use(&self) -> &[ChunkPartType] {
        &self.parts_to_use
    }

    pub fn build_plan_for(&self, first_block: u32, block_count: u32) -> ChunkIoResult<ReadPlan> {
        if block_count == 0 || first_block + block_count > BLOCKS_IN_CHUNK {
            return Err(ChunkIoError::InvalidParam(format!(
                "block range [{}, {})",
                first_block,
                first_block + block_count
            )));
        }
        if !self.is_reading_possible() {
            return Err(ChunkIoError::NoSource("no cover available".to_string()));
        }

        let mut plan = ReadPlan::new(first_block, block_count);
        if self.parts_to_use == [ChunkPartType::Standard] {
            plan.basic_read_operations.insert(
                ChunkPartType::Standard,
                ReadOperation {
                    request_offset: first_block * BLOCK_SIZE,
                    request_size: block_count * BLOCK_SIZE,
                    buffer_offsets: (0..block_count).map(|i| i * BLOCK_SIZE).collect(),
                },
            );
            return Ok(plan);
        }

        let level = match self.parts_to_use[0] {
            ChunkPartType::Xor { level, .. } => level,
            ChunkPartType::Standard => unreachable!(),
        };
        let uses_parity = self.parts_to_use.iter().any(|part| is_parity(*part));
        let first_stripe = first_block / level as u32;
        let last_stripe = (first_block + block_count - 1) / level as u32;
        let last = first_block + block_count;

        for &part in &self.parts_to_use {
            let part_blocks = blocks_in_part(part, BLOCKS_IN_CHUNK);
            let (start, end) = if uses_parity {
                // Recovery mode: read every touched stripe from every part.
                (first_stripe, last_stripe.min(part_blocks.saturating_sub(1)))
            } else {
                // Full data set: fetch only the stripes whose block of this
                // piece falls inside the target range.
                let piece_offset = match part {
                    ChunkPartType::Xor { piece, .. } => (piece - 1) as u32,
                    ChunkPartType::Standard => unreachable!(),
                };
                if last - 1 < piece_offset {
                    continue;
                }
                let start = first_block
                    .saturating_sub(piece_offset)
                    .div_ceil(level as u32);
                let end = (last - 1 - piece_offset) / level as u32;
                (start, end)
            };
            if start > end {
                continue;
            }
            let mut buffer_offsets = Vec::with_capacity((end - start + 1) as usize);
            for stripe in start..=end {
                match block_at_stripe(part, stripe) {
                    Some(block) if block >= first_block && block < last => {
                        buffer_offsets.push((block - first_block) * BLOCK_SIZE);
                    }
                    _ => {
                        buffer_offsets.push(plan.required_buffer_size);
                        plan.required_buffer_size += BLOCK_SIZE;
                    }
                }
            }
            plan.basic_read_operations.insert(
                part,
                ReadOperation {
                    request_offset: start * BLOCK_SIZE,
                    request_size: (end - start + 1) * BLOCK_SIZE,
                    buffer_offsets,
                },
            );
        }
        Ok(plan)
    }
}

// ========== Multi-variant planner ==========

/// Removes from `op` the range already covered by `covered`. When `covered`
/// sits strictly inside `op` the overlap is left in place (the duplicate
/// read is harmless).
fn subtract_read_range(op: (u32, u32), covered: (u32, u32)) -> (u32, u32) {
    let (mut offset, mut size) = op;
    let (covered_offset, covered_size) = covered;
    let op_end = offset + size;
    let covered_end = covered_offset + covered_size;

    if covered_offset <= offset && covered_end >= op_end {
        return (offset, 0);
    }
    if covered_offset <= offset && covered_end > offset {
        size -= covered_end - offset;
        offset = covered_end;
    }
    if covered_offset < offset + size && covered_end >= offset + size {
        size -= offset + size - covered_offset;
    }
    (offset, size)
}

fn worst_part(
    scores: &BTreeMap<ChunkPartType, f32>,
    optimal: &BTreeSet<ChunkPartType>,
) -> ChunkPartType {
    let mut worst_score = f32::MAX;
    let mut worst = ChunkPartType::Xor {
        level: 9,
        piece: 10,
    };
    for (&part, &score) in scores {
        if score < worst_score || (score == worst_score && optimal.contains(&worst)) {
            worst_score = score;
            worst = part;
        }
    }
    worst
}

/// Score-aware planner: avoids the single worst part when the rest still
/// cover the range, and escalates to reading all parts of the level when a
/// redundant part is available.
pub struct MultiVariantReadPlanner {
    scores: BTreeMap<ChunkPartType, f32>,
    standard_planner: StandardChunkReadPlanner,
    parts_to_use: BTreeSet<ChunkPartType>,
}

impl Default for MultiVariantReadPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiVariantReadPlanner {
    pub fn new() -> Self {
        Self {
            scores: BTreeMap::new(),
            standard_planner: StandardChunkReadPlanner::new(),
            parts_to_use: BTreeSet::new(),
        }
    }

    pub fn set_scores(&mut self, scores: BTreeMap<ChunkPartType, f32>) {
        self.scores = scores;
    }

    pub fn prepare(&mut self, available: &[ChunkPartType]) {
        for &part in available {
            self.scores.entry(part).or_insert(1.0);
        }

        self.standard_planner.prepare(available);
        let optimal: BTreeSet<ChunkPartType> =
            self.standard_planner.parts_to_use().iter().copied().collect();

        let avoided = worst_part(&self.scores, &optimal);
        let best_parts: Vec<ChunkPartType> = available
            .iter()
            .copied()
            .filter(|part| *part != avoided)
            .collect();
        self.standard_planner.prepare(&best_parts);
        if !self.standard_planner.is_reading_possible() {
            self.standard_planner.prepare(available);
        }
        self.parts_to_use.clear();
        if !self.standard_planner.is_reading_possible() {
            return;
        }
        let stripe = stripe_size(self.standard_planner.parts_to_use()[0]);
        self.parts_to_use = available
            .iter()
            .copied()
            .filter(|part| stripe_size(*part) == stripe)
            .collect();
    }

    pub fn parts_to_use(&self) -> Vec<ChunkPartType> {
        self.parts_to_use.iter().copied().collect()
    }

    pub fn is_reading_possible(&self) -> bool {
        self.standard_planner.is_reading_possible()
    }

    /// Drop `part` from the working set if reading stays possible without it.
    pub fn start_avoiding_part(&mut self, part: ChunkPartType) {
        let remaining: Vec<ChunkPartType> = self
            .parts_to_use
            .iter()
            .copied()
            .filter(|candidate| *candidate != part)
            .collect();
        let mut probe = StandardChunkReadPlanner::new();
        probe.prepare(&remaining);
        if probe.is_reading_possible() {
            self.parts_to_use.remove(&part);
            self.standard_planner.prepare(&remaining);
        }
    }

    pub fn build_plan_for(&self, first_block: u32, block_count: u32) -> ChunkIoResult<ReadPlan> {
        let mut plan = self.standard_planner.build_plan_for(first_block, block_count)?;

        let stripe = stripe_size(*self.parts_to_use.iter().next().ok_or_else(|| {
            ChunkIoError::NoSource("no parts prepared".to_string())
        })?);
        if stripe == 1 || self.parts_to_use.len() as u32 == stripe {
            return Ok(plan);
        }

        // One redundant part beyond the minimum cover: read everything and
        // finish when at most one fetch is outstanding.
        plan.read_from_all = true;
        let first_stripe = first_block / stripe;
        let stripes = (first_block + block_count - 1) / stripe - first_stripe + 1;
        for &part in &self.parts_to_use {
            let part_blocks = blocks_in_part(part, BLOCKS_IN_CHUNK);
            let mut blocks_from_part = stripes;
            if first_stripe + blocks_from_part > part_blocks {
                blocks_from_part = part_blocks.saturating_sub(first_stripe);
            }
            let mut range = (first_stripe * BLOCK_SIZE, blocks_from_part * BLOCK_SIZE);
            if let Some(basic) = plan.basic_read_operations.get(&part) {
                range = subtract_read_range(range, (basic.request_offset, basic.request_size));
            }
            if range.1 == 0 {
                continue;
            }
            let mut buffer_offsets = Vec::with_capacity((range.1 / BLOCK_SIZE) as usize);
            for _ in 0..range.1 / BLOCK_SIZE {
                buffer_offsets.push(plan.required_buffer_size);
                plan.required_buffer_size += BLOCK_SIZE;
            }
            plan.additional_read_operations.insert(
                part,
                ReadOperation {
                    request_offset: range.0,
                    request_size: range.1,
                    buffer_offsets,
                },
            );
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{data_piece_for_block, stripe_of_block};

    /// Deterministic chunk content: block `k` is filled with bytes derived
    /// from `k`.
    fn logical_block(block: u32) -> Vec<u8> {
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((block as usize * 31 + i * 7) % 251) as u8;
        }
        data
    }

    /// Build the image of one part of a fully populated chunk.
    fn part_image(part: ChunkPartType) -> Vec<u8> {
        let blocks = blocks_in_part(part, BLOCKS_IN_CHUNK);
        let mut image = vec![0u8; (blocks * BLOCK_SIZE) as usize];
        for stripe in 0..blocks {
            let offset = (stripe * BLOCK_SIZE) as usize;
            match part {
                ChunkPartType::Standard => {
                    image[offset..offset + BLOCK_SIZE as usize]
                        .copy_from_slice(&logical_block(stripe));
                }
                ChunkPartType::Xor { level, piece } => {
                    if piece == level + 1 {
                        for data_piece in 1..=level {
                            let block = stripe * level as u32 + (data_piece - 1) as u32;
                            if block < BLOCKS_IN_CHUNK {
                                block_xor(
                                    &mut image[offset..offset + BLOCK_SIZE as usize],
                                    &logical_block(block),
                                );
                            }
                        }
                    } else {
                        let block = stripe * level as u32 + (piece - 1) as u32;
                        image[offset..offset + BLOCK_SIZE as usize]
                            .copy_from_slice(&logical_block(block));
                    }
                }
            }
        }
        image
    }

    /// Run a plan against simulated part images, failing the given parts.
    fn run_plan(plan: &ReadPlan, failed: &BTreeSet<ChunkPartType>) -> ChunkIoResult<Vec<u8>> {
        let mut buffer = vec![0u8; plan.required_buffer_size as usize];
        let operations = plan
            .basic_read_operations
            .iter()
            .chain(plan.additional_read_operations.iter());
        for (&part, operation) in operations {
            if failed.contains(&part) {
                continue;
            }
            let image = part_image(part);
            for (i, &buffer_offset) in operation.buffer_offsets.iter().enumerate() {
                let src = (operation.request_offset + i as u32 * BLOCK_SIZE) as usize;
                let dst = buffer_offset as usize;
                buffer[dst..dst + BLOCK_SIZE as usize]
                    .copy_from_slice(&image[src..src + BLOCK_SIZE as usize]);
            }
        }
        let operations = if failed.is_empty() {
            plan.post_process_for_basic()?
        } else {
            plan.post_process_for_extended(failed)?
        };
        execute_post_process(&mut buffer, &operations);
        buffer.truncate((plan.block_count * BLOCK_SIZE) as usize);
        Ok(buffer)
    }

    fn expected_range(first_block: u32, block_count: u32) -> Vec<u8> {
        let mut expected = Vec::new();
        for block in first_block..first_block + block_count {
            expected.extend_from_slice(&logical_block(block));
        }
        expected
    }

    fn xor(level: u8, piece: u8) -> ChunkPartType {
        ChunkPartType::Xor { level, piece }
    }

    #[test]
    fn standard_plan_reads_directly() {
        let mut planner = StandardChunkReadPlanner::new();
        planner.prepare(&[ChunkPartType::Standard]);
        let plan = planner.build_plan_for(5, 4).unwrap();
        assert_eq!(plan.basic_read_operations.len(), 1);
        assert!(plan.post_process_for_basic().unwrap().is_empty());
        assert_eq!(run_plan(&plan, &BTreeSet::new()).unwrap(), expected_range(5, 4));
    }

    #[test]
    fn xor_full_data_plan() {
        let mut planner = StandardChunkReadPlanner::new();
        planner.prepare(&[xor(3, 1), xor(3, 2), xor(3, 3)]);
        assert!(planner.is_reading_possible());
        for (first, count) in [(0u32, 6u32), (4, 5), (5, 1), (1020, 4)] {
            let plan = planner.build_plan_for(first, count).unwrap();
            assert_eq!(
                run_plan(&plan, &BTreeSet::new()).unwrap(),
                expected_range(first, count),
                "range [{}, {})",
                first,
                first + count
            );
        }
    }

    #[test]
    fn xor_recovery_plan_uses_parity() {
        // Data piece 2 is gone; the planner covers with parity.
        let mut planner = StandardChunkReadPlanner::new();
        planner.prepare(&[xor(3, 1), xor(3, 3), xor(3, 4)]);
        assert!(planner.is_reading_possible());
        for (first, count) in [(0u32, 3u32), (4, 5), (7, 1), (1018, 6)] {
            let plan = planner.build_plan_for(first, count).unwrap();
            assert_eq!(
                run_plan(&plan, &BTreeSet::new()).unwrap(),
                expected_range(first, count),
                "range [{}, {})",
                first,
                first + count
            );
        }
    }

    #[test]
    fn no_cover_means_no_plan() {
        let mut planner = StandardChunkReadPlanner::new();
        planner.prepare(&[xor(3, 1), xor(3, 3)]);
        assert!(!planner.is_reading_possible());
    }

    #[test]
    fn multi_variant_avoids_worst_part() {
        let mut planner = MultiVariantReadPlanner::new();
        let mut scores = BTreeMap::new();
        scores.insert(xor(2, 1), 1.0);
        scores.insert(xor(2, 2), 0.1);
        scores.insert(xor(2, 3), 1.0);
        planner.set_scores(scores);
        planner.prepare(&[xor(2, 1), xor(2, 2), xor(2, 3)]);
        // Cover must avoid the bad data piece by using the parity.
        let used = self_parts(&planner.standard_planner);
        assert!(used.contains(&xor(2, 3)));
        assert!(!used.contains(&xor(2, 2)));
    }

    fn self_parts(planner: &StandardChunkReadPlanner) -> BTreeSet<ChunkPartType> {
        planner.parts_to_use().iter().copied().collect()
    }

    #[test]
    fn read_from_all_parts_survives_any_single_failure() {
        let mut planner = MultiVariantReadPlanner::new();
        let parts = [xor(3, 1), xor(3, 2), xor(3, 3), xor(3, 4)];
        planner.prepare(&parts);
        let plan = planner.build_plan_for(3, 7).unwrap();
        assert!(plan.read_from_all);

        // All parts succeed.
        assert_eq!(run_plan(&plan, &BTreeSet::new()).unwrap(), expected_range(3, 7));

        // Any single part may fail and the extended plan still reconstructs.
        for &failed_part in &parts {
            let mut failed = BTreeSet::new();
            failed.insert(failed_part);
            assert_eq!(
                run_plan(&plan, &failed).unwrap(),
                expected_range(3, 7),
                "failed part {}",
                failed_part
            );
        }

        // Two failures exceed the redundancy.
        let mut failed = BTreeSet::new();
        failed.insert(parts[0]);
        failed.insert(parts[1]);
        assert!(run_plan(&plan, &failed).is_err());
    }

    #[test]
    fn plans_are_deterministic() {
        let build = || {
            let mut planner = MultiVariantReadPlanner::new();
            planner.prepare(&[xor(3, 2), xor(3, 4), xor(3, 1), xor(3, 3)]);
            planner.build_plan_for(10, 12).unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn avoiding_a_part_reconfigures_when_possible() {
        let mut planner = MultiVariantReadPlanner::new();
        planner.prepare(&[xor(2, 1), xor(2, 2), xor(2, 3)]);
        planner.start_avoiding_part(xor(2, 1));
        assert!(planner.is_reading_possible());
        let plan = planner.build_plan_for(0, 4).unwrap();
        assert!(!plan.basic_read_operations.contains_key(&xor(2, 1)));
        assert_eq!(run_plan(&plan, &BTreeSet::new()).unwrap(), expected_range(0, 4));

        // Avoiding a second part would make reading impossible; request is
        // ignored.
        planner.start_avoiding_part(xor(2, 2));
        assert!(planner.is_reading_possible());
    }

    #[test]
    fn mapping_block_to_piece_matches_parity_layout() {
        // The parity piece must equal the XOR of its data pieces.
        for level in [2u8, 3, 5] {
            let parity = part_image(xor(level, level + 1));
            for stripe in 0..8u32 {
                let mut acc = vec![0u8; BLOCK_SIZE as usize];
                for piece in 1..=level {
                    let block = stripe * level as u32 + (piece - 1) as u32;
                    assert_eq!(data_piece_for_block(level, block), piece);
                    assert_eq!(stripe_of_block(level, block), stripe);
                    block_xor(&mut acc, &logical_block(block));
                }
                let offset = (stripe * BLOCK_SIZE) as usize;
                assert_eq!(&parity[offset..offset + BLOCK_SIZE as usize], &acc[..]);
            }
        }
    }
}
