//! Client-side chunk writer. Writes are journalled, grouped into operations
//! over the combined stripe (the LCM of all target stripe sizes), completed
//! with read-modify-write for partial stripes, and fanned out to every
//! target part with freshly computed parity. The writer itself produces
//! packets and consumes statuses; pumping sockets is the driver's job.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use log::debug;
use wire_proto::{ChunkPartType, ChunkTypeWithAddress, Status};

use crate::part::{is_parity, is_standard, stripe_size, xor_level};
use crate::{block_xor, ChunkIoError, ChunkIoResult, BLOCKS_IN_CHUNK, BLOCK_SIZE, CHUNK_SIZE};

pub type WriteId = u32;
pub type OperationId = u32;

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheBlockKind {
    /// Still open for appends from the caller.
    Writable,
    /// Handed to the writer; contents frozen.
    ReadOnly,
    /// Fetched during read-modify-write; never sent to data parts.
    Read,
    /// Computed parity; never journalled.
    Parity,
}

/// One 64 KiB block of write-back cache. `data` is always a full block;
/// `[from, to)` delimits the meaningful byte range.
#[derive(Clone, Debug)]
pub struct WriteCacheBlock {
    pub chunk_index: u32,
    pub block_index: u32,
    pub from: u32,
    pub to: u32,
    pub kind: CacheBlockKind,
    data: Vec<u8>,
}

impl WriteCacheBlock {
    pub fn new(chunk_index: u32, block_index: u32, kind: CacheBlockKind) -> Self {
        Self {
            chunk_index,
            block_index,
            from: 0,
            to: 0,
            kind,
            data: vec![0u8; BLOCK_SIZE as usize],
        }
    }

    /// Absorb `[from, to)` into the block. Fails unless the new range starts
    /// fresh or touches the already covered one.
    pub fn expand(&mut self, from: u32, to: u32, data: &[u8]) -> bool {
        debug_assert_eq!((to - from) as usize, data.len());
        if to > BLOCK_SIZE || from >= to {
            return false;
        }
        if self.from == self.to {
            self.from = from;
            self.to = to;
        } else if from >= self.from && from <= self.to {
            self.to = self.to.max(to);
            self.from = self.from.min(from);
        } else if to >= self.from && to <= self.to {
            self.from = from;
        } else {
            return false;
        }
        self.data[from as usize..to as usize].copy_from_slice(data);
        true
    }

    pub fn size(&self) -> u32 {
        self.to - self.from
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.from as usize..self.to as usize]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.from as usize..self.to as usize]
    }

    pub fn fill(&mut self, from: u32, to: u32, data: &[u8]) {
        self.from = from;
        self.to = to;
        self.data[from as usize..to as usize].copy_from_slice(data);
    }

    pub fn offset_in_file(&self) -> u64 {
        self.chunk_index as u64 * CHUNK_SIZE
            + self.block_index as u64 * BLOCK_SIZE as u64
            + self.from as u64
    }
}

/// A packet the driver must deliver to one chunkserver.
#[derive(Clone, Debug)]
pub enum WriterPacket {
    Init {
        target: ChunkTypeWithAddress,
    },
    Data {
        target: ChunkTypeWithAddress,
        write_id: WriteId,
        block_in_part: u32,
        from: u32,
        data: Vec<u8>,
    },
    End {
        target: ChunkTypeWithAddress,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkWriteStatus {
    pub write_id: WriteId,
    pub status: Status,
}

/// Reported when a data operation completes: the caller updates the file
/// length if the operation extended it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteCompletion {
    pub offset_of_end: u64,
}

/// Source of chunk blocks for partial-stripe read-modify-write.
#[async_trait]
pub trait StripeBlockSource: Send + Sync {
    /// Read one full block of `location`'s part at stripe position `stripe`.
    async fn read_part_block(
        &self,
        location: &ChunkTypeWithAddress,
        stripe: u32,
    ) -> ChunkIoResult<Vec<u8>>;
}

#[derive(Default)]
struct Operation {
    positions: Vec<u64>,
    unfinished_writes: u32,
    offset_of_end: u64,
}

pub struct ChunkWriter {
    chunk_index: u32,
    targets: Vec<ChunkTypeWithAddress>,
    combined_stripe_size: u32,
    journal: BTreeMap<u64, WriteCacheBlock>,
    next_seq: u64,
    new_operations: Vec<Operation>,
    pending_operations: BTreeMap<OperationId, Operation>,
    write_id_to_operation: HashMap<WriteId, OperationId>,
    id_counter: u32,
    accepts_new_operations: bool,
}

impl ChunkWriter {
    /// Set up for one chunk. Targets with the same part type are
    /// deduplicated into a chain head (the driver forwards along the chain).
    pub fn new(chunk_index: u32, locations: &[ChunkTypeWithAddress]) -> ChunkIoResult<Self> {
        if locations.is_empty() {
            return Err(ChunkIoError::InvalidParam("no write targets".to_string()));
        }
        let mut targets: Vec<ChunkTypeWithAddress> = Vec::new();
        let mut combined_stripe_size = 0u32;
        for location in locations {
            if targets.iter().any(|t| t.part_type == location.part_type) {
                continue;
            }
            let stripe = stripe_size(location.part_type);
            combined_stripe_size = if combined_stripe_size == 0 {
                stripe
            } else {
                stripe * combined_stripe_size / gcd(combined_stripe_size, stripe)
            };
            targets.push(*location);
        }
        Ok(Self {
            chunk_index,
            targets,
            combined_stripe_size,
            journal: BTreeMap::new(),
            next_seq: 0,
            new_operations: Vec::new(),
            pending_operations: BTreeMap::new(),
            write_id_to_operation: HashMap::new(),
            id_counter: 0,
            accepts_new_operations: true,
        })
    }

    /// The init packets; op id 0 completes when every target acknowledged.
    pub fn init(&mut self) -> Vec<WriterPacket> {
        let mut op = Operation::default();
        op.unfinished_writes = self.targets.len() as u32;
        self.pending_operations.insert(0, op);
        self.targets
            .iter()
            .map(|target| WriterPacket::Init { target: *target })
            .collect()
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    pub fn combined_stripe_size(&self) -> u32 {
        self.combined_stripe_size
    }

    /// Batching below this size can't fill a stripe, so it isn't worth it.
    pub fn minimum_block_count_worth_writing(&self) -> u32 {
        self.combined_stripe_size
    }

    pub fn unfinished_operation_count(&self) -> usize {
        self.pending_operations.len() + self.new_operations.len()
    }

    pub fn pending_operation_count(&self) -> usize {
        self.pending_operations.len()
    }

    pub fn start_flush_mode(&mut self) {
        self.accepts_new_operations = false;
    }

    pub fn drop_new_operations(&mut self) {
        for operation in self.new_operations.drain(..) {
            for position in operation.positions {
                self.journal.remove(&position);
            }
        }
        self.accepts_new_operations = false;
    }

    /// Hand back journalled blocks (retry path after a recoverable failure).
    pub fn release_journal(&mut self) -> Vec<WriteCacheBlock> {
        self.new_operations.clear();
        std::mem::take(&mut self.journal).into_values().collect()
    }

    /// Queue one block write. Consecutive compatible writes expand the
    /// youngest operation; anything else opens a new one.
    pub fn add_operation(&mut self, mut block: WriteCacheBlock) -> ChunkIoResult<()> {
        if !self.accepts_new_operations {
            return Err(ChunkIoError::InvalidParam(
                "writer no longer accepts operations".to_string(),
            ));
        }
        if block.kind == CacheBlockKind::Parity {
            return Err(ChunkIoError::InvalidParam(
                "parity blocks are writer-internal".to_string(),
            ));
        }
        if block.chunk_index != self.chunk_index {
            return Err(ChunkIoError::InvalidParam(format!(
                "block for chunk {} given to writer of chunk {}",
                block.chunk_index, self.chunk_index
            )));
        }
        if block.kind == CacheBlockKind::Writable {
            // Frozen from the first attempt to write it out.
            block.kind = CacheBlockKind::ReadOnly;
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        let expandable = match self.new_operations.last() {
            Some(operation) => self.is_expand_possible(operation, &block),
            None => false,
        };
        self.journal.insert(seq, block);
        if expandable {
            let operation = self.new_operations.last_mut().unwrap();
            Self::expand_operation(operation, &self.journal, seq);
        } else {
            let mut operation = Operation::default();
            Self::expand_operation(&mut operation, &self.journal, seq);
            self.new_operations.push(operation);
        }
        Ok(())
    }

    fn is_expand_possible(&self, operation: &Operation, block: &WriteCacheBlock) -> bool {
        for position in &operation.positions {
            let existing = &self.journal[position];
            if existing.from != block.from
                || existing.to != block.to
                || existing.block_index / self.combined_stripe_size
                    != block.block_index / self.combined_stripe_size
                || existing.block_index == block.block_index
            {
                return false;
            }
        }
        true
    }

    fn expand_operation(operation: &mut Operation, journal: &BTreeMap<u64, WriteCacheBlock>, seq: u64) {
        let block = &journal[&seq];
        let end = block.offset_in_file() + block.size() as u64;
        if block.kind != CacheBlockKind::Read && end > operation.offset_of_end {
            operation.offset_of_end = end;
        }
        operation.positions.push(seq);
    }

    fn collides(&self, a: &Operation, b: &Operation) -> bool {
        for pa in &a.positions {
            let Some(block_a) = self.journal.get(pa) else {
                continue;
            };
            for pb in &b.positions {
                let Some(block_b) = self.journal.get(pb) else {
                    continue;
                };
                if block_a.block_index == block_b.block_index
                    && block_a.from < block_b.to
                    && block_a.to > block_b.from
                {
                    return true;
                }
            }
        }
        false
    }

    fn can_start(&self, operation: &Operation) -> bool {
        self.pending_operations
            .values()
            .all(|pending| !self.collides(operation, pending))
    }

    fn is_full_stripe(&self, operation: &Operation) -> bool {
        let Some(first) = operation.positions.first() else {
            return false;
        };
        let stripe_len = self.combined_stripe_size;
        let stripe = self.journal[first].block_index / stripe_len;
        let mut elements = stripe_len;
        if stripe == (BLOCKS_IN_CHUNK - 1) / stripe_len && BLOCKS_IN_CHUNK % stripe_len != 0 {
            elements = BLOCKS_IN_CHUNK % stripe_len;
        }
        operation.positions.len() as u32 == elements
    }

    /// Start every operation whose turn has come, in insertion order. Breaks
    /// at the first unstartable operation to preserve append order; the
    /// youngest still-expandable operation is deferred while new data is
    /// accepted. Returns the packets to deliver.
    pub async fn start_new_operations(
        &mut self,
        source: &dyn StripeBlockSource,
    ) -> ChunkIoResult<Vec<WriterPacket>> {
        let mut packets = Vec::new();
        while !self.new_operations.is_empty() {
            let is_last = self.new_operations.len() == 1;
            {
                let operation = &self.new_operations[0];
                if is_last && self.accepts_new_operations && !self.is_full_stripe(operation) {
                    break;
                }
                if !self.can_start(operation) {
                    break;
                }
            }
            let operation = self.new_operations.remove(0);
            self.start_operation(operation, source, &mut packets).await?;
        }
        Ok(packets)
    }

    async fn start_operation(
        &mut self,
        mut operation: Operation,
        source: &dyn StripeBlockSource,
        packets: &mut Vec<WriterPacket>,
    ) -> ChunkIoResult<()> {
        let stripe_len = self.combined_stripe_size;
        let first = &self.journal[&operation.positions[0]];
        let combined_stripe = first.block_index / stripe_len;
        let (from, to) = (first.from, first.to);
        let size = first.size();

        // Partial stripe: fetch the missing blocks before parity can be
        // computed over the whole stripe.
        let mut present = vec![false; stripe_len as usize];
        for position in &operation.positions {
            present[(self.journal[position].block_index % stripe_len) as usize] = true;
        }
        for index_in_stripe in 0..stripe_len {
            if present[index_in_stripe as usize] {
                continue;
            }
            let block_index = combined_stripe * stripe_len + index_in_stripe;
            if block_index >= BLOCKS_IN_CHUNK {
                break;
            }
            let data = self.read_block(block_index, source).await?;
            let mut block =
                WriteCacheBlock::new(self.chunk_index, block_index, CacheBlockKind::Read);
            block.fill(0, BLOCK_SIZE, &data);
            block.from = from;
            block.to = to;
            let seq = self.next_seq;
            self.next_seq += 1;
            self.journal.insert(seq, block);
            operation.positions.push(seq);
        }

        debug_assert!(self.is_full_stripe(&operation));

        let operation_id = self.allocate_id();
        for target_index in 0..self.targets.len() {
            let target = self.targets[target_index];
            let part = target.part_type;
            let part_stripe = stripe_size(part);
            debug_assert_eq!(stripe_len % part_stripe, 0);

            if is_standard(part) {
                for position in &operation.positions {
                    let block = &self.journal[position];
                    if block.kind == CacheBlockKind::Read {
                        continue;
                    }
                    let block_in_part = block.block_index;
                    let from = block.from;
                    let data = block.payload().to_vec();
                    let write_id = self.allocate_id();
                    self.write_id_to_operation.insert(write_id, operation_id);
                    operation.unfinished_writes += 1;
                    packets.push(WriterPacket::Data {
                        target,
                        write_id,
                        block_in_part,
                        from,
                        data,
                    });
                }
            } else if is_parity(part) {
                let level = part_stripe;
                let substripe_count = stripe_len / level;
                let mut parity_blocks: Vec<WriteCacheBlock> = Vec::new();
                for _ in 0..substripe_count {
                    parity_blocks.push(WriteCacheBlock::new(
                        self.chunk_index,
                        0,
                        CacheBlockKind::Parity,
                    ));
                }
                for position in &operation.positions {
                    let block = &self.journal[position];
                    debug_assert_eq!(block.size(), size);
                    let substripe = ((block.block_index - combined_stripe * stripe_len)
                        / level) as usize;
                    if parity_blocks[substripe].size() == 0 {
                        parity_blocks[substripe].block_index = block.block_index;
                        let expanded =
                            parity_blocks[substripe].expand(block.from, block.to, block.payload());
                        debug_assert!(expanded);
                    } else {
                        block_xor(parity_blocks[substripe].payload_mut(), block.payload());
                    }
                }
                for parity in parity_blocks {
                    let block_in_part = parity.block_index / level;
                    let from = parity.from;
                    let data = parity.payload().to_vec();
                    let write_id = self.allocate_id();
                    self.write_id_to_operation.insert(write_id, operation_id);
                    operation.unfinished_writes += 1;
                    packets.push(WriterPacket::Data {
                        target,
                        write_id,
                        block_in_part,
                        from,
                        data,
                    });
                }
            } else {
                let level = xor_level(part).unwrap() as u32;
                let piece = match part {
                    ChunkPartType::Xor { piece, .. } => piece as u32,
                    ChunkPartType::Standard => unreachable!(),
                };
                for position in &operation.positions {
                    let block = &self.journal[position];
                    if block.kind == CacheBlockKind::Read
                        || block.block_index % level + 1 != piece
                    {
                        continue;
                    }
                    let block_in_part = block.block_index / level;
                    let from = block.from;
                    let data = block.payload().to_vec();
                    let write_id = self.allocate_id();
                    self.write_id_to_operation.insert(write_id, operation_id);
                    operation.unfinished_writes += 1;
                    packets.push(WriterPacket::Data {
                        target,
                        write_id,
                        block_in_part,
                        from,
                        data,
                    });
                }
            }
        }
        debug!(
            "operation {} started with {} writes",
            operation_id, operation.unfinished_writes
        );
        self.pending_operations.insert(operation_id, operation);
        Ok(())
    }

    /// Pick a source and fetch one logical block, recovering through parity
    /// if that is the best part available. Preference: a standard replica,
    /// then the parity with the lowest XOR level, then the data piece that
    /// naturally holds the block.
    async fn read_block(
        &self,
        block_index: u32,
        source: &dyn StripeBlockSource,
    ) -> ChunkIoResult<Vec<u8>> {
        let chosen = self.choose_read_source(block_index, false)?;
        let part = chosen.part_type;
        if !is_parity(part) {
            let stripe = match xor_level(part) {
                None => block_index,
                Some(level) => block_index / level as u32,
            };
            return source.read_part_block(&chosen, stripe).await;
        }

        // A parity was chosen: reconstruct by XORing the remaining data
        // blocks of the stripe into the parity block.
        let level = xor_level(part).unwrap() as u32;
        let stripe = block_index / level;
        let mut data = source.read_part_block(&chosen, stripe).await?;
        let first_in_stripe = stripe * level;
        for other in first_in_stripe..first_in_stripe + level {
            if other == block_index || other >= BLOCKS_IN_CHUNK {
                continue;
            }
            let other_source = self.choose_read_source(other, true)?;
            let other_stripe = match xor_level(other_source.part_type) {
                None => other,
                Some(level) => other / level as u32,
            };
            let other_data = source.read_part_block(&other_source, other_stripe).await?;
            block_xor(&mut data, &other_data);
        }
        Ok(data)
    }

    fn choose_read_source(
        &self,
        block_index: u32,
        forbid_parity: bool,
    ) -> ChunkIoResult<ChunkTypeWithAddress> {
        let mut chosen: Option<ChunkTypeWithAddress> = None;
        for target in &self.targets {
            let part = target.part_type;
            if is_standard(part) {
                return Ok(*target);
            }
            if is_parity(part) {
                if forbid_parity {
                    continue;
                }
                let better = match chosen {
                    None => true,
                    Some(existing) => {
                        is_parity(existing.part_type)
                            && xor_level(part) < xor_level(existing.part_type)
                    }
                };
                if better {
                    chosen = Some(*target);
                }
            } else {
                let level = xor_level(part).unwrap() as u32;
                let piece = match part {
                    ChunkPartType::Xor { piece, .. } => piece as u32,
                    ChunkPartType::Standard => unreachable!(),
                };
                if block_index % level + 1 == piece {
                    return Ok(*target);
                }
            }
        }
        chosen.ok_or_else(|| {
            ChunkIoError::RecoverableWrite(format!("no server to read block {}", block_index))
        })
    }

    /// Feed one status back. A completed data operation reports its end
    /// offset so the caller can grow the file length.
    pub fn process_status(
        &mut self,
        status: ChunkWriteStatus,
    ) -> ChunkIoResult<Option<WriteCompletion>> {
        if status.status != Status::Ok {
            return Err(ChunkIoError::RecoverableWrite(format!(
                "chunk write error: {}",
                status.status
            )));
        }
        let operation_id = if status.write_id == 0 {
            if !self.pending_operations.contains_key(&0) {
                return Err(ChunkIoError::RecoverableWrite(
                    "unexpected status for write init".to_string(),
                ));
            }
            0
        } else {
            match self.write_id_to_operation.remove(&status.write_id) {
                Some(id) => id,
                None => {
                    return Err(ChunkIoError::RecoverableWrite(format!(
                        "unexpected status for write id {}",
                        status.write_id
                    )))
                }
            }
        };

        let operation = self
            .pending_operations
            .get_mut(&operation_id)
            .expect("operation for tracked write id");
        operation.unfinished_writes -= 1;
        if operation.unfinished_writes > 0 {
            return Ok(None);
        }
        let operation = self.pending_operations.remove(&operation_id).unwrap();
        if operation_id == 0 {
            return Ok(None);
        }
        for position in &operation.positions {
            self.journal.remove(position);
        }
        Ok(Some(WriteCompletion {
            offset_of_end: operation.offset_of_end,
        }))
    }

    /// End packets for the flush path; valid once nothing is pending.
    pub fn finish(&self) -> Vec<WriterPacket> {
        self.targets
            .iter()
            .map(|target| WriterPacket::End { target: *target })
            .collect()
    }

    pub fn targets(&self) -> &[ChunkTypeWithAddress] {
        &self.targets
    }

    fn allocate_id(&mut self) -> u32 {
        self.id_counter += 1;
        self.id_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::blocks_in_part;
    use std::sync::Mutex;
    use wire_proto::NetworkAddress;

    /// In-memory chunkservers: full part images, written by applying the
    /// writer's packets, read back for RMW.
    struct FakeCluster {
        parts: Mutex<HashMap<ChunkPartType, Vec<u8>>>,
    }

    impl FakeCluster {
        fn new(parts: &[ChunkPartType]) -> Self {
            let mut map = HashMap::new();
            for &part in parts {
                let blocks = blocks_in_part(part, BLOCKS_IN_CHUNK);
                map.insert(part, vec![0u8; (blocks * BLOCK_SIZE) as usize]);
            }
            Self {
                parts: Mutex::new(map),
            }
        }

        fn locations(&self) -> Vec<ChunkTypeWithAddress> {
            let parts = self.parts.lock().unwrap();
            let mut locations: Vec<ChunkTypeWithAddress> = parts
                .keys()
                .map(|&part_type| ChunkTypeWithAddress {
                    address: NetworkAddress::new(1, 1),
                    part_type,
                    chunkserver_version: 1,
                })
                .collect();
            locations.sort_by_key(|l| l.part_type);
            locations
        }

        fn apply(&self, packet: &WriterPacket) -> Vec<ChunkWriteStatus> {
            match packet {
                WriterPacket::Init { .. } => vec![ChunkWriteStatus {
                    write_id: 0,
                    status: Status::Ok,
                }],
                WriterPacket::End { .. } => Vec::new(),
                WriterPacket::Data {
                    target,
                    write_id,
                    block_in_part,
                    from,
                    data,
                } => {
                    let mut parts = self.parts.lock().unwrap();
                    let image = parts.get_mut(&target.part_type).unwrap();
                    let offset = (block_in_part * BLOCK_SIZE + from) as usize;
                    image[offset..offset + data.len()].copy_from_slice(data);
                    vec![ChunkWriteStatus {
                        write_id: *write_id,
                        status: Status::Ok,
                    }]
                }
            }
        }

        fn read_logical_block(&self, block: u32, level: u8) -> Vec<u8> {
            let parts = self.parts.lock().unwrap();
            let piece = 1 + (block % level as u32) as u8;
            let stripe = block / level as u32;
            let image = &parts[&ChunkPartType::Xor { level, piece }];
            let offset = (stripe * BLOCK_SIZE) as usize;
            image[offset..offset + BLOCK_SIZE as usize].to_vec()
        }

        fn parity_holds(&self, level: u8, stripes: u32) -> bool {
            let parts = self.parts.lock().unwrap();
            for stripe in 0..stripes {
                let mut acc = vec![0u8; BLOCK_SIZE as usize];
                for piece in 1..=level {
                    let block = stripe * level as u32 + (piece - 1) as u32;
                    if block >= BLOCKS_IN_CHUNK {
                        continue;
                    }
                    let image = &parts[&ChunkPartType::Xor { level, piece }];
                    let offset = (stripe * BLOCK_SIZE) as usize;
                    block_xor(&mut acc, &image[offset..offset + BLOCK_SIZE as usize]);
                }
                let parity = &parts[&ChunkPartType::Xor {
                    level,
                    piece: level + 1,
                }];
                let offset = (stripe * BLOCK_SIZE) as usize;
                if acc != parity[offset..offset + BLOCK_SIZE as usize] {
                    return false;
                }
            }
            true
        }
    }

    #[async_trait]
    impl StripeBlockSource for FakeCluster {
        async fn read_part_block(
            &self,
            location: &ChunkTypeWithAddress,
            stripe: u32,
        ) -> ChunkIoResult<Vec<u8>> {
            let parts = self.parts.lock().unwrap();
            let image = parts.get(&location.part_type).ok_or_else(|| {
                ChunkIoError::NoSource(format!("no part {}", location.part_type))
            })?;
            let offset = (stripe * BLOCK_SIZE) as usize;
            Ok(image[offset..offset + BLOCK_SIZE as usize].to_vec())
        }
    }

    fn xor_parts(level: u8) -> Vec<ChunkPartType> {
        (1..=level + 1)
            .map(|piece| ChunkPartType::Xor { level, piece })
            .collect()
    }

    fn block_of(chunk_index: u32, block_index: u32, from: u32, data: &[u8]) -> WriteCacheBlock {
        let mut block = WriteCacheBlock::new(chunk_index, block_index, CacheBlockKind::Writable);
        assert!(block.expand(from, from + data.len() as u32, data));
        block
    }

    async fn drive_to_completion(
        writer: &mut ChunkWriter,
        cluster: &FakeCluster,
    ) -> Vec<WriteCompletion> {
        let mut completions = Vec::new();
        // Initialization round.
        for packet in writer.init() {
            for status in cluster.apply(&packet) {
                writer.process_status(status).unwrap();
            }
        }
        writer.start_flush_mode();
        while writer.unfinished_operation_count() > 0 {
            let packets = writer.start_new_operations(cluster).await.unwrap();
            assert!(
                !packets.is_empty() || writer.pending_operation_count() > 0,
                "writer stalled"
            );
            for packet in packets {
                for status in cluster.apply(&packet) {
                    if let Some(completion) = writer.process_status(status).unwrap() {
                        completions.push(completion);
                    }
                }
            }
        }
        completions
    }

    #[tokio::test]
    async fn full_stripe_write_generates_correct_parity() {
        let parts = xor_parts(3);
        let cluster = FakeCluster::new(&parts);
        let mut writer = ChunkWriter::new(0, &cluster.locations()).unwrap();
        assert_eq!(writer.combined_stripe_size(), 3);

        for block_index in 0..3u32 {
            let data = vec![block_index as u8 + 1; BLOCK_SIZE as usize];
            writer
                .add_operation(block_of(0, block_index, 0, &data))
                .unwrap();
        }
        let completions = drive_to_completion(&mut writer, &cluster).await;
        assert_eq!(completions.len(), 1);
        assert_eq!(
            completions[0].offset_of_end,
            3 * BLOCK_SIZE as u64
        );
        for block_index in 0..3u32 {
            assert_eq!(
                cluster.read_logical_block(block_index, 3),
                vec![block_index as u8 + 1; BLOCK_SIZE as usize]
            );
        }
        assert!(cluster.parity_holds(3, 1));
    }

    #[tokio::test]
    async fn partial_stripe_write_reads_missing_blocks() {
        // One 64 KiB block at index 5 (stripe 1 of level 3, partial).
        let parts = xor_parts(3);
        let cluster = FakeCluster::new(&parts);
        let mut writer = ChunkWriter::new(0, &cluster.locations()).unwrap();

        let payload = vec![0xabu8; BLOCK_SIZE as usize];
        writer.add_operation(block_of(0, 5, 0, &payload)).unwrap();
        drive_to_completion(&mut writer, &cluster).await;

        assert_eq!(cluster.read_logical_block(5, 3), payload);
        assert!(cluster.parity_holds(3, 2));
    }

    #[tokio::test]
    async fn colliding_writes_are_serialized() {
        let parts = xor_parts(2);
        let cluster = FakeCluster::new(&parts);
        let mut writer = ChunkWriter::new(0, &cluster.locations()).unwrap();
        for packet in writer.init() {
            for status in cluster.apply(&packet) {
                writer.process_status(status).unwrap();
            }
        }

        let first = vec![0x11u8; 100];
        let second = vec![0x22u8; 100];
        writer.add_operation(block_of(0, 0, 0, &first)).unwrap();
        writer.add_operation(block_of(0, 0, 0, &second)).unwrap();
        writer.start_flush_mode();

        let packets = writer.start_new_operations(&cluster).await.unwrap();
        assert!(writer.pending_operation_count() >= 1);
        // The second write must not start while the first is in flight.
        assert_eq!(writer.unfinished_operation_count(), 2);
        let stalled = writer.start_new_operations(&cluster).await.unwrap();
        assert!(stalled.is_empty());

        for packet in packets {
            for status in cluster.apply(&packet) {
                writer.process_status(status).unwrap();
            }
        }
        let packets = writer.start_new_operations(&cluster).await.unwrap();
        assert!(!packets.is_empty());
        for packet in packets {
            for status in cluster.apply(&packet) {
                writer.process_status(status).unwrap();
            }
        }
        let mut expected = vec![0u8; BLOCK_SIZE as usize];
        expected[..100].copy_from_slice(&second);
        assert_eq!(cluster.read_logical_block(0, 2), expected);
        assert!(cluster.parity_holds(2, 1));
    }

    #[tokio::test]
    async fn replayed_packets_leave_chunk_unchanged() {
        // Write idempotence: applying the same data packets twice is
        // byte-equal to a single application.
        let parts = xor_parts(3);
        let cluster = FakeCluster::new(&parts);
        let mut writer = ChunkWriter::new(0, &cluster.locations()).unwrap();
        for packet in writer.init() {
            cluster.apply(&packet);
        }
        writer.process_status(ChunkWriteStatus {
            write_id: 0,
            status: Status::Ok,
        })
        .unwrap();
        let payload = vec![0x5au8; BLOCK_SIZE as usize];
        writer.add_operation(block_of(0, 4, 0, &payload)).unwrap();
        writer.start_flush_mode();
        let packets = writer.start_new_operations(&cluster).await.unwrap();

        for packet in &packets {
            cluster.apply(packet);
        }
        let snapshot: HashMap<ChunkPartType, Vec<u8>> =
            cluster.parts.lock().unwrap().clone();
        for packet in &packets {
            cluster.apply(packet);
        }
        assert_eq!(*cluster.parts.lock().unwrap(), snapshot);
        assert!(cluster.parity_holds(3, 2));
    }

    #[tokio::test]
    async fn bad_status_raises_recoverable_error() {
        let parts = xor_parts(2);
        let cluster = FakeCluster::new(&parts);
        let mut writer = ChunkWriter::new(0, &cluster.locations()).unwrap();
        writer.init();
        let result = writer.process_status(ChunkWriteStatus {
            write_id: 0,
            status: Status::EIo,
        });
        assert!(matches!(result, Err(ChunkIoError::RecoverableWrite(_))));
    }

    #[tokio::test]
    async fn standard_and_xor_targets_combine() {
        let mut parts = xor_parts(2);
        parts.push(ChunkPartType::Standard);
        let cluster = FakeCluster::new(&parts);
        let mut writer = ChunkWriter::new(0, &cluster.locations()).unwrap();
        assert_eq!(writer.combined_stripe_size(), 2);

        let payload = vec![0x3cu8; BLOCK_SIZE as usize];
        writer.add_operation(block_of(0, 2, 0, &payload)).unwrap();
        drive_to_completion(&mut writer, &cluster).await;

        assert_eq!(cluster.read_logical_block(2, 2), payload);
        let parts_map = cluster.parts.lock().unwrap();
        let standard = &parts_map[&ChunkPartType::Standard];
        let offset = (2 * BLOCK_SIZE) as usize;
        assert_eq!(&standard[offset..offset + BLOCK_SIZE as usize], &payload[..]);
    }
}
