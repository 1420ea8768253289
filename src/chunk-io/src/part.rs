//! Block and stripe arithmetic over chunk part identities.
//!
//! For XOR level `L`, logical block `k` of the chunk lives in data piece
//! `1 + (k mod L)` at stripe position `k div L`; the parity piece at stripe
//! `s` is the XOR of all data pieces at stripe `s`.

use wire_proto::ChunkPartType;

/// Number of logical chunk blocks covered by one stripe of the part's layout.
pub fn stripe_size(part: ChunkPartType) -> u32 {
    match part {
        ChunkPartType::Standard => 1,
        ChunkPartType::Xor { level, .. } => level as u32,
    }
}

pub fn is_parity(part: ChunkPartType) -> bool {
    matches!(part, ChunkPartType::Xor { level, piece } if piece == level + 1)
}

pub fn is_standard(part: ChunkPartType) -> bool {
    matches!(part, ChunkPartType::Standard)
}

pub fn xor_level(part: ChunkPartType) -> Option<u8> {
    match part {
        ChunkPartType::Standard => None,
        ChunkPartType::Xor { level, .. } => Some(level),
    }
}

/// The data piece of level `level` that holds logical block `block`.
pub fn data_piece_for_block(level: u8, block: u32) -> u8 {
    1 + (block % level as u32) as u8
}

pub fn stripe_of_block(level: u8, block: u32) -> u32 {
    block / level as u32
}

/// The logical block stored by `part` at stripe position `stripe`, or None
/// for parity pieces (which store no logical block).
pub fn block_at_stripe(part: ChunkPartType, stripe: u32) -> Option<u32> {
    match part {
        ChunkPartType::Standard => Some(stripe),
        ChunkPartType::Xor { level, piece } => {
            if piece == level + 1 {
                None
            } else {
                Some(stripe * level as u32 + (piece - 1) as u32)
            }
        }
    }
}

/// How many blocks of a `chunk_blocks`-block chunk land in this part.
pub fn blocks_in_part(part: ChunkPartType, chunk_blocks: u32) -> u32 {
    match part {
        ChunkPartType::Standard => chunk_blocks,
        ChunkPartType::Xor { level, piece } => {
            let level = level as u32;
            if piece as u32 == level + 1 {
                // parity: one block per started stripe
                chunk_blocks.div_ceil(level)
            } else {
                let piece_index = (piece - 1) as u32;
                if chunk_blocks <= piece_index {
                    0
                } else {
                    (chunk_blocks - piece_index).div_ceil(level)
                }
            }
        }
    }
}

/// All parts of the layout `part` belongs to (the full cover it is one
/// member of): the single standard part, or all L+1 pieces of its level.
pub fn layout_siblings(part: ChunkPartType) -> Vec<ChunkPartType> {
    match part {
        ChunkPartType::Standard => vec![ChunkPartType::Standard],
        ChunkPartType::Xor { level, .. } => (1..=level + 1)
            .map(|piece| ChunkPartType::Xor { level, piece })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCKS_IN_CHUNK;

    fn xor(level: u8, piece: u8) -> ChunkPartType {
        ChunkPartType::Xor { level, piece }
    }

    #[test]
    fn stripe_sizes() {
        assert_eq!(stripe_size(ChunkPartType::Standard), 1);
        assert_eq!(stripe_size(xor(3, 1)), 3);
        assert_eq!(stripe_size(xor(9, 10)), 9);
    }

    #[test]
    fn parity_detection() {
        assert!(!is_parity(ChunkPartType::Standard));
        assert!(!is_parity(xor(3, 3)));
        assert!(is_parity(xor(3, 4)));
    }

    #[test]
    fn block_mapping_is_consistent() {
        for level in 2..=9u8 {
            for block in 0..200u32 {
                let piece = data_piece_for_block(level, block);
                let stripe = stripe_of_block(level, block);
                assert_eq!(block_at_stripe(xor(level, piece), stripe), Some(block));
            }
        }
    }

    #[test]
    fn part_block_counts_cover_the_chunk() {
        // Data piece counts over all pieces must sum to the chunk size.
        for level in 2..=9u8 {
            let total: u32 = (1..=level)
                .map(|piece| blocks_in_part(xor(level, piece), BLOCKS_IN_CHUNK))
                .sum();
            assert_eq!(total, BLOCKS_IN_CHUNK);
            assert_eq!(
                blocks_in_part(xor(level, level + 1), BLOCKS_IN_CHUNK),
                BLOCKS_IN_CHUNK.div_ceil(level as u32)
            );
        }
    }

    #[test]
    fn short_chunk_counts() {
        // A 10-block chunk at level 3: pieces hold 4, 3, 3 blocks, parity 4.
        assert_eq!(blocks_in_part(xor(3, 1), 10), 4);
        assert_eq!(blocks_in_part(xor(3, 2), 10), 3);
        assert_eq!(blocks_in_part(xor(3, 3), 10), 3);
        assert_eq!(blocks_in_part(xor(3, 4), 10), 4);
    }
}
