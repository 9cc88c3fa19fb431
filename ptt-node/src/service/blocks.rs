/// Content blocks.
///
/// Long content (article bodies, messages, media) is split into blocks of
/// `N_LINE_IN_BLOCK` lines, each line at most `N_BYTE_IN_BLOCK` bytes. Block
/// ids are derived from the object and the writing oplog, so replay
/// recreates identical blocks.
use serde::{Deserialize, Serialize};

use ptt_protocol::limits::{N_BYTE_IN_BLOCK, N_LINE_IN_BLOCK};
use ptt_protocol::PttID;

use super::{Result, ServiceError};

/// Reference kept on the object.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub id: PttID,
    pub hash: [u8; 32],
    /// Lines stored under the block.
    pub n_sub: u32,
}

/// A block with its lines, as written to `{entityID}/block/{objID}/{blockID}/{i}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub id: PttID,
    pub lines: Vec<Vec<u8>>,
}

impl Block {
    pub fn hash(&self) -> [u8; 32] {
        hash_lines(&self.lines)
    }

    pub fn to_ref(&self) -> BlockRef {
        BlockRef {
            id: self.id,
            hash: self.hash(),
            n_sub: self.lines.len() as u32,
        }
    }
}

pub fn hash_lines(lines: &[Vec<u8>]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ptt-block-v1");
    for line in lines {
        hasher.update(&(line.len() as u32).to_be_bytes());
        hasher.update(line);
    }
    *hasher.finalize().as_bytes()
}

fn block_id(obj_id: &PttID, log_id: &PttID, index: usize) -> PttID {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ptt-block-id-v1");
    hasher.update(obj_id.as_bytes());
    hasher.update(log_id.as_bytes());
    hasher.update(&(index as u32).to_be_bytes());
    let mut postfix = [0u8; 16];
    postfix.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    PttID::from_parts(obj_id.addr(), postfix)
}

pub fn check_lines(lines: &[Vec<u8>]) -> Result<()> {
    match lines.iter().find(|l| l.len() > N_BYTE_IN_BLOCK) {
        Some(line) => Err(ServiceError::LineTooLong(line.len())),
        None => Ok(()),
    }
}

/// Split `lines` into blocks for object `obj_id` written by `log_id`.
pub fn make_blocks(obj_id: &PttID, log_id: &PttID, lines: &[Vec<u8>]) -> Result<Vec<Block>> {
    check_lines(lines)?;
    Ok(lines
        .chunks(N_LINE_IN_BLOCK)
        .enumerate()
        .map(|(i, chunk)| Block {
            id: block_id(obj_id, log_id, i),
            lines: chunk.to_vec(),
        })
        .collect())
}

/// Split raw bytes into lines of at most `N_BYTE_IN_BLOCK` bytes.
pub fn split_bytes(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(N_BYTE_IN_BLOCK).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_blocks_chunks_by_lines() {
        let obj = PttID::random();
        let log = PttID::random();
        let lines: Vec<Vec<u8>> = (0..45).map(|i| format!("line {}", i).into_bytes()).collect();
        let blocks = make_blocks(&obj, &log, &lines).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].lines.len(), N_LINE_IN_BLOCK);
        assert_eq!(blocks[2].lines.len(), 5);
        assert!(blocks.iter().all(|b| b.id.same_addr(&obj)));

        // same inputs, same ids and hashes
        let again = make_blocks(&obj, &log, &lines).unwrap();
        assert_eq!(blocks, again);
        assert_ne!(blocks[0].hash(), blocks[1].hash());
    }

    #[test]
    fn test_line_limit() {
        let long = vec![0u8; N_BYTE_IN_BLOCK + 1];
        assert_eq!(
            make_blocks(&PttID::random(), &PttID::random(), &[long]),
            Err(ServiceError::LineTooLong(N_BYTE_IN_BLOCK + 1))
        );
        assert_eq!(split_bytes(&vec![1u8; N_BYTE_IN_BLOCK * 2 + 1]).len(), 3);
    }
}
