//! Reader for the node's `blkNNNNN.dat` files.
//!
//! Each record in a block file is framed as:
//! ```text
//!   [4 bytes]  network magic
//!   [4 bytes]  block size (little-endian u32)
//!   [N bytes]  serialized block
//! ```
//! Offsets handed around by the indexer point at the first byte of the
//! serialized block, i.e. 8 bytes past the start of the frame.

use crate::error::ReaderError;
use crate::network_type::NetworkType;
use crate::types::{Block, Transaction, TransactionInput, TransactionOutput};
use bitcoin::block::Header;
use bitcoin::consensus::deserialize;
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

const HEADER_SIZE: usize = 80;
const FRAME_HEADER_SIZE: u64 = 8;

/// Location and linkage of one block, read without its transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockFrame {
    pub block_hash: String,
    pub previous_block_hash: String,
    pub file_name: String,
    pub offset: u64,
    pub size: u32,
}

pub struct BlockReader {
    blocks_dir: PathBuf,
}

impl BlockReader {
    pub fn new(blocks_dir: impl Into<PathBuf>) -> Self {
        Self {
            blocks_dir: blocks_dir.into(),
        }
    }

    /// `blk*.dat` file names in the blocks directory, in file order.
    pub fn list_block_files(&self) -> Result<Vec<String>, ReaderError> {
        let mut names: Vec<String> = fs::read_dir(&self.blocks_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_block_file_name(name))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Read the block whose serialized bytes start at `offset` in `file_name`.
    ///
    /// With `header_only` set, only the 80-byte header is read and the
    /// returned block carries no transactions.
    pub fn read_block(
        &self,
        file_name: &str,
        offset: u64,
        height: u64,
        network: NetworkType,
        header_only: bool,
    ) -> Result<Block, ReaderError> {
        if offset < FRAME_HEADER_SIZE {
            return Err(ReaderError::TruncatedFrame {
                file: file_name.to_string(),
                offset,
            });
        }
        let file = fs::File::open(self.blocks_dir.join(file_name))?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset - FRAME_HEADER_SIZE))?;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != network.magic_bytes() {
            return Err(ReaderError::BadMagic {
                file: file_name.to_string(),
                offset: offset - FRAME_HEADER_SIZE,
                magic: hex::encode(magic),
            });
        }
        let size = reader.read_u32::<LittleEndian>()?;
        if (size as usize) < HEADER_SIZE {
            return Err(ReaderError::TruncatedFrame {
                file: file_name.to_string(),
                offset,
            });
        }
        let to_read = if header_only {
            HEADER_SIZE
        } else {
            size as usize
        };
        let mut bytes = vec![0u8; to_read];
        reader
            .read_exact(&mut bytes)
            .map_err(|e| truncated_or_io(e, file_name, offset))?;

        let header: Header = deserialize(&bytes[..HEADER_SIZE]).map_err(|source| {
            ReaderError::Decode {
                what: "block header",
                source,
            }
        })?;

        let mut block = Block {
            block_hash: header.block_hash().to_string(),
            previous_block_hash: header.prev_blockhash.to_string(),
            height,
            time: header.time,
            bits: header.bits.to_consensus(),
            nonce: header.nonce,
            version: header.version.to_consensus(),
            merkle_root: header.merkle_root.to_string(),
            byte_size: u64::from(size),
            file_name: file_name.to_string(),
            file_position: offset,
            network,
            transactions: Vec::new(),
        };
        if header_only {
            return Ok(block);
        }

        let full: bitcoin::Block = deserialize(&bytes).map_err(|source| ReaderError::Decode {
            what: "block",
            source,
        })?;
        let mut tx_offset =
            offset + (HEADER_SIZE + compact_size_len(full.txdata.len() as u64)) as u64;
        for tx in &full.txdata {
            block.transactions.push(convert_transaction(tx, tx_offset));
            tx_offset += tx.total_size() as u64;
        }
        Ok(block)
    }

    /// Header pass over one block file. A frame cut short at the end of the
    /// file (the node still writing it) ends the pass without error.
    pub fn read_frames(
        &self,
        file_name: &str,
        network: NetworkType,
    ) -> Result<Vec<BlockFrame>, ReaderError> {
        let file = fs::File::open(self.blocks_dir.join(file_name))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut frames = Vec::new();
        let mut position = 0u64;

        while position + FRAME_HEADER_SIZE <= file_len {
            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if magic == [0u8; 4] {
                // Preallocated tail of the file.
                break;
            }
            if magic != network.magic_bytes() {
                return Err(ReaderError::BadMagic {
                    file: file_name.to_string(),
                    offset: position,
                    magic: hex::encode(magic),
                });
            }
            let size = reader.read_u32::<LittleEndian>()?;
            let offset = position + FRAME_HEADER_SIZE;
            if offset + u64::from(size) > file_len || (size as usize) < HEADER_SIZE {
                tracing::debug!(
                    "Incomplete block frame in {} at offset {}, stopping",
                    file_name,
                    position
                );
                break;
            }

            let mut header_bytes = [0u8; HEADER_SIZE];
            reader.read_exact(&mut header_bytes)?;
            let header: Header =
                deserialize(&header_bytes).map_err(|source| ReaderError::Decode {
                    what: "block header",
                    source,
                })?;
            reader.seek_relative(i64::from(size) - HEADER_SIZE as i64)?;

            frames.push(BlockFrame {
                block_hash: header.block_hash().to_string(),
                previous_block_hash: header.prev_blockhash.to_string(),
                file_name: file_name.to_string(),
                offset,
                size,
            });
            position = offset + u64::from(size);
        }
        Ok(frames)
    }
}

/// Decode a raw transaction as returned by `getrawtransaction`.
pub fn parse_transaction(bytes: &[u8]) -> Result<Transaction, ReaderError> {
    let tx: bitcoin::Transaction = deserialize(bytes).map_err(|source| ReaderError::Decode {
        what: "transaction",
        source,
    })?;
    Ok(convert_transaction(&tx, 0))
}

fn convert_transaction(tx: &bitcoin::Transaction, file_position: u64) -> Transaction {
    let tx_hash = tx.compute_txid().to_string();
    Transaction {
        inputs: tx
            .input
            .iter()
            .map(|input| TransactionInput {
                tx_hash: input.previous_output.txid.to_string(),
                txo_index: input.previous_output.vout,
                coinbase: input.previous_output.is_null(),
            })
            .collect(),
        outputs: tx
            .output
            .iter()
            .enumerate()
            .map(|(index, output)| TransactionOutput {
                tx_hash: tx_hash.clone(),
                index: index as u32,
                value: output.value.to_sat(),
                script: output.script_pubkey.to_bytes(),
            })
            .collect(),
        tx_hash,
        file_position,
    }
}

fn is_block_file_name(name: &str) -> bool {
    name.len() == 12
        && name.starts_with("blk")
        && name.ends_with(".dat")
        && name[3..8].bytes().all(|b| b.is_ascii_digit())
}

fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn truncated_or_io(error: std::io::Error, file_name: &str, offset: u64) -> ReaderError {
    if error.kind() == ErrorKind::UnexpectedEof {
        ReaderError::TruncatedFrame {
            file: file_name.to_string(),
            offset,
        }
    } else {
        ReaderError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::Version;
    use bitcoin::consensus::serialize;
    use bitcoin::hashes::Hash;
    use bitcoin::{
        Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, TxIn, TxMerkleNode,
        TxOut, Witness,
    };
    use std::io::Write;
    use std::path::Path;

    fn coinbase(tag: u8, value: u64) -> bitcoin::Transaction {
        bitcoin::Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x01, tag]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        }
    }

    fn block(prev: BlockHash, txdata: Vec<bitcoin::Transaction>) -> bitcoin::Block {
        bitcoin::Block {
            header: Header {
                version: Version::ONE,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_500_000_000,
                bits: CompactTarget::from_consensus(0x1e0f_fff0),
                nonce: 7,
            },
            txdata,
        }
    }

    fn write_frames(path: &Path, network: NetworkType, blocks: &[bitcoin::Block]) {
        let mut file = fs::File::create(path).unwrap();
        for block in blocks {
            let bytes = serialize(block);
            file.write_all(&network.magic_bytes()).unwrap();
            file.write_all(&(bytes.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&bytes).unwrap();
        }
        // Zero padding like a preallocated file.
        file.write_all(&[0u8; 16]).unwrap();
    }

    #[test]
    fn test_frames_and_full_block_read() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = block(BlockHash::all_zeros(), vec![coinbase(0, 50)]);
        let next = block(
            genesis.block_hash(),
            vec![coinbase(1, 50), coinbase(2, 25)],
        );
        write_frames(
            &dir.path().join("blk00000.dat"),
            NetworkType::Mainnet,
            &[genesis.clone(), next.clone()],
        );

        let reader = BlockReader::new(dir.path());
        assert_eq!(reader.list_block_files().unwrap(), vec!["blk00000.dat"]);

        let frames = reader
            .read_frames("blk00000.dat", NetworkType::Mainnet)
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].offset, 8);
        assert_eq!(frames[1].previous_block_hash, genesis.block_hash().to_string());

        let read = reader
            .read_block("blk00000.dat", frames[1].offset, 1, NetworkType::Mainnet, false)
            .unwrap();
        assert_eq!(read.block_hash, next.block_hash().to_string());
        assert_eq!(read.transactions.len(), 2);
        assert_eq!(read.byte_size, u64::from(frames[1].size));

        // Each transaction offset points at its own serialized bytes.
        let raw = fs::read(dir.path().join("blk00000.dat")).unwrap();
        for (tx, original) in read.transactions.iter().zip(&next.txdata) {
            let start = tx.file_position as usize;
            let bytes = serialize(original);
            assert_eq!(&raw[start..start + bytes.len()], bytes.as_slice());
            assert_eq!(tx.tx_hash, original.compute_txid().to_string());
            assert!(tx.inputs[0].coinbase);
        }
    }

    #[test]
    fn test_header_only_read_skips_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = block(BlockHash::all_zeros(), vec![coinbase(0, 50)]);
        write_frames(
            &dir.path().join("blk00000.dat"),
            NetworkType::Testnet,
            &[genesis.clone()],
        );

        let reader = BlockReader::new(dir.path());
        let header = reader
            .read_block("blk00000.dat", 8, 0, NetworkType::Testnet, true)
            .unwrap();
        assert!(header.transactions.is_empty());
        assert_eq!(header.nonce, 7);
        assert_eq!(header.time, 1_500_000_000);
    }

    #[test]
    fn test_wrong_network_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = block(BlockHash::all_zeros(), vec![coinbase(0, 50)]);
        write_frames(
            &dir.path().join("blk00000.dat"),
            NetworkType::Testnet,
            &[genesis],
        );

        let reader = BlockReader::new(dir.path());
        assert!(matches!(
            reader.read_frames("blk00000.dat", NetworkType::Mainnet),
            Err(ReaderError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_frame_shorter_than_header_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blk00000.dat");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&NetworkType::Mainnet.magic_bytes()).unwrap();
        file.write_all(&40u32.to_le_bytes()).unwrap();
        file.write_all(&[0xab; 40]).unwrap();
        drop(file);

        let reader = BlockReader::new(dir.path());
        for header_only in [false, true] {
            assert!(matches!(
                reader.read_block("blk00000.dat", 8, 0, NetworkType::Mainnet, header_only),
                Err(ReaderError::TruncatedFrame { offset: 8, .. })
            ));
        }
    }

    #[test]
    fn test_parse_transaction_rejects_garbage() {
        let tx = coinbase(3, 1000);
        let parsed = parse_transaction(&serialize(&tx)).unwrap();
        assert_eq!(parsed.outputs[0].value, 1000);
        assert_eq!(parsed.outputs[0].tx_hash, parsed.tx_hash);

        assert!(parse_transaction(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_block_file_names() {
        assert!(is_block_file_name("blk00042.dat"));
        assert!(!is_block_file_name("rev00042.dat"));
        assert!(!is_block_file_name("blk0004.dat"));
    }
}
