//! Key schema of the index.
//!
//! Every numeric field embedded in a key is zero-padded decimal of fixed
//! width so that lexicographic key order equals numeric order within a
//! prefix. Sequenced families share the `{prefix}-{seq:08}` shape and are
//! enumerated with [`sequence_range`].

use crate::error::IndexerError;
use crate::network_type::NetworkType;

pub const HIGHEST_BLOCK_KEY: &str = "highestblock";

/// Width of sequence numbers in `{prefix}-{seq}` keys.
pub const SEQUENCE_WIDTH: usize = 8;
pub const MAX_SEQUENCE: u64 = 99_999_999;

const HASH_HEX_LEN: usize = 64;
const FILE_NAME_LEN: usize = 12;

pub fn height_field(height: u64) -> String {
    format!("{:08}", height)
}

pub fn block_height_key(height: u64) -> String {
    format!("block-{:08}", height)
}

pub fn block_hash_key(block_hash: &str) -> String {
    format!("block-hash-{}", block_hash)
}

pub fn block_file_position_key(height: u64) -> String {
    format!("block-filePosition-{:08}", height)
}

pub fn block_file_position_value(file_name: &str, offset: u64, network: NetworkType) -> String {
    format!("{}{:012}{}", file_name, offset, network.testnet_flag())
}

pub fn block_time_key(height: u64) -> String {
    format!("block-time-{:08}", height)
}

pub fn block_size_key(height: u64) -> String {
    format!("block-size-{:08}", height)
}

pub fn block_tx_count_key(height: u64) -> String {
    format!("block-txcount-{:08}", height)
}

pub fn block_tx_key(block_hash: &str, position: usize) -> String {
    format!("block-{}-tx-{:08}", block_hash, position)
}

pub fn tx_file_position_key(tx_hash: &str) -> String {
    format!("tx-filePosition-{}", tx_hash)
}

pub fn tx_file_position_value(file_name: &str, offset: u64) -> String {
    format!("{}{:012}", file_name, offset)
}

pub fn tx_block_key(tx_hash: &str) -> String {
    format!("tx-{}-block", tx_hash)
}

pub fn address_txo_prefix(address: &str) -> String {
    format!("{}-txo", address)
}

pub fn txo_value(tx_hash: &str, vout: u32, height: u64, value: u64) -> String {
    format!("{}{:08}{:08}{}", tx_hash, vout, height, value)
}

/// Output → owning address reverse lookup.
pub fn txo_address_key(tx_hash: &str, vout: u32) -> String {
    format!("{}{:08}", tx_hash, vout)
}

pub fn block_txo_prefix(block_hash: &str) -> String {
    format!("{}-txo", block_hash)
}

pub fn spent_key(tx_hash: &str, vout: u32) -> String {
    format!("txo-{}-{:08}-spent", tx_hash, vout)
}

pub fn spent_value(block_hash: &str, spending_tx_hash: &str) -> String {
    format!("{}-{}", block_hash, spending_tx_hash)
}

pub fn block_txo_spent_prefix(block_hash: &str) -> String {
    format!("{}-txospent", block_hash)
}

pub fn block_assertion_prefix(block_hash: &str) -> String {
    format!("{}-assert", block_hash)
}

pub fn esign_out_prefix(from_address: &str) -> String {
    format!("esign-out-{}", from_address)
}

pub fn esign_in_prefix(to_address: &str) -> String {
    format!("esign-in-{}", to_address)
}

pub fn identity_prefix(to_address: &str) -> String {
    format!("ident-{}", to_address)
}

pub fn assertion_value(
    counterparty: &str,
    tx_id: &str,
    height: u64,
    time: u64,
    script: &[u8],
) -> String {
    format!(
        "{}{}{:012}{:012}{}",
        counterparty,
        tx_id,
        height,
        time,
        hex::encode(script)
    )
}

pub fn sequenced_key(prefix: &str, sequence: u64) -> String {
    format!("{}-{:08}", prefix, sequence)
}

/// Half-open key range `[prefix-00000001, prefix-99999999)`.
pub fn sequence_range(prefix: &str) -> (String, String) {
    (sequenced_key(prefix, 1), sequenced_key(prefix, MAX_SEQUENCE))
}

/// Sequence number of a `{prefix}-{seq:08}` key.
pub fn sequence_of(key: &str) -> Option<u64> {
    let digits = key.get(key.len().checked_sub(SEQUENCE_WIDTH)?..)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn malformed(key: &str, reason: impl Into<String>) -> IndexerError {
    IndexerError::MalformedRecord {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_number(key: &str, field: &str, digits: &str) -> Result<u64, IndexerError> {
    digits
        .parse()
        .map_err(|_| malformed(key, format!("{} is not a number: {:?}", field, digits)))
}

/// Value of an `{address}-txo-{seq}` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxoRecord {
    pub tx_hash: String,
    pub vout: u32,
    pub height: u64,
    pub value: u64,
}

impl TxoRecord {
    pub fn parse(key: &str, value: &str) -> Result<Self, IndexerError> {
        if value.len() <= HASH_HEX_LEN + 16 || !value.is_ascii() {
            return Err(malformed(key, "txo record too short"));
        }
        let vout = parse_number(key, "vout", &value[64..72])?;
        Ok(Self {
            tx_hash: value[..64].to_string(),
            vout: u32::try_from(vout).map_err(|_| malformed(key, "vout out of range"))?,
            height: parse_number(key, "height", &value[72..80])?,
            value: parse_number(key, "value", &value[80..])?,
        })
    }
}

/// Value of a `txo-{txHash}-{vout}-spent` marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendRecord {
    pub block_hash: String,
    pub spending_tx_hash: String,
}

impl SpendRecord {
    pub fn parse(key: &str, value: &str) -> Result<Self, IndexerError> {
        match value.split_once('-') {
            Some((block_hash, spending)) if !block_hash.is_empty() && !spending.is_empty() => {
                Ok(Self {
                    block_hash: block_hash.to_string(),
                    spending_tx_hash: spending.to_string(),
                })
            }
            _ => Err(malformed(key, "spend marker is not blockHash-txHash")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilePosition {
    pub file_name: String,
    pub offset: u64,
    pub network: NetworkType,
}

impl FilePosition {
    /// Parse `block-filePosition-` (with network flag) or `tx-filePosition-`
    /// (without) values.
    pub fn parse(key: &str, value: &str) -> Result<Self, IndexerError> {
        let fixed = FILE_NAME_LEN + 12;
        if value.len() < fixed || !value.is_ascii() {
            return Err(malformed(key, "file position too short"));
        }
        let network = match value[fixed..].chars().next() {
            Some(flag) => NetworkType::from_testnet_flag(flag),
            None => NetworkType::Mainnet,
        };
        Ok(Self {
            file_name: value[..FILE_NAME_LEN].to_string(),
            offset: parse_number(key, "offset", &value[FILE_NAME_LEN..fixed])?,
            network,
        })
    }
}

/// Value of an `esign-out-`, `esign-in-` or `ident-` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertionRecord {
    pub counterparty: String,
    pub tx_id: String,
    pub height: u64,
    pub time: u64,
    pub script_hex: String,
}

impl AssertionRecord {
    /// The counterparty address and the script are both variable length, so
    /// the split point is the first one whose address part validates.
    pub fn parse(
        key: &str,
        value: &str,
        is_address: impl Fn(&str) -> bool,
    ) -> Result<Self, IndexerError> {
        let fixed = HASH_HEX_LEN + 24;
        if !value.is_ascii() || value.len() < fixed + 1 {
            return Err(malformed(key, "assertion record too short"));
        }
        for split in 1..=value.len() - fixed {
            let tx_id = &value[split..split + HASH_HEX_LEN];
            let numbers = &value[split + HASH_HEX_LEN..split + fixed];
            let script_hex = &value[split + fixed..];
            if !tx_id.bytes().all(|b| b.is_ascii_hexdigit())
                || !numbers.bytes().all(|b| b.is_ascii_digit())
                || script_hex.len() % 2 != 0
                || !script_hex.bytes().all(|b| b.is_ascii_hexdigit())
                || !is_address(&value[..split])
            {
                continue;
            }
            return Ok(Self {
                counterparty: value[..split].to_string(),
                tx_id: tx_id.to_string(),
                height: parse_number(key, "height", &numbers[..12])?,
                time: parse_number(key, "time", &numbers[12..])?,
                script_hex: script_hex.to_string(),
            });
        }
        Err(malformed(key, "no valid address prefix"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u64) -> String {
        format!("{:064x}", n)
    }

    #[test]
    fn test_block_keys_are_zero_padded() {
        assert_eq!(block_height_key(100), "block-00000100");
        assert_eq!(block_time_key(7), "block-time-00000007");
        assert_eq!(block_tx_key("ab", 3), "block-ab-tx-00000003");
        assert_eq!(
            block_file_position_value("blk00001.dat", 1234, NetworkType::Testnet),
            "blk00001.dat0000000012341"
        );
    }

    #[test]
    fn test_lexicographic_order_matches_numeric_order() {
        let mut keys: Vec<String> = [9, 10, 100, 2, 99_999]
            .iter()
            .map(|n| sequenced_key("Vaddr-txo", *n))
            .collect();
        keys.sort();
        let sorted: Vec<u64> = keys.iter().filter_map(|k| sequence_of(k)).collect();
        assert_eq!(sorted, vec![2, 9, 10, 100, 99_999]);
    }

    #[test]
    fn test_sequence_range_bounds() {
        let (start, limit) = sequence_range("esign-out-Vabc");
        assert_eq!(start, "esign-out-Vabc-00000001");
        assert_eq!(limit, "esign-out-Vabc-99999999");
        assert_eq!(sequence_of(&start), Some(1));
        assert_eq!(sequence_of("short"), None);
    }

    #[test]
    fn test_txo_record_parse() {
        let value = txo_value(&hash(5), 3, 100, 5000);
        let record = TxoRecord::parse("Va-txo-00000001", &value).unwrap();
        assert_eq!(record.tx_hash, hash(5));
        assert_eq!(record.vout, 3);
        assert_eq!(record.height, 100);
        assert_eq!(record.value, 5000);

        assert!(TxoRecord::parse("k", "deadbeef").is_err());
    }

    #[test]
    fn test_spend_record_parse() {
        let value = spent_value(&hash(1), &hash(2));
        let record = SpendRecord::parse("k", &value).unwrap();
        assert_eq!(record.block_hash, hash(1));
        assert_eq!(record.spending_tx_hash, hash(2));
        assert!(SpendRecord::parse("k", "nodash").is_err());
    }

    #[test]
    fn test_file_position_parse() {
        let value = block_file_position_value("blk00002.dat", 77, NetworkType::Testnet);
        let position = FilePosition::parse("k", &value).unwrap();
        assert_eq!(position.file_name, "blk00002.dat");
        assert_eq!(position.offset, 77);
        assert_eq!(position.network, NetworkType::Testnet);

        let tx_position = FilePosition::parse("k", &tx_file_position_value("blk00002.dat", 9)).unwrap();
        assert_eq!(tx_position.offset, 9);
        assert_eq!(tx_position.network, NetworkType::Mainnet);
    }

    #[test]
    fn test_assertion_record_parse_uses_address_check() {
        let address = "Vt1abcdef";
        let value = assertion_value(address, &hash(9), 12, 1_500_000_000, &[0x6a, 0x01]);
        let record = AssertionRecord::parse("k", &value, |a| a == address).unwrap();
        assert_eq!(record.counterparty, address);
        assert_eq!(record.tx_id, hash(9));
        assert_eq!(record.height, 12);
        assert_eq!(record.time, 1_500_000_000);
        assert_eq!(record.script_hex, "6a01");

        assert!(AssertionRecord::parse("k", &value, |_| false).is_err());
    }
}
