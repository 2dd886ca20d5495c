//! Payable-address extraction from output scripts.

use crate::network_type::NetworkType;
use bitcoin::bech32::{segwit, Fe32, Hrp};
use bitcoin::script::Instruction;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::{base58, Script};

pub trait ScriptSolver: Send + Sync {
    /// Addresses an output script pays to. Unrecognised scripts yield none.
    fn addresses(&self, script: &[u8]) -> Vec<String>;

    fn is_valid_address(&self, address: &str) -> bool;
}

/// Solver for the standard Vertcoin script templates.
#[derive(Clone, Debug)]
pub struct StandardSolver {
    network: NetworkType,
}

impl StandardSolver {
    pub fn new(network: NetworkType) -> Self {
        Self { network }
    }

    fn base58(&self, prefix: u8, hash: &[u8]) -> String {
        let mut payload = Vec::with_capacity(1 + hash.len());
        payload.push(prefix);
        payload.extend_from_slice(hash);
        base58::encode_check(&payload)
    }

    fn pubkey_address(&self, pubkey: &[u8]) -> String {
        let hash = hash160::Hash::hash(pubkey);
        self.base58(self.network.pubkey_address_prefix(), hash.as_byte_array())
    }

    fn witness_address(&self, script: &Script) -> Option<String> {
        let bytes = script.as_bytes();
        let version = match bytes[0] {
            0x00 => 0,
            op @ 0x51..=0x60 => op - 0x50,
            _ => return None,
        };
        let hrp = Hrp::parse(self.network.bech32_hrp()).ok()?;
        let version = Fe32::try_from(version).ok()?;
        segwit::encode(hrp, version, &bytes[2..]).ok()
    }

    fn multisig_addresses(&self, script: &Script) -> Vec<String> {
        let mut pubkeys = Vec::new();
        let mut ends_with_checkmultisig = false;
        for instruction in script.instructions() {
            match instruction {
                Ok(Instruction::PushBytes(push)) => {
                    let bytes = push.as_bytes();
                    if bytes.len() == 33 || bytes.len() == 65 {
                        pubkeys.push(bytes.to_vec());
                    }
                    ends_with_checkmultisig = false;
                }
                Ok(Instruction::Op(op)) => ends_with_checkmultisig = op == OP_CHECKMULTISIG,
                Err(_) => return Vec::new(),
            }
        }
        if !ends_with_checkmultisig {
            return Vec::new();
        }
        pubkeys.iter().map(|pk| self.pubkey_address(pk)).collect()
    }
}

impl ScriptSolver for StandardSolver {
    fn addresses(&self, script: &[u8]) -> Vec<String> {
        if script.is_empty() {
            return Vec::new();
        }
        let script = Script::from_bytes(script);
        let bytes = script.as_bytes();

        if script.is_p2pkh() {
            vec![self.base58(self.network.pubkey_address_prefix(), &bytes[3..23])]
        } else if script.is_p2sh() {
            vec![self.base58(self.network.script_address_prefix(), &bytes[2..22])]
        } else if script.is_p2pk() {
            let len = bytes[0] as usize;
            vec![self.pubkey_address(&bytes[1..1 + len])]
        } else if script.is_witness_program() {
            self.witness_address(script).into_iter().collect()
        } else if script.is_op_return() {
            Vec::new()
        } else {
            self.multisig_addresses(script)
        }
    }

    fn is_valid_address(&self, address: &str) -> bool {
        if let Ok(payload) = base58::decode_check(address) {
            return payload.len() == 21
                && (payload[0] == self.network.pubkey_address_prefix()
                    || payload[0] == self.network.script_address_prefix());
        }
        match segwit::decode(address) {
            Ok((hrp, _, _)) => hrp.to_string() == self.network.bech32_hrp(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh(byte: u8) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[byte; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    #[test]
    fn test_p2pkh_mainnet_address() {
        let solver = StandardSolver::new(NetworkType::Mainnet);
        let addresses = solver.addresses(&p2pkh(7));
        assert_eq!(addresses.len(), 1);
        assert!(addresses[0].starts_with('V'));

        let payload = base58::decode_check(&addresses[0]).unwrap();
        assert_eq!(payload[0], 71);
        assert_eq!(&payload[1..], &[7u8; 20]);
        assert!(solver.is_valid_address(&addresses[0]));
    }

    #[test]
    fn test_network_prefixes_differ() {
        let main = StandardSolver::new(NetworkType::Mainnet).addresses(&p2pkh(1));
        let test = StandardSolver::new(NetworkType::Testnet).addresses(&p2pkh(1));
        assert_ne!(main, test);
        assert!(!StandardSolver::new(NetworkType::Testnet).is_valid_address(&main[0]));
    }

    #[test]
    fn test_p2sh_address() {
        let mut script = vec![0xa9, 0x14];
        script.extend_from_slice(&[3u8; 20]);
        script.push(0x87);
        let solver = StandardSolver::new(NetworkType::Mainnet);
        let addresses = solver.addresses(&script);
        let payload = base58::decode_check(&addresses[0]).unwrap();
        assert_eq!(payload[0], 5);
    }

    #[test]
    fn test_p2wpkh_bech32_address() {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&[9u8; 20]);
        let solver = StandardSolver::new(NetworkType::Mainnet);
        let addresses = solver.addresses(&script);
        assert_eq!(addresses.len(), 1);
        assert!(addresses[0].starts_with("vtc1q"));
        assert!(solver.is_valid_address(&addresses[0]));
    }

    #[test]
    fn test_p2pk_resolves_to_pubkey_hash_address() {
        let pubkey = {
            let mut pk = vec![0x02];
            pk.extend_from_slice(&[5u8; 32]);
            pk
        };
        let mut script = vec![33];
        script.extend_from_slice(&pubkey);
        script.push(0xac);

        let solver = StandardSolver::new(NetworkType::Mainnet);
        let addresses = solver.addresses(&script);
        assert_eq!(addresses, vec![solver.pubkey_address(&pubkey)]);
    }

    #[test]
    fn test_bare_multisig_yields_every_key() {
        let mut script = vec![0x51];
        for fill in [4u8, 6u8] {
            script.push(33);
            script.push(0x03);
            script.extend_from_slice(&[fill; 32]);
        }
        script.extend_from_slice(&[0x52, 0xae]);

        let solver = StandardSolver::new(NetworkType::Mainnet);
        assert_eq!(solver.addresses(&script).len(), 2);
    }

    #[test]
    fn test_op_return_and_garbage_have_no_address() {
        let solver = StandardSolver::new(NetworkType::Mainnet);
        assert!(solver.addresses(&[0x6a, 0x04, 1, 2, 3, 4]).is_empty());
        assert!(solver.addresses(&[]).is_empty());
        assert!(solver.addresses(&[0x51]).is_empty());
        assert!(!solver.is_valid_address("not-an-address"));
    }
}
