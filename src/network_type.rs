use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Mainnet,
    Testnet,
}

impl NetworkType {
    /// Frame marker preceding every block in `blk*.dat` files.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            NetworkType::Mainnet => [0xfa, 0xbf, 0xb5, 0xda],
            NetworkType::Testnet => [0x76, 0x65, 0x72, 0x74], // "vert"
        }
    }

    pub fn default_rpc_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 5888,
            NetworkType::Testnet => 15888,
        }
    }

    pub fn pubkey_address_prefix(&self) -> u8 {
        match self {
            NetworkType::Mainnet => 71,
            NetworkType::Testnet => 74,
        }
    }

    pub fn script_address_prefix(&self) -> u8 {
        match self {
            NetworkType::Mainnet => 5,
            NetworkType::Testnet => 196,
        }
    }

    pub fn bech32_hrp(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "vtc",
            NetworkType::Testnet => "tvtc",
        }
    }

    /// Trailing digit of the `block-filePosition-` record.
    pub fn testnet_flag(&self) -> char {
        match self {
            NetworkType::Mainnet => '0',
            NetworkType::Testnet => '1',
        }
    }

    pub fn from_testnet_flag(flag: char) -> Self {
        if flag == '1' {
            NetworkType::Testnet
        } else {
            NetworkType::Mainnet
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkType::Mainnet => write!(f, "Mainnet"),
            NetworkType::Testnet => write!(f, "Testnet"),
        }
    }
}
