//! Network parameter definitions.

use crate::constants::{CHAIN_SERVICE_PROTOCOL, CHAIN_SERVICE_PROTOCOL_VERSION};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// A hard-coded block ID the chain is known to pass through. Blocks at or
/// below the last checkpoint are synced without proof or signature
/// validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    pub block_id: Hash256,
}

#[derive(Clone, Debug)]
pub struct NetworkParams {
    pub network: Network,
    pub name: &'static str,
    /// Prefix for every protocol id spoken on this network.
    pub protocol_prefix: &'static str,
    pub genesis_id: Hash256,
    /// Checkpoints in strictly ascending height order.
    pub checkpoints: Vec<Checkpoint>,
    pub default_port: u16,
}

impl NetworkParams {
    /// Full protocol id of the chain service on this network.
    pub fn chain_service_protocol(&self) -> String {
        format!(
            "{}{}{}",
            self.protocol_prefix, CHAIN_SERVICE_PROTOCOL, CHAIN_SERVICE_PROTOCOL_VERSION
        )
    }

    /// The last (highest) checkpoint, if any are configured.
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}

pub fn network_params(network: Network) -> NetworkParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn mainnet_params() -> NetworkParams {
    NetworkParams {
        network: Network::Mainnet,
        name: "mainnet",
        protocol_prefix: "/noct",
        genesis_id: hash256_from_hex(
            "7a5c0f2e9b6d4a1803f5c7e2910b8d6f4e3a2c1d0908b7a6f5e4d3c2b1a09182",
        )
        .expect("mainnet genesis id"),
        checkpoints: parse_checkpoints(&[
            (
                10_000,
                "3f8e2d1c0b9a78695847362514038f7e6d5c4b3a29180706f5e4d3c2b1a0918f",
            ),
            (
                50_000,
                "91d4b7a2c8e6f0135d9b8a7c6e5f4d3b2a190807e6d5c4b3a2918070605f4e3d",
            ),
            (
                120_000,
                "c2a1908f7e6d5c4b3a2918070605f4e3d2c1b0a998877665544332211008fedc",
            ),
        ]),
        default_port: 9001,
    }
}

fn testnet_params() -> NetworkParams {
    NetworkParams {
        network: Network::Testnet,
        name: "testnet",
        protocol_prefix: "/noct/testnet",
        genesis_id: hash256_from_hex(
            "1b2c3d4e5f60718293a4b5c6d7e8f9000112233445566778899aabbccddeeff0",
        )
        .expect("testnet genesis id"),
        checkpoints: parse_checkpoints(&[(
            25_000,
            "8899aabbccddeeff00112233445566771b2c3d4e5f60718293a4b5c6d7e8f900",
        )]),
        default_port: 9002,
    }
}

fn regtest_params() -> NetworkParams {
    NetworkParams {
        network: Network::Regtest,
        name: "regtest",
        protocol_prefix: "/noct/regtest",
        genesis_id: hash256_from_hex(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .expect("regtest genesis id"),
        checkpoints: Vec::new(),
        default_port: 9003,
    }
}

fn parse_checkpoints(entries: &[(u32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hex)| Checkpoint {
            height: *height,
            block_id: hash256_from_hex(hex).expect("checkpoint id"),
        })
        .collect()
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string is not 64 characters"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
