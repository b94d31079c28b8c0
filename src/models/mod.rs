//! Core data model: positions, wallets, and their identifying enums.

pub mod position;
pub mod wallet;

pub use position::{
    distance_to_liquidation, strip_dex_prefix, Exchange, MarginType, Position, PositionKey, Side,
};
pub use wallet::{DiscoverySource, ScanFrequency, WalletRecord};
