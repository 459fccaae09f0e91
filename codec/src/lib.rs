//! Pure codec for the escrow smart contract.
//!
//! Everything in this crate is deterministic and I/O-free: the Plutus data
//! model with its CBOR wire form, the escrow datum and redeemer encodings,
//! transaction metadata construction, script address derivation and the
//! transaction-body builder. The server crate layers chain access and
//! persistence on top.

pub mod address;
pub mod datum;
pub mod error;
pub mod metadata;
pub mod network;
pub mod plutus;
pub mod redeemer;
pub mod script;
pub mod tx;

pub use address::{Address, Credential};
pub use datum::{EscrowDatum, SmartContractState};
pub use error::CodecError;
pub use metadata::{string_to_metadata, MetadataValue};
pub use network::Network;
pub use plutus::PlutusData;
pub use redeemer::Redeemer;
pub use script::{policy_id, script_address, script_hash};
pub use tx::{TxBuilder, TxInput, TxOutput, Value};
