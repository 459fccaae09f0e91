//! Deterministic transaction-body builder.
//!
//! Builds the CBOR transaction form the submit endpoint accepts: body,
//! witness set, validity flag and auxiliary data. The builder is pure; the
//! caller supplies already-selected inputs, execution-unit budgets and
//! witnesses. Identical inputs always produce identical bytes, which is what
//! makes fee estimation (build, measure, rebuild) and the engine's
//! crash-recovery story (re-derive the tx id from the stored body) work.

use crate::address::Address;
use crate::error::CodecError;
use crate::metadata::TxMetadata;
use crate::network::Network;
use crate::plutus::{write_head, PlutusData};
use crate::script::blake2b_256;

/// Linear fee coefficient (lovelace per byte).
pub const FEE_PER_BYTE: u64 = 44;
/// Constant fee term in lovelace.
pub const FEE_CONSTANT: u64 = 155_381;
/// Post-signing size margin: two vkey witnesses plus CBOR framing.
const WITNESS_SIZE_MARGIN: usize = 2 * 102 + 16;

/// Multi-asset value attached to an output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Value {
    pub lovelace: u64,
    /// `(policy_id_hex ++ asset_name_hex, amount)` pairs, canonical order.
    pub assets: Vec<(String, u64)>,
}

impl Value {
    pub fn lovelace_only(lovelace: u64) -> Self {
        Value {
            lovelace,
            assets: Vec::new(),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.assets.is_empty() {
            write_head(out, 0, self.lovelace);
            return Ok(());
        }
        write_head(out, 4, 2);
        write_head(out, 0, self.lovelace);
        encode_multiasset(&self.assets, out, |amount| amount)
    }
}

/// A transaction input reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxInput {
    pub tx_hash: [u8; 32],
    pub index: u32,
}

impl TxInput {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_head(out, 4, 2);
        write_head(out, 2, 32);
        out.extend_from_slice(&self.tx_hash);
        write_head(out, 0, self.index as u64);
    }
}

/// A transaction output with optional inline datum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub address: String,
    pub value: Value,
    pub inline_datum: Option<PlutusData>,
}

impl TxOutput {
    pub fn new(address: impl Into<String>, value: Value) -> Self {
        TxOutput {
            address: address.into(),
            value,
            inline_datum: None,
        }
    }

    pub fn with_datum(mut self, datum: PlutusData) -> Self {
        self.inline_datum = Some(datum);
        self
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let (address, network) = Address::from_bech32(&self.address)?;
        let entries = if self.inline_datum.is_some() { 3 } else { 2 };
        write_head(out, 5, entries);
        write_head(out, 0, 0);
        let addr_bytes = address.to_bytes(network);
        write_head(out, 2, addr_bytes.len() as u64);
        out.extend_from_slice(&addr_bytes);
        write_head(out, 0, 1);
        self.value.encode_into(out)?;
        if let Some(datum) = &self.inline_datum {
            write_head(out, 0, 2);
            // datum option: [1, #6.24(bytes .cbor data)]
            write_head(out, 4, 2);
            write_head(out, 0, 1);
            write_head(out, 6, 24);
            let encoded = datum.encode();
            write_head(out, 2, encoded.len() as u64);
            out.extend_from_slice(&encoded);
        }
        Ok(())
    }
}

/// Execution-unit budget for one redeemer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExUnits {
    pub mem: u64,
    pub steps: u64,
}

/// What a redeemer points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemerPurpose {
    Spend,
    Mint,
}

impl RedeemerPurpose {
    fn tag(&self) -> u64 {
        match self {
            RedeemerPurpose::Spend => 0,
            RedeemerPurpose::Mint => 1,
        }
    }
}

/// A redeemer entry in the witness set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemerEntry {
    pub purpose: RedeemerPurpose,
    pub input_index: u32,
    pub data: PlutusData,
    pub ex_units: ExUnits,
}

/// An ed25519 vkey witness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VkeyWitness {
    pub vkey: [u8; 32],
    pub signature: [u8; 64],
}

/// Builder for the escrow engine's transactions.
///
/// Inputs are sorted on build so the body is independent of selection order.
#[derive(Debug, Clone, Default)]
pub struct TxBuilder {
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    collateral: Vec<TxInput>,
    required_signers: Vec<[u8; 28]>,
    /// `(policy_id_hex ++ asset_name_hex, signed amount)`; negative burns.
    mint: Vec<(String, i64)>,
    attached_script: Option<Vec<u8>>,
    redeemers: Vec<RedeemerEntry>,
    metadata: TxMetadata,
    validity_start_slot: Option<u64>,
    ttl_slot: Option<u64>,
    fee: u64,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, input: TxInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = TxInput>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn output(mut self, output: TxOutput) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn collateral(mut self, input: TxInput) -> Self {
        self.collateral.push(input);
        self
    }

    pub fn required_signer(mut self, key_hash: [u8; 28]) -> Self {
        self.required_signers.push(key_hash);
        self
    }

    pub fn mint(mut self, unit: impl Into<String>, amount: i64) -> Self {
        self.mint.push((unit.into(), amount));
        self
    }

    pub fn attach_script(mut self, compiled: Vec<u8>) -> Self {
        self.attached_script = Some(compiled);
        self
    }

    pub fn redeemer(mut self, entry: RedeemerEntry) -> Self {
        self.redeemers.push(entry);
        self
    }

    pub fn metadata(mut self, metadata: TxMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validity window around `now_ms`: the transaction is valid from
    /// `now - slack` to `now + slack` in network slots.
    pub fn validity_window(mut self, network: Network, now_ms: i64, slack_secs: i64) -> Self {
        self.validity_start_slot = Some(network.slot_at(now_ms - slack_secs * 1000));
        self.ttl_slot = Some(network.slot_at(now_ms + slack_secs * 1000));
        self
    }

    pub fn fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    pub fn current_fee(&self) -> u64 {
        self.fee
    }

    /// Replace all redeemer budgets with evaluated ones, positionally.
    pub fn apply_ex_units(&mut self, budgets: &[ExUnits]) -> Result<(), CodecError> {
        if budgets.len() != self.redeemers.len() {
            return Err(CodecError::TxBuild(format!(
                "{} budgets for {} redeemers",
                budgets.len(),
                self.redeemers.len()
            )));
        }
        for (entry, budget) in self.redeemers.iter_mut().zip(budgets) {
            entry.ex_units = *budget;
        }
        Ok(())
    }

    /// Estimate the fee from the current shape and bake it in.
    pub fn estimate_and_set_fee(&mut self) -> Result<u64, CodecError> {
        let unsigned = self.build_unsigned()?;
        let size = unsigned.len() + WITNESS_SIZE_MARGIN;
        self.fee = FEE_CONSTANT + FEE_PER_BYTE * size as u64;
        Ok(self.fee)
    }

    fn sorted_inputs(&self) -> Vec<TxInput> {
        let mut inputs = self.inputs.clone();
        inputs.sort();
        inputs
    }

    /// Encode the transaction body.
    pub fn build_body(&self) -> Result<Vec<u8>, CodecError> {
        if self.inputs.is_empty() {
            return Err(CodecError::TxBuild("no inputs".into()));
        }
        if self.outputs.is_empty() && self.mint.is_empty() {
            return Err(CodecError::TxBuild("no outputs and nothing minted".into()));
        }

        let mut entries = 3usize; // inputs, outputs, fee
        if self.ttl_slot.is_some() {
            entries += 1;
        }
        if !self.metadata.is_empty() {
            entries += 1;
        }
        if self.validity_start_slot.is_some() {
            entries += 1;
        }
        if !self.mint.is_empty() {
            entries += 1;
        }
        if !self.redeemers.is_empty() {
            entries += 1; // script data hash
        }
        if !self.collateral.is_empty() {
            entries += 1;
        }
        if !self.required_signers.is_empty() {
            entries += 1;
        }

        let mut out = Vec::with_capacity(512);
        write_head(&mut out, 5, entries as u64);

        write_head(&mut out, 0, 0);
        let inputs = self.sorted_inputs();
        write_head(&mut out, 4, inputs.len() as u64);
        for input in &inputs {
            input.encode_into(&mut out);
        }

        write_head(&mut out, 0, 1);
        write_head(&mut out, 4, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_into(&mut out)?;
        }

        write_head(&mut out, 0, 2);
        write_head(&mut out, 0, self.fee);

        if let Some(ttl) = self.ttl_slot {
            write_head(&mut out, 0, 3);
            write_head(&mut out, 0, ttl);
        }

        if !self.metadata.is_empty() {
            write_head(&mut out, 0, 7);
            let aux_hash = blake2b_256(&self.build_aux_data());
            write_head(&mut out, 2, 32);
            out.extend_from_slice(&aux_hash);
        }

        if let Some(start) = self.validity_start_slot {
            write_head(&mut out, 0, 8);
            write_head(&mut out, 0, start);
        }

        if !self.mint.is_empty() {
            write_head(&mut out, 0, 9);
            encode_multiasset_signed(&self.mint, &mut out)?;
        }

        if !self.redeemers.is_empty() {
            write_head(&mut out, 0, 11);
            let script_data_hash = blake2b_256(&self.encode_redeemers());
            write_head(&mut out, 2, 32);
            out.extend_from_slice(&script_data_hash);
        }

        if !self.collateral.is_empty() {
            write_head(&mut out, 0, 13);
            write_head(&mut out, 4, self.collateral.len() as u64);
            for input in &self.collateral {
                input.encode_into(&mut out);
            }
        }

        if !self.required_signers.is_empty() {
            write_head(&mut out, 0, 14);
            write_head(&mut out, 4, self.required_signers.len() as u64);
            for signer in &self.required_signers {
                write_head(&mut out, 2, 28);
                out.extend_from_slice(signer);
            }
        }

        Ok(out)
    }

    /// Transaction id: blake2b-256 of the body, hex.
    pub fn tx_id(&self) -> Result<String, CodecError> {
        Ok(hex::encode(blake2b_256(&self.build_body()?)))
    }

    fn encode_redeemers(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_head(&mut out, 4, self.redeemers.len() as u64);
        for entry in &self.redeemers {
            write_head(&mut out, 4, 4);
            write_head(&mut out, 0, entry.purpose.tag());
            write_head(&mut out, 0, entry.input_index as u64);
            out.extend_from_slice(&entry.data.encode());
            write_head(&mut out, 4, 2);
            write_head(&mut out, 0, entry.ex_units.mem);
            write_head(&mut out, 0, entry.ex_units.steps);
        }
        out
    }

    fn build_witness_set(&self, witnesses: &[VkeyWitness]) -> Vec<u8> {
        let mut entries = 0usize;
        if !witnesses.is_empty() {
            entries += 1;
        }
        if !self.redeemers.is_empty() {
            entries += 1;
        }
        if self.attached_script.is_some() {
            entries += 1;
        }
        let mut out = Vec::new();
        write_head(&mut out, 5, entries as u64);
        if !witnesses.is_empty() {
            write_head(&mut out, 0, 0);
            write_head(&mut out, 4, witnesses.len() as u64);
            for witness in witnesses {
                write_head(&mut out, 4, 2);
                write_head(&mut out, 2, 32);
                out.extend_from_slice(&witness.vkey);
                write_head(&mut out, 2, 64);
                out.extend_from_slice(&witness.signature);
            }
        }
        if !self.redeemers.is_empty() {
            write_head(&mut out, 0, 5);
            out.extend_from_slice(&self.encode_redeemers());
        }
        if let Some(script) = &self.attached_script {
            write_head(&mut out, 0, 6);
            write_head(&mut out, 4, 1);
            write_head(&mut out, 2, script.len() as u64);
            out.extend_from_slice(script);
        }
        out
    }

    fn build_aux_data(&self) -> Vec<u8> {
        // conway-era aux data: #6.259({0: metadata})
        let mut out = Vec::new();
        write_head(&mut out, 6, 259);
        write_head(&mut out, 5, 1);
        write_head(&mut out, 0, 0);
        out.extend_from_slice(&self.metadata.encode());
        out
    }

    /// Full transaction with an empty witness list (for evaluation).
    pub fn build_unsigned(&self) -> Result<Vec<u8>, CodecError> {
        self.assemble(&[])
    }

    /// Full signed transaction.
    pub fn build_signed(&self, witnesses: &[VkeyWitness]) -> Result<Vec<u8>, CodecError> {
        if witnesses.is_empty() {
            return Err(CodecError::TxBuild("signed tx requires witnesses".into()));
        }
        self.assemble(witnesses)
    }

    fn assemble(&self, witnesses: &[VkeyWitness]) -> Result<Vec<u8>, CodecError> {
        let body = self.build_body()?;
        let witness_set = self.build_witness_set(witnesses);
        let mut out = Vec::with_capacity(body.len() + witness_set.len() + 32);
        write_head(&mut out, 4, 4);
        out.extend_from_slice(&body);
        out.extend_from_slice(&witness_set);
        out.push(0xf5); // is_valid = true
        if self.metadata.is_empty() {
            out.push(0xf6);
        } else {
            out.extend_from_slice(&self.build_aux_data());
        }
        Ok(out)
    }
}

fn encode_multiasset(
    assets: &[(String, u64)],
    out: &mut Vec<u8>,
    map_amount: impl Fn(u64) -> u64,
) -> Result<(), CodecError> {
    let grouped = group_by_policy(assets.iter().map(|(unit, amount)| (unit.as_str(), *amount)))?;
    write_head(out, 5, grouped.len() as u64);
    for (policy, names) in grouped {
        write_head(out, 2, 28);
        out.extend_from_slice(&policy);
        write_head(out, 5, names.len() as u64);
        for (name, amount) in names {
            write_head(out, 2, name.len() as u64);
            out.extend_from_slice(&name);
            write_head(out, 0, map_amount(amount));
        }
    }
    Ok(())
}

fn encode_multiasset_signed(mint: &[(String, i64)], out: &mut Vec<u8>) -> Result<(), CodecError> {
    let grouped = group_by_policy(
        mint.iter()
            .map(|(unit, amount)| (unit.as_str(), *amount as u64)),
    )?;
    write_head(out, 5, grouped.len() as u64);
    let signed_of = |policy: &[u8], name: &[u8]| -> i64 {
        let unit = format!("{}{}", hex::encode(policy), hex::encode(name));
        mint.iter()
            .find(|(u, _)| *u == unit)
            .map(|(_, amount)| *amount)
            .unwrap_or(0)
    };
    for (policy, names) in grouped {
        write_head(out, 2, 28);
        out.extend_from_slice(&policy);
        write_head(out, 5, names.len() as u64);
        for (name, _) in names {
            write_head(out, 2, name.len() as u64);
            out.extend_from_slice(&name);
            let amount = signed_of(&policy, &name);
            if amount >= 0 {
                write_head(out, 0, amount as u64);
            } else {
                write_head(out, 1, (-(amount + 1)) as u64);
            }
        }
    }
    Ok(())
}

type PolicyGroup = Vec<([u8; 28], Vec<(Vec<u8>, u64)>)>;

/// Split `policy ++ asset_name` units into per-policy groups, canonical order.
fn group_by_policy<'a>(
    units: impl Iterator<Item = (&'a str, u64)>,
) -> Result<PolicyGroup, CodecError> {
    let mut grouped: PolicyGroup = Vec::new();
    let mut sorted: Vec<(&str, u64)> = units.collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (unit, amount) in sorted {
        if unit.len() < 56 {
            return Err(CodecError::TxBuild(format!("asset unit too short: {unit}")));
        }
        let policy_bytes = hex::decode(&unit[..56])
            .map_err(|e| CodecError::invalid_hex("policy_id", e.to_string()))?;
        let policy: [u8; 28] = policy_bytes
            .try_into()
            .map_err(|_| CodecError::invalid_hex("policy_id", "wrong length"))?;
        let name = hex::decode(&unit[56..])
            .map_err(|e| CodecError::invalid_hex("asset_name", e.to_string()))?;
        match grouped.last_mut() {
            Some((last_policy, names)) if *last_policy == policy => names.push((name, amount)),
            _ => grouped.push((policy, vec![(name, amount)])),
        }
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{message_metadata, MetadataValue, TxMetadata, LABEL_MSG};

    fn test_address() -> String {
        Address::from_key_hash([0x42; 28], None).to_bech32(Network::Preprod)
    }

    fn base_builder() -> TxBuilder {
        TxBuilder::new()
            .input(TxInput {
                tx_hash: [1; 32],
                index: 0,
            })
            .output(TxOutput::new(test_address(), Value::lovelace_only(2_000_000)))
            .validity_window(Network::Preprod, 1_700_000_000_000, 150)
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = base_builder().build_unsigned().unwrap();
        let b = base_builder().build_unsigned().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_input_order_does_not_change_body() {
        let i1 = TxInput {
            tx_hash: [1; 32],
            index: 1,
        };
        let i2 = TxInput {
            tx_hash: [1; 32],
            index: 0,
        };
        let body_a = base_builder().input(i1).input(i2).build_body().unwrap();
        let body_b = base_builder().input(i2).input(i1).build_body().unwrap();
        assert_eq!(body_a, body_b);
    }

    #[test]
    fn test_fee_estimation_grows_with_metadata() {
        let mut plain = base_builder();
        let plain_fee = plain.estimate_and_set_fee().unwrap();

        let mut meta = TxMetadata::new();
        meta.insert(LABEL_MSG, message_metadata(&["Masumi", "RegisterAgent"]));
        let mut with_meta = base_builder().metadata(meta);
        let meta_fee = with_meta.estimate_and_set_fee().unwrap();

        assert!(meta_fee > plain_fee);
        assert!(plain_fee > FEE_CONSTANT);
    }

    #[test]
    fn test_tx_id_changes_with_fee() {
        let id_a = base_builder().fee(170_000).tx_id().unwrap();
        let id_b = base_builder().fee(180_000).tx_id().unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(id_a.len(), 64);
    }

    #[test]
    fn test_signed_tx_requires_witnesses() {
        assert!(base_builder().build_signed(&[]).is_err());
        let witness = VkeyWitness {
            vkey: [9; 32],
            signature: [8; 64],
        };
        let signed = base_builder().build_signed(&[witness]).unwrap();
        assert_eq!(signed[0], 0x84);
    }

    #[test]
    fn test_mint_with_burn_encodes() {
        let unit = format!("{}{}", "ab".repeat(28), "cd".repeat(32));
        let tx = base_builder()
            .mint(unit, -1)
            .redeemer(RedeemerEntry {
                purpose: RedeemerPurpose::Mint,
                input_index: 0,
                data: PlutusData::unit_constr(0),
                ex_units: ExUnits {
                    mem: 1000,
                    steps: 10_000,
                },
            })
            .build_unsigned()
            .unwrap();
        assert!(!tx.is_empty());
    }

    #[test]
    fn test_no_inputs_rejected() {
        let err = TxBuilder::new()
            .output(TxOutput::new(test_address(), Value::lovelace_only(1)))
            .build_body();
        assert!(err.is_err());
    }

    #[test]
    fn test_ex_units_budget_count_must_match() {
        let mut builder = base_builder().redeemer(RedeemerEntry {
            purpose: RedeemerPurpose::Spend,
            input_index: 0,
            data: PlutusData::unit_constr(0),
            ex_units: ExUnits::default(),
        });
        assert!(builder.apply_ex_units(&[]).is_err());
        assert!(builder
            .apply_ex_units(&[ExUnits {
                mem: 500,
                steps: 5000
            }])
            .is_ok());
    }

    #[test]
    fn test_inline_datum_output_roundtrips_datum_bytes() {
        let datum = PlutusData::Constr {
            tag: 0,
            fields: vec![PlutusData::Int(5)],
        };
        let output =
            TxOutput::new(test_address(), Value::lovelace_only(1)).with_datum(datum.clone());
        let mut encoded = Vec::new();
        output.encode_into(&mut encoded).unwrap();
        let datum_bytes = datum.encode();
        assert!(encoded
            .windows(datum_bytes.len())
            .any(|window| window == datum_bytes));
    }
}
