//! Register / deregister agent dispatchers: mint and burn of the agent
//! identifier NFT.
//!
//! The asset name is derived from the first consumed UTXO, so re-running a
//! registration that already minted can never produce a second asset: the
//! first UTXO is gone and the build fails before submission.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::db::{run, run_serializable};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_source::PaymentSource;
use crate::models::registry_request::{PricingType, RegistryRequest};
use crate::models::state::RegistrationState;
use crate::models::transaction::Transaction;
use crate::services::dispatchers::{
    change_value, pick_collateral, sign_and_submit, to_tx_input, wallet_inputs, DispatcherContext,
    VALIDITY_SLACK_SECS,
};
use crate::services::wallet_locker;
use masumi_codec::metadata::{
    message_metadata, string_to_metadata, MetadataValue, TxMetadata, LABEL_MSG, LABEL_NFT,
};
use masumi_codec::tx::{RedeemerEntry, RedeemerPurpose, TxBuilder, TxOutput, Value};
use masumi_codec::{PlutusData, Network};

/// Minimum ada accompanying the minted NFT output.
const NFT_OUTPUT_LOVELACE: u64 = 2_000_000;

/// Build the 721 metadata body for one agent.
fn registry_metadata(request: &RegistryRequest) -> Result<MetadataValue> {
    let mut entries: Vec<(&str, MetadataValue)> = vec![
        ("name", string_to_metadata(&request.name)),
        ("apiBaseUrl", string_to_metadata(&request.api_base_url)),
    ];
    if let Some(description) = &request.description {
        entries.push(("description", string_to_metadata(description)));
    }
    if let (Some(capability_name), Some(capability_version)) =
        (&request.capability_name, &request.capability_version)
    {
        entries.push((
            "capability",
            MetadataValue::map(vec![
                ("name", string_to_metadata(capability_name)),
                ("version", string_to_metadata(capability_version)),
            ]),
        ));
    }
    let mut author = vec![("name", string_to_metadata(&request.author_name))];
    if let Some(email) = &request.author_contact_email {
        author.push(("contactEmail", string_to_metadata(email)));
    }
    if let Some(organization) = &request.author_organization {
        author.push(("organization", string_to_metadata(organization)));
    }
    entries.push(("author", MetadataValue::map(author)));

    let mut legal = Vec::new();
    if let Some(privacy) = &request.legal_privacy_policy {
        legal.push(("privacyPolicy", string_to_metadata(privacy)));
    }
    if let Some(terms) = &request.legal_terms {
        legal.push(("terms", string_to_metadata(terms)));
    }
    if let Some(other) = &request.legal_other {
        legal.push(("other", string_to_metadata(other)));
    }
    if !legal.is_empty() {
        entries.push(("legal", MetadataValue::map(legal)));
    }

    let tags = request.tags_vec()?;
    entries.push((
        "tags",
        MetadataValue::List(tags.iter().map(|tag| string_to_metadata(tag)).collect()),
    ));
    let examples = request.example_outputs_vec()?;
    if !examples.is_empty() {
        entries.push((
            "exampleOutputs",
            MetadataValue::List(examples.iter().map(|e| string_to_metadata(e)).collect()),
        ));
    }

    // Pricing carries the legacy paymentType tags: Fixed pricing maps to
    // Web3CardanoV1, Free maps to None. Operators are warned because a
    // paid agent with paymentType None is accepted downstream.
    let pricing_type = request.pricing_type()?;
    let payment_type = match pricing_type {
        PricingType::Fixed => "Web3CardanoV1",
        PricingType::Free => "None",
    };
    if pricing_type == PricingType::Free && !request.pricing_entries()?.is_empty() {
        warn!(
            "Registry request {} has Free pricing type but priced entries; emitting paymentType None verbatim",
            request.id
        );
    }
    let mut pricing_entries = vec![("paymentType", MetadataValue::text(payment_type))];
    let prices = request.pricing_entries()?;
    if !prices.is_empty() {
        pricing_entries.push((
            "fixedPricing",
            MetadataValue::List(
                prices
                    .iter()
                    .map(|(unit, amount)| {
                        MetadataValue::map(vec![
                            (
                                "unit",
                                string_to_metadata(if unit.is_empty() { "lovelace" } else { unit }),
                            ),
                            ("amount", MetadataValue::text(amount.to_string())),
                        ])
                    })
                    .collect(),
            ),
        ));
    }
    entries.push(("agentPricing", MetadataValue::map(pricing_entries)));
    entries.push((
        "metadataVersion",
        MetadataValue::Int(request.metadata_version as u64),
    ));
    Ok(MetadataValue::map(entries))
}

async fn fail_registry(
    ctx: &DispatcherContext,
    request_id: &str,
    placeholder_id: Option<&str>,
    note: &str,
) {
    let request_id = request_id.to_string();
    let note = note.to_string();
    let placeholder_id = placeholder_id.map(str::to_string);
    let outcome = run_serializable(&ctx.pool, move |conn| {
        if let Some(placeholder_id) = placeholder_id.as_deref() {
            Transaction::settle(
                conn,
                placeholder_id,
                crate::models::state::TxStatus::RolledBack,
            )?;
        }
        RegistryRequest::set_state(
            conn,
            &request_id,
            RegistrationState::RegistrationFailed,
            Some(&note),
        )
    })
    .await;
    if let Err(err) = outcome {
        tracing::error!("Failed to record registry failure: {err:#}");
    }
}

async fn process_mint(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &RegistryRequest,
) -> Result<()> {
    let network = source.network()?;
    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;

    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!("Wallet {} busy, deferring registration {}", wallet.id, request.id);
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        RegistryRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        RegistryRequest::set_state(
            conn,
            &request_id,
            RegistrationState::RegistrationInitiated,
            None,
        )
    })
    .await?;

    let outcome = mint_and_submit(ctx, source, request, &wallet, network, &placeholder.id).await;
    if let Err(err) = outcome {
        warn!("Registration {} failed: {err:#}", request.id);
        fail_registry(ctx, &request.id, Some(&placeholder.id), &format!("{err:#}")).await;
    }
    Ok(())
}

async fn mint_and_submit(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &RegistryRequest,
    wallet: &HotWallet,
    network: Network,
    placeholder_id: &str,
) -> Result<()> {
    let inputs = wallet_inputs(ctx, wallet).await?;
    let first = &inputs[0];
    let first_hash_bytes: [u8; 32] = hex::decode(&first.tx_hash)
        .ok()
        .and_then(|b| b.try_into().ok())
        .context("first utxo hash is not 32 bytes")?;
    let asset_name =
        masumi_codec::script::registry_asset_name(&first_hash_bytes, first.output_index);
    let unit = format!("{}{}", source.policy_id, hex::encode(asset_name));
    let agent_identifier = unit.clone();

    let collateral = pick_collateral(&inputs, ctx.config.min_collateral_lovelace)
        .context("No adequate collateral UTXO")?;
    let compiled = hex::decode(&source.compiled_script)
        .context("payment source compiled script is not hex")?;

    let mut metadata = TxMetadata::new();
    metadata.insert(
        LABEL_NFT,
        MetadataValue::map(vec![(
            source.policy_id.as_str(),
            MetadataValue::Map(vec![(
                MetadataValue::Bytes(asset_name.to_vec()),
                registry_metadata(request)?,
            )]),
        )]),
    );
    metadata.insert(LABEL_MSG, message_metadata(&["Masumi", "RegisterAgent"]));

    let now_ms = chrono::Utc::now().timestamp_millis();
    let build = |fee: u64| -> Result<TxBuilder> {
        let mut builder = TxBuilder::new()
            .inputs(inputs.iter().map(to_tx_input).collect::<Result<Vec<_>>>()?)
            .collateral(to_tx_input(&collateral)?)
            .mint(unit.clone(), 1)
            .attach_script(compiled.clone())
            .redeemer(RedeemerEntry {
                purpose: RedeemerPurpose::Mint,
                input_index: 0,
                data: PlutusData::unit_constr(0),
                ex_units: Default::default(),
            })
            .metadata(metadata.clone())
            .validity_window(network, now_ms, VALIDITY_SLACK_SECS)
            .fee(fee);
        builder = builder.output(TxOutput::new(
            wallet.address.clone(),
            Value {
                lovelace: NFT_OUTPUT_LOVELACE,
                assets: vec![(unit.clone(), 1)],
            },
        ));
        let change = change_value(&inputs, NFT_OUTPUT_LOVELACE, fee, &[])?;
        if change.lovelace > 0 || !change.assets.is_empty() {
            builder = builder.output(TxOutput::new(wallet.address.clone(), change));
        }
        Ok(builder)
    };

    let mut draft = build(0)?;
    let fee = draft.estimate_and_set_fee()?;
    let builder = build(fee)?;

    let tx_hash = sign_and_submit(ctx, wallet, builder, true, &[], 0).await?;

    let request_id = request.id.clone();
    let placeholder_id = placeholder_id.to_string();
    let agent_identifier_for_db = agent_identifier.clone();
    run_serializable(&ctx.pool, move |conn| {
        Transaction::set_tx_hash(conn, &placeholder_id, &tx_hash)?;
        RegistryRequest::set_agent_identifier(conn, &request_id, &agent_identifier_for_db)?;
        Ok(())
    })
    .await?;
    info!(
        "Registration {} minted as {} (pending confirmation)",
        request.id, agent_identifier
    );
    Ok(())
}

/// Mint dispatcher: `RegistrationRequested -> RegistrationInitiated`.
pub async fn run_register(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            RegistryRequest::find_in_state(conn, &source_id, RegistrationState::RegistrationRequested)
        })
        .await?;
        for chunk in requests.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_mint(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Registration dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}

async fn process_burn(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &RegistryRequest,
) -> Result<()> {
    let network = source.network()?;
    let Some(agent_identifier) = request.agent_identifier.clone() else {
        fail_registry(ctx, &request.id, None, "No agent identifier recorded").await;
        return Ok(());
    };
    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;

    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!("Wallet {} busy, deferring deregistration {}", wallet.id, request.id);
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        RegistryRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        RegistryRequest::set_state(
            conn,
            &request_id,
            RegistrationState::DeregistrationInitiated,
            None,
        )
    })
    .await?;

    let outcome = burn_and_submit(
        ctx,
        source,
        &agent_identifier,
        &wallet,
        network,
        &placeholder.id,
    )
    .await;
    if let Err(err) = outcome {
        warn!("Deregistration {} failed: {err:#}", request.id);
        fail_registry(ctx, &request.id, Some(&placeholder.id), &format!("{err:#}")).await;
    }
    Ok(())
}

async fn burn_and_submit(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    unit: &str,
    wallet: &HotWallet,
    network: Network,
    placeholder_id: &str,
) -> Result<()> {
    let all_utxos = ctx
        .adapter
        .utxos_at(&wallet.address)
        .await
        .context("Failed to fetch wallet UTXOs")?;
    // The input set must include the UTXO carrying the NFT being burned.
    let nft_utxo = all_utxos
        .iter()
        .find(|utxo| utxo.quantity_of(unit) > 0)
        .cloned()
        .context("Wallet does not hold the agent identifier NFT")?;
    let mut inputs = super::select_wallet_inputs(all_utxos.clone());
    if !inputs.iter().any(|utxo| {
        utxo.tx_hash == nft_utxo.tx_hash && utxo.output_index == nft_utxo.output_index
    }) {
        inputs.push(nft_utxo.clone());
    }
    let collateral = pick_collateral(&all_utxos, ctx.config.min_collateral_lovelace)
        .context("No adequate collateral UTXO")?;
    let compiled = hex::decode(&source.compiled_script)
        .context("payment source compiled script is not hex")?;

    let mut metadata = TxMetadata::new();
    metadata.insert(LABEL_MSG, message_metadata(&["Masumi", "DeregisterAgent"]));

    let now_ms = chrono::Utc::now().timestamp_millis();
    let exclude = vec![unit.to_string()];
    let build = |fee: u64| -> Result<TxBuilder> {
        let mut builder = TxBuilder::new()
            .inputs(inputs.iter().map(to_tx_input).collect::<Result<Vec<_>>>()?)
            .collateral(to_tx_input(&collateral)?)
            .mint(unit.to_string(), -1)
            .attach_script(compiled.clone())
            .redeemer(RedeemerEntry {
                purpose: RedeemerPurpose::Mint,
                input_index: 0,
                data: PlutusData::unit_constr(1),
                ex_units: Default::default(),
            })
            .metadata(metadata.clone())
            .validity_window(network, now_ms, VALIDITY_SLACK_SECS)
            .fee(fee);
        let change = change_value(&inputs, 0, fee, &exclude)?;
        builder = builder.output(TxOutput::new(wallet.address.clone(), change));
        Ok(builder)
    };

    let mut draft = build(0)?;
    let fee = draft.estimate_and_set_fee()?;
    let builder = build(fee)?;

    let tx_hash = sign_and_submit(ctx, wallet, builder, true, &[], 0).await?;
    let placeholder_id = placeholder_id.to_string();
    run_serializable(&ctx.pool, move |conn| {
        Transaction::set_tx_hash(conn, &placeholder_id, &tx_hash)
    })
    .await?;
    Ok(())
}

/// Burn dispatcher: `DeregistrationRequested -> DeregistrationInitiated`.
pub async fn run_deregister(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            RegistryRequest::find_in_state(
                conn,
                &source_id,
                RegistrationState::DeregistrationRequested,
            )
        })
        .await?;
        for chunk in requests.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_burn(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Deregistration dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}
