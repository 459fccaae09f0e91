//! Coordinator entry point: wires the pool, chain adapters and signer, then
//! runs the sync loop and the action dispatchers until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};

use server::chain::BlockfrostAdapter;
use server::config::EngineConfig;
use server::db::{bootstrap, create_pool, run};
use server::models::payment_source::PaymentSource;
use server::services::{dispatchers, DispatcherContext, Ed25519Signer, SyncService};
use server::telemetry::init_telemetry;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry();

    let config = EngineConfig::from_env();
    info!("Coordinator starting (database: {})", config.database_url);

    let pool = create_pool(&config.database_url)?;
    run(&pool, bootstrap::initialize_schema)
        .await
        .context("Schema bootstrap failed")?;

    // One indexer client per configured network; the first active source
    // decides which project key is used for its network.
    let sources = run(&pool, PaymentSource::find_active).await?;
    if sources.is_empty() {
        warn!("No active payment sources configured - the engine will idle");
    }
    let adapter = match sources.first() {
        Some(source) => Arc::new(BlockfrostAdapter::new(
            source.network()?,
            &source.rpc_provider_api_key,
        )),
        None => Arc::new(BlockfrostAdapter::new(
            masumi_codec::Network::Preprod,
            "unconfigured",
        )),
    };

    // Key material handling is provided by the operations layer; the
    // default deployment stores the raw 32-byte signing seed in the
    // encrypted-mnemonic blob, decrypted by the vault sidecar before the
    // process sees it.
    let signer = Arc::new(Ed25519Signer::new(Box::new(|blob: &[u8]| {
        let seed: [u8; 32] = blob
            .try_into()
            .map_err(|_| anyhow::anyhow!("wallet key blob is not a 32-byte seed"))?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&seed))
    })));

    let sync = Arc::new(SyncService::new(
        pool.clone(),
        adapter.clone(),
        config.clone(),
    ));
    let dispatcher_ctx = Arc::new(DispatcherContext {
        pool: pool.clone(),
        adapter,
        signer,
        config: config.clone(),
    });

    let sync_handle = tokio::spawn(sync.start());
    let dispatch_handle = tokio::spawn(dispatchers::start(dispatcher_ctx));

    info!("Engine running; sync every {:?}, dispatch every {:?}",
        config.sync_interval, config.dispatch_interval);
    let _ = tokio::try_join!(sync_handle, dispatch_handle);
    Ok(())
}
