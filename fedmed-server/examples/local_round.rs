//! Runs one federated round end to end with in-process "institutions".
//!
//! ```text
//! cargo run --example local_round --features testutils -- configs/local.toml
//! ```
//!
//! Three hospitals register, heartbeat, and submit encrypted updates under
//! the insecure reference codec. The round closes on quorum, the in-process
//! decryption authority decodes the aggregate and the new global model
//! version is logged.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing::info;

use fedmed_core::{
    cipher::testutils::EncryptionContext,
    CipherParams,
    Model,
    NodeId,
    NodePublicKey,
    PUBLIC_KEY_LENGTH,
};
use fedmed_server::{
    authority::InsecureAuthority,
    metrics::{metrics_channel, MemorySink},
    registry::NodeRegistry,
    settings::{CipherSettings, RoundSettings, Settings, ValidationSettings},
    state_machine::{events::ModelUpdate, StateMachineInitializer},
    storage::{
        FileModelStorage,
        FileRoundStorage,
        MemoryModelStorage,
        MemoryRoundStorage,
        ModelStorage,
        RoundStorage,
        Store,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/local.toml".to_string());
    let Settings {
        round,
        cipher,
        validation,
        storage,
        log,
    } = Settings::new(&path).with_context(|| format!("cannot load the configuration {}", path))?;

    tracing_subscriber::fmt().with_env_filter(log.filter).init();

    match storage.snapshot_dir {
        Some(dir) => {
            let rounds = FileRoundStorage::open(&dir).await?;
            let models = FileModelStorage::open(&dir).await?;
            run_round(round, cipher, validation, Store::new(rounds, models)).await
        }
        None => {
            let store = Store::new(MemoryRoundStorage::new(), MemoryModelStorage::new());
            run_round(round, cipher, validation, store).await
        }
    }
}

async fn run_round<R, M>(
    round: RoundSettings,
    cipher: CipherSettings,
    validation: ValidationSettings,
    store: Store<R, M>,
) -> anyhow::Result<()>
where
    R: RoundStorage,
    M: ModelStorage,
{
    let context = EncryptionContext::new(CipherParams {
        context_id: cipher.context_id,
        scale_bits: cipher.scale_bits,
        weight_bits: cipher.weight_bits,
    });

    let registry = NodeRegistry::new();
    let institutions = ["hospital-athens", "hospital-berlin", "hospital-cairo"];
    for (index, id) in institutions.iter().enumerate() {
        let key = NodePublicKey::from_slice(&[index as u8 + 1; PUBLIC_KEY_LENGTH])
            .context("bad key material")?;
        registry.register(NodeId::from(*id), key)?;
        registry.heartbeat(&NodeId::from(*id))?;
    }

    let sink = MemorySink::new();
    let (metrics_tx, dispatcher) = metrics_channel(sink.clone());
    tokio::spawn(dispatcher.run());

    let (state_machine, requests, events) = StateMachineInitializer::new(
        cipher,
        validation,
        store,
        registry,
        Arc::new(InsecureAuthority::new(context.clone())),
        metrics_tx,
    )
    .init()
    .await?;
    tokio::spawn(state_machine.run());

    let mut models = events.model_listener();
    let round_number = requests
        .open_round(round.quorum, Duration::from_secs(round.deadline))
        .await?;
    info!(round = round_number, "opened a round");

    for (index, id) in institutions.iter().enumerate() {
        // a stand-in for the institution's locally trained update
        let weights: Vec<f32> = (0..cipher.model_length)
            .map(|slot| (index + 1) as f32 * 0.1 + slot as f32 * 0.01)
            .collect();
        let update = context.encrypt(&Model::from_weights(weights));
        let samples = 100 * (index as u64 + 1);
        requests
            .submit_update(round_number, NodeId::from(*id), update, samples, 1.0)
            .await?;
        info!(institution = id, samples, "submitted an encrypted update");
    }

    if let Some(event) = models.next().await {
        if let ModelUpdate::New(version) = event.event {
            info!(
                version = version.version_number,
                accuracy = version.avg_accuracy,
                loss = version.avg_loss,
                artifact = %version.artifact_ref,
                "published a new global model"
            );
        }
    }

    // give the fire-and-forget dispatcher a moment to drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    for record in sink.records() {
        info!(
            round = record.round_number,
            clients = record.num_clients,
            accuracy = record.avg_accuracy,
            "round metrics"
        );
    }

    Ok(())
}
