//! Helpers for the state machine tests.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use fedmed_core::{
    cipher::testutils::EncryptionContext,
    Ciphertext,
    Model,
    NodeId,
    NodePublicKey,
    PUBLIC_KEY_LENGTH,
};

use crate::{
    authority::InsecureAuthority,
    metrics::{metrics_channel, MemorySink},
    registry::NodeRegistry,
    settings::{CipherSettings, ValidationSettings},
    state_machine::{
        events::EventSubscriber,
        requests::RequestSender,
        StateMachineInitializer,
    },
    storage::{MemoryModelStorage, MemoryRoundStorage, Store},
};

pub type TestStore = Store<MemoryRoundStorage, MemoryModelStorage>;

/// A builder for a running coordinator backed by in-memory storage and the
/// insecure reference codec.
pub struct CoordinatorBuilder {
    context: EncryptionContext,
    model_length: usize,
    validation: ValidationSettings,
    nodes: Vec<NodeId>,
    rounds: MemoryRoundStorage,
    models: MemoryModelStorage,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            context: EncryptionContext::generate(16, 24),
            model_length: 4,
            validation: ValidationSettings {
                max_sample_count: 100_000,
                anomaly_threshold: 2.5,
                min_anomaly_peers: 2,
            },
            nodes: Vec::new(),
            rounds: MemoryRoundStorage::new(),
            models: MemoryModelStorage::new(),
        }
    }

    pub fn with_model_length(mut self, model_length: usize) -> Self {
        self.model_length = model_length;
        self
    }

    /// Registers the given nodes and activates them with a heartbeat.
    pub fn with_nodes(mut self, ids: &[&str]) -> Self {
        self.nodes = ids.iter().map(|id| NodeId::from(*id)).collect();
        self
    }

    /// Starts from a pre-existing round ledger.
    pub fn with_round_storage(mut self, rounds: MemoryRoundStorage) -> Self {
        self.rounds = rounds;
        self
    }

    /// Starts from a pre-existing version history.
    pub fn with_model_storage(mut self, models: MemoryModelStorage) -> Self {
        self.models = models;
        self
    }

    /// Initializes the state machine and spawns it together with the
    /// metrics dispatcher.
    pub async fn start(self) -> TestCoordinator {
        let registry = NodeRegistry::new();
        for (index, id) in self.nodes.iter().enumerate() {
            let key =
                NodePublicKey::from_slice(&[index as u8 + 1; PUBLIC_KEY_LENGTH]).unwrap();
            registry.register(id.clone(), key).unwrap();
            registry.heartbeat(id).unwrap();
        }

        let sink = MemorySink::new();
        let (metrics_tx, dispatcher) = metrics_channel(sink.clone());
        tokio::spawn(dispatcher.run());

        let params = self.context.params();
        let cipher = CipherSettings {
            context_id: params.context_id,
            scale_bits: params.scale_bits,
            weight_bits: params.weight_bits,
            model_length: self.model_length,
        };

        let store = Store::new(self.rounds, self.models);
        let authority = Arc::new(InsecureAuthority::new(self.context.clone()));
        let (state_machine, requests, events) = StateMachineInitializer::new(
            cipher,
            self.validation,
            store.clone(),
            registry.clone(),
            authority,
            metrics_tx,
        )
        .init()
        .await
        .unwrap();

        let machine = tokio::spawn(state_machine.run());

        TestCoordinator {
            context: self.context,
            registry,
            store,
            sink,
            requests,
            events,
            machine,
        }
    }
}

/// A running coordinator with handles into all of its seams.
pub struct TestCoordinator {
    pub context: EncryptionContext,
    pub registry: NodeRegistry,
    pub store: TestStore,
    pub sink: MemorySink,
    pub requests: RequestSender,
    pub events: EventSubscriber,
    pub machine: JoinHandle<Option<()>>,
}

impl TestCoordinator {
    /// Encrypts the given weights under the deployment context.
    pub fn encrypt(&self, weights: &[f32]) -> Ciphertext {
        self.context.encrypt(&Model::from_weights(weights.to_vec()))
    }
}

/// Polls `predicate` until it holds or a generous timeout elapses.
pub async fn wait_for(predicate: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}
