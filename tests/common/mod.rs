//! Shared fixtures for batch manager integration tests.
#![allow(dead_code)]

use sdk_batcher::{BatchManager, BatchOverrideConfig, BoxError, IdentifiableMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const MAX_BATCH_ITEMS: usize = 10;
pub const MAX_BATCH_OPEN_MS: u64 = 200;
pub const SEND_LATENCY_MS: u64 = 50;

pub type EchoResponse = Vec<IdentifiableMessage<String>>;
pub type EchoManager = BatchManager<String, String, EchoResponse>;

/// Every batch the send function saw, as `(batch_key, ids)`.
pub type SentBatches = Arc<Mutex<Vec<(String, Vec<String>)>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn default_config() -> BatchOverrideConfig {
    BatchOverrideConfig::new()
        .with_max_batch_items(MAX_BATCH_ITEMS)
        .with_max_batch_open(Duration::from_millis(MAX_BATCH_OPEN_MS))
}

/// "dest3 17" -> "dest3"
pub fn destination_of(request: &String) -> String {
    request[..5].to_string()
}

pub fn requests_for(destination: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{} {}", destination, i)).collect()
}

pub fn echo_mapper(response: EchoResponse) -> Vec<IdentifiableMessage<Result<String, BoxError>>> {
    response
        .into_iter()
        .map(|m| m.map(Ok::<String, BoxError>))
        .collect()
}

/// Echoes each payload back after `latency`, recording every batch it sends.
pub fn echo_manager_with_latency(
    config: BatchOverrideConfig,
    latency: Duration,
) -> (EchoManager, SentBatches) {
    init_tracing();
    let sent: SentBatches = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&sent);
    let manager = EchoManager::builder()
        .override_config(config)
        .batch_function(
            move |requests: Vec<IdentifiableMessage<String>>, batch_key: String| {
                let ids = requests.iter().map(|m| m.id().to_string()).collect();
                recorder.lock().unwrap().push((batch_key, ids));
                async move {
                    tokio::time::sleep(latency).await;
                    Ok::<EchoResponse, BoxError>(requests)
                }
            },
        )
        .response_mapper(echo_mapper)
        .batch_key_mapper(destination_of)
        .build()
        .unwrap();
    (manager, sent)
}

pub fn echo_manager(config: BatchOverrideConfig) -> (EchoManager, SentBatches) {
    echo_manager_with_latency(config, Duration::from_millis(SEND_LATENCY_MS))
}

/// Every batch-send call fails after a short delay.
pub fn failing_manager(config: BatchOverrideConfig) -> EchoManager {
    init_tracing();
    EchoManager::builder()
        .override_config(config)
        .batch_function(
            |_requests: Vec<IdentifiableMessage<String>>, _batch_key: String| async move {
                tokio::time::sleep(Duration::from_millis(SEND_LATENCY_MS)).await;
                Err::<EchoResponse, BoxError>("Throwing exception in test".into())
            },
        )
        .response_mapper(echo_mapper)
        .batch_key_mapper(destination_of)
        .build()
        .unwrap()
}
