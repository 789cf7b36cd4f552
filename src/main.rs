use std::env;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use accord::config::AppConfig;
use accord::panel::PanelEmitter;
use accord::payment::bank::UnconfiguredBank;
use accord::payment::{HttpPaymentProvider, PaymentExecutor};
use accord::phone::{HttpPhoneVerifier, PhoneVerifier, SimulatedPhone};
use accord::profile::ProfileStore;
use accord::room::{RoomDeps, RoomDirectory};
use accord::server::{AppState, serve};
use accord::stt::{HttpStt, SpeechToText, UnconfiguredStt};
use accord::HttpLlmProvider;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A .env file is a development convenience; absence is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env()?;
    info!(port = config.port, "starting accord");

    // === Composition root: every process-wide collaborator built once ===
    let llm = Arc::new(HttpLlmProvider::from_config(&config));
    let payments = Arc::new(PaymentExecutor::new(Arc::new(
        HttpPaymentProvider::from_config(&config),
    )));
    let phone: Arc<dyn PhoneVerifier> = match (&config.phone_api_key, &config.phone_caller_id) {
        (Some(key), caller_id) => Arc::new(HttpPhoneVerifier::new(key.clone(), caller_id.clone())),
        _ => Arc::new(SimulatedPhone),
    };
    let panels = Arc::new(PanelEmitter::new());
    let profiles = Arc::new(ProfileStore::new());

    let stt: Arc<dyn SpeechToText> = match &config.stt_api_key {
        Some(key) => Arc::new(HttpStt::new(
            key.clone(),
            config.stt_region.clone(),
            config.stt_language.clone(),
        )),
        None => Arc::new(UnconfiguredStt),
    };

    let deps = RoomDeps {
        llm,
        stt,
        payments: payments.clone(),
        phone,
        bank: Arc::new(UnconfiguredBank),
        panels: panels.clone(),
        trigger_keyword: config.trigger_keyword.clone(),
        semantic_detection: config.semantic_detection,
    };

    let state = AppState {
        directory: Arc::new(RoomDirectory::new(deps)),
        profiles,
        panels,
        payments,
    };

    serve(state, config.port).await?;
    Ok(())
}

// ================================================================================================
// Tracing Configuration
// ================================================================================================

fn init_tracing() {
    let in_container =
        env::var("CONTAINER").is_ok() || std::path::Path::new("/.dockerenv").exists();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if in_container {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}
