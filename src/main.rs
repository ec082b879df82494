// Salama core server: privacy-enhanced courier platform services.
//
// Composition root. Everything stateful is built once here, shared as Arcs
// through AppState, and drained on ctrl-c.

mod audit;
mod auth;
mod codes;
mod config;
mod crypto;
mod emergency;
mod error;
mod geo;
mod http;
mod location;
mod metrics;
mod notify;
mod realtime;
mod redact;
mod security;
mod verification;

use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::config::Config;
use crate::http::{build_router, AppState};

/// Housekeeping pass: retention eviction, stale rate windows, and the
/// out-of-band communication-loss check.
async fn eviction_loop(state: AppState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let now = Utc::now();
        let location_cutoff =
            now - chrono::Duration::days(i64::from(state.config.retention_days_location));
        let delivery_cutoff =
            now - chrono::Duration::days(i64::from(state.config.retention_days_delivery));
        let audit_cutoff =
            now - chrono::Duration::days(i64::from(state.config.retention_days_audit));

        let codes = state.codes.evict_expired();
        let verifications = state.verification.evict(delivery_cutoff);
        let history = state.security.evict_history(location_cutoff);
        let audit = state.audit.evict_older_than(audit_cutoff);
        let rate = state.notify.evict_rate_windows() + state.http_rate_evict();
        let evicted = codes + verifications + history + audit + rate;
        if evicted > 0 {
            info!(codes, verifications, history, audit, rate, "retention_eviction");
        }

        let comm_alerts = state.security.sweep_communication_loss();
        if comm_alerts > 0 {
            info!(alerts = comm_alerts, "communication_loss_sweep");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or("salama_core=info,tower_http=info".into()),
        )
        .json()
        .init();

    let config = Config::from_env().unwrap_or_else(|error| {
        eprintln!("\n[FATAL] configuration error: {error}");
        eprintln!("JWT_SECRET, ENCRYPTION_KEY and HMAC_SECRET must be set (>= 32 chars).");
        eprintln!("Example: export JWT_SECRET=$(openssl rand -hex 32)\n");
        std::process::exit(1);
    });
    info!(
        version = env!("CARGO_PKG_VERSION"),
        production = config.production,
        "Salama core starting"
    );

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config);
    tokio::spawn(eviction_loop(state.clone()));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|error| {
            eprintln!("\n[FATAL] cannot bind {bind_addr}: {error}");
            eprintln!("The port is likely in use; stop the previous instance or set PORT.\n");
            std::process::exit(1);
        });
    info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown");
        })
        .await
        .unwrap_or_else(|error| {
            eprintln!("[FATAL] server error: {error}");
            std::process::exit(1);
        });
}
