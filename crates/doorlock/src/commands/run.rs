//! The bridge daemon.
//!
//! Wires the phone, the broker session, the reconciliation engine and the
//! maintenance scheduler together, then runs until Ctrl-C / SIGTERM.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use doorlock_api::{BusClient, BusOptions, ReconnectConfig};
use doorlock_core::gateway::last_will;
use doorlock_core::{
    BridgeConfig, BusGateway, CommandDriver, Engine, Maintenance, MqttPublisher,
};

use crate::commands::phone;
use crate::error::BridgeError;

pub async fn handle(config: BridgeConfig) -> Result<(), BridgeError> {
    let cancel = CancellationToken::new();
    let phone = phone(&config);

    // ── Broker ──
    let gateway = BusGateway::new(config.bus.topics.clone());
    let options = BusOptions {
        host: config.bus.host.clone(),
        port: config.bus.port,
        client_id: config.bus.client_id.clone(),
        keep_alive: config.bus.keep_alive,
        credentials: config.bus.credentials.clone(),
        subscriptions: gateway.subscriptions(),
        last_will: Some(last_will(&config.bus.topics)),
        reconnect: ReconnectConfig::default(),
    };
    info!(
        broker = %format!("{}:{}", config.bus.host, config.bus.port),
        device = %config.device.serial,
        "starting door-lock bridge"
    );
    let (bus, inbound) = BusClient::connect(options, cancel.child_token());

    // ── Engine ──
    let driver = Arc::new(CommandDriver::new(
        phone.clone(),
        &config.calibration,
        config.reconcile.clone(),
        config.maintenance.failure_shot_dir.clone(),
    ));
    let publisher = Arc::new(MqttPublisher::new(
        bus.clone(),
        config.bus.topics.clone(),
        config.bus.publish_transitioning,
    ));
    let engine = Engine::new(driver, publisher, config.maintenance.poll_window);

    // Polling waits for the phone to be brought up; commands are accepted
    // right away.
    engine.pause_polling(true);
    engine.start().await?;

    let gateway_task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { gateway.serve(engine, inbound, cancel).await }
    });

    // ── Maintenance ──
    let maintenance = Arc::new(Maintenance::new(phone, config.maintenance.clone()));
    let maintenance_task = tokio::spawn({
        let maintenance = Arc::clone(&maintenance);
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = maintenance.initialize_with_retries() => {
                    if let Err(e) = result {
                        warn!(error = %e, "start-up initialization failed, polling anyway");
                    }
                }
            }
            engine.pause_polling(false);
            if let Err(e) = engine.check_status().await {
                warn!(error = %e, "could not request the first read");
            }
            maintenance.run_daily(engine, cancel).await;
        }
    });

    wait_for_signal().await;
    info!("shutting down");

    engine.shutdown().await;
    if !bus.is_connected() {
        warn!("broker not connected at shutdown, subscribers rely on the last will");
    }
    // Disconnect before cancelling so the final UNKNOWN is flushed.
    if let Err(e) = bus.disconnect().await {
        warn!(error = %e, "broker disconnect failed");
    }
    cancel.cancel();
    let _ = gateway_task.await;
    // A reboot cycle in progress does not watch the token.
    maintenance_task.abort();
    let _ = maintenance_task.await;
    info!("door-lock bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
