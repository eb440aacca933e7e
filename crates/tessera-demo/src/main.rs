//! Demo binary exercising replication end to end.
//!
//! `tessera-demo server` hosts one capital per connecting client and flips
//! its fields after a delay. `tessera-demo client` connects, watches the
//! capitals it can see, and sends the password request on the one it owns.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags:
//! `cargo run -p tessera-demo -- server --port 7100`.

mod capital;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tessera_config::{CliArgs, Config, default_config_dir};
use tessera_net::{ConnectionId, DisconnectReason, ObjectId, Owner};
use tessera_replication::{
    AuthorityManager, ClientListener, MirrorManager, NetworkManager, ServerListener, TickSchedule,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::capital::{Capital, SetCounter};

#[derive(Parser, Debug)]
#[command(name = "tessera-demo", about = "Replicated capitals over TCP")]
struct DemoArgs {
    #[command(subcommand)]
    role: Role,

    #[command(flatten)]
    overrides: CliArgs,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Host capitals, one per connecting client.
    Server {
        /// Seconds before a new capital switches to "Goodbye World".
        #[arg(long, default_value_t = 3)]
        flip_after: u64,
    },
    /// Connect and drive the capital this client owns.
    Client {
        #[arg(long, default_value = capital::PASSWORD)]
        password: String,

        #[arg(long, default_value_t = 354)]
        value: i32,

        /// Disconnect after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        run_for: Option<u64>,
    },
}

fn main() -> ExitCode {
    let DemoArgs { role, overrides } = DemoArgs::parse();

    let config_dir = overrides
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&overrides);

    let log_dir = config_dir.join("logs");
    tessera_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async move {
        match role {
            Role::Server { flip_after } => run_server(&config, Duration::from_secs(flip_after))
                .await
                .map_err(|e| e.to_string()),
            Role::Client {
                password,
                value,
                run_for,
            } => run_client(&config, password, value, run_for.map(Duration::from_secs))
                .await
                .map_err(|e| e.to_string()),
        }
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "demo failed");
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Spawns a capital for every client and schedules its flip.
struct CapitalHost {
    flip_after: Duration,
    flips: mpsc::UnboundedSender<(ObjectId, Instant)>,
}

impl ServerListener for CapitalHost {
    fn on_client_connected(&mut self, server: &mut AuthorityManager, connection: ConnectionId) {
        match server.spawn(capital::TEMPLATE, Owner::Client(connection)) {
            Ok(id) => {
                info!(?connection, object = ?id, "capital spawned for client");
                let _ = self.flips.send((id, Instant::now() + self.flip_after));
            }
            Err(e) => tracing::warn!(?connection, error = %e, "could not spawn capital"),
        }
    }

    fn on_client_disconnected(
        &mut self,
        server: &mut AuthorityManager,
        connection: ConnectionId,
        reason: &DisconnectReason,
    ) {
        info!(?connection, %reason, remaining = server.connection_count(), "client left");
    }
}

async fn run_server(config: &Config, flip_after: Duration) -> std::io::Result<()> {
    let (flips_tx, mut flips_rx) = mpsc::unbounded_channel();
    let host = CapitalHost {
        flip_after,
        flips: flips_tx,
    };
    let mut auth = AuthorityManager::bind(&config.network, capital::templates(), host).await?;

    let mut schedule = TickSchedule::with_tick_rate(config.network.tick_rate_hz);
    let mut ticker = tokio::time::interval(schedule.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pending_flips: Vec<(ObjectId, Instant)> = Vec::new();
    let mut last = Instant::now();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        while let Ok(flip) = flips_rx.try_recv() {
            pending_flips.push(flip);
        }
        let now = Instant::now();
        pending_flips.retain(|&(id, due)| {
            if due > now {
                return true;
            }
            if let Some(capital) = auth.behaviour_mut::<Capital>(id) {
                capital.sync_me.set(true);
                capital.sync_me_also.set("Goodbye World");
                info!(object = ?id, "capital flipped");
            }
            false
        });

        for _ in 0..schedule.accumulate(now - last) {
            auth.tick();
        }
        last = now;
    }

    info!(
        ticks = schedule.total_ticks(),
        dropped = schedule.dropped_ticks(),
        "server stopping"
    );
    auth.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct ClientLog;

impl ClientListener for ClientLog {
    fn on_connected(&mut self, connection: ConnectionId) {
        info!(?connection, "connected");
    }

    fn on_connect_failed(&mut self, error: &tessera_net::ConnectError) {
        tracing::error!(%error, "could not reach the server");
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        info!(%reason, "disconnected");
    }

    fn on_object_destroyed(&mut self, id: ObjectId) {
        info!(object = ?id, "object gone");
    }
}

async fn run_client(
    config: &Config,
    password: String,
    value: i32,
    run_for: Option<Duration>,
) -> Result<(), tessera_net::ConnectError> {
    let mut mirror = MirrorManager::connect(&config.network, capital::templates(), ClientLog).await?;
    let deadline = run_for.map(|d| Instant::now() + d);
    let mut ticker = tokio::time::interval(config.network.tick_interval());
    let mut seen: HashMap<ObjectId, String> = HashMap::new();
    let mut requested = false;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    while mirror.is_connected() {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        mirror.tick();

        for id in mirror.find_by_component_type::<Capital>() {
            let Some(capital) = mirror.behaviour::<Capital>(id) else {
                continue;
            };
            let state = capital.describe();
            if seen.get(&id) != Some(&state) {
                info!(object = ?id, mine = mirror.is_mine(id), %state, "capital");
                seen.insert(id, state);
            }
            if !requested
                && mirror.is_mine(id)
                && let Some(handle) = capital.set_counter
            {
                let payload = SetCounter {
                    password: password.clone(),
                    value,
                };
                match mirror.invoke(handle, payload) {
                    Ok(()) => info!(object = ?id, value, "set_counter sent"),
                    Err(e) => tracing::warn!(object = ?id, error = %e, "set_counter failed"),
                }
                requested = true;
            }
        }
        seen.retain(|id, _| mirror.has_object(*id));
    }

    mirror.disconnect();
    Ok(())
}
