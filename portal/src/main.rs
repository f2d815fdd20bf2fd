use anyhow::{Context as _, Result};
use clap::Parser;
use firezone_portal::{App, Config, sockets};
use secrecy::ExposeSecret as _;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "firezone-portal")]
struct Args {
    /// Address the control-plane endpoints listen on.
    #[arg(long, env = "PORTAL_LISTEN_ADDR", default_value = "127.0.0.1:8081")]
    listen_addr: SocketAddr,

    /// How many relays a client is offered.
    #[arg(long, env = "PORTAL_RELAYS_TO_OFFER", default_value_t = 2)]
    relays_to_offer: usize,

    /// Deadline in seconds for brokered gateway replies.
    #[arg(long, env = "PORTAL_RPC_TIMEOUT", default_value_t = 30)]
    rpc_timeout: u64,

    /// Address the health-check endpoint listens on.
    #[arg(long, env = "PORTAL_HEALTH_CHECK_ADDR", default_value = "0.0.0.0:8080")]
    health_check_addr: SocketAddr,

    /// Provision a demo account and log its tokens. Development only.
    #[arg(long, env = "PORTAL_SEED", default_value_t = false)]
    seed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let (app, shutdown_tx) = App::new(Config {
        relays_to_offer: args.relays_to_offer,
        rpc_timeout: Duration::from_secs(args.rpc_timeout),
        ..Config::default()
    });

    if args.seed {
        seed(&app)?;
    }

    tokio::spawn(async move {
        if let Err(e) = firezone_portal::health_check::serve(args.health_check_addr).await {
            tracing::warn!("Health-check endpoint failed: {e:#}");
        }
    });

    let listener = tokio::net::TcpListener::bind(args.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen_addr))?;

    tracing::info!(addr = %args.listen_addr, "Control plane listening");

    axum::serve(listener, sockets::router(app))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;

            tracing::info!("Shutting down; disconnecting sessions");
            let _ = shutdown_tx.send(true);

            // Let sessions flush their `disconnect` frames.
            tokio::time::sleep(Duration::from_millis(250)).await;
        })
        .await
        .context("Server task failed")?;

    Ok(())
}

/// Provisions one demo account with an admin, a client token, a gateway
/// group + token and a global relay token, and logs all three secrets.
fn seed(app: &App) -> Result<()> {
    use chrono::{Duration, Utc};
    use portal_auth::Context;

    let store = &app.store;

    let account = store.create_account("demo");
    let admin = store.create_seed_admin(account.id, "Demo Admin")?;
    let identity = store.create_identity(
        admin.id,
        portal_model::ProviderId::random(),
        "admin@demo.example.com",
    )?;

    let subject = store.subject_for_actor(
        admin.id,
        Context {
            remote_ip: std::net::IpAddr::from([127, 0, 0, 1]),
            user_agent: None,
            region: None,
            location: None,
        },
        Utc::now() + Duration::hours(1),
    )?;

    let everyone = store.create_group(&subject, "Everyone")?;
    store.add_membership(&subject, admin.id, everyone.id)?;

    let site = store.create_gateway_group(&subject, "Default Site")?;

    let (_, client_token) =
        store.create_client_token(&subject, identity.id, Some(Utc::now() + Duration::days(14)))?;
    let (_, gateway_token) = store.create_gateway_token(&subject, site.id)?;
    let (_, relay_token) = store.create_global_relay_token();

    tracing::warn!(
        client_token = %client_token.expose_secret(),
        gateway_token = %gateway_token.expose_secret(),
        relay_token = %relay_token.expose_secret(),
        "Seeded demo account; these secrets are logged ONCE"
    );

    Ok(())
}
