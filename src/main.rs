// This is the entry point of the economy bot.
//
// **Architecture Overview:**
// - `core/` = Ledger logic (platform-agnostic), in the library
// - `infra/` = SQLite and in-memory stores, in the library
// - `discord/` = Discord-specific adapters (commands)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Set up the Discord framework
// 4. Register commands

#[path = "discord/discord_layer.rs"]
mod discord;

use crate::discord::{Data, Error};
use economy_ledger::core::economy::{
    Amount, Currency, CurrencyId, EconomyConfig, EconomyService, LogObserver, TransactionObserver,
};
use economy_ledger::infra::economy::SqliteEconomyStore;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Inserted when the currency table is empty so a fresh database can start.
fn starter_currency() -> Currency {
    Currency {
        id: CurrencyId(1),
        name_singular: "Dollar".to_string(),
        name_plural: "Dollars".to_string(),
        symbol: "$".to_string(),
        is_default: true,
        is_transferable: true,
        starting_balance: Amount::ZERO,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // RUST_LOG controls verbosity; the audit trail logs under `economy::audit`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("DISCORD_TOKEN").map_err(|_| {
        anyhow::anyhow!(
            "Missing DISCORD_TOKEN environment variable! Create a .env file with your bot token."
        )
    })?;

    let config = EconomyConfig::from_env()?;
    tracing::info!(
        database = %config.database_path,
        new_accounts = ?config.new_account_balances,
        backfill = ?config.backfill,
        "Economy configuration loaded"
    );

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // This is the "composition root" where we wire everything together.

    let store = SqliteEconomyStore::new(&config.database_path, config.max_connections).await?;
    if store.seed_currency_if_empty(&starter_currency()).await? {
        tracing::info!("Empty currency table, seeded the default currency");
    }

    let observers: Vec<Arc<dyn TransactionObserver>> = vec![Arc::new(LogObserver)];

    // Refuses to start when the currencies don't have exactly one default.
    let economy = Arc::new(EconomyService::start(Arc::new(store), config, observers).await?);

    let data = Data {
        economy: Arc::clone(&economy),
    };

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================

    let intents = serenity::GatewayIntents::GUILDS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                discord::commands::economy::balance(),
                discord::commands::economy::pay(),
                discord::commands::economy::currencies(),
                discord::commands::economy::reloadcurrencies(),
            ],
            on_error: |error| {
                Box::pin(async move {
                    if let poise::FrameworkError::Command { error, ctx, .. } = &error {
                        tracing::error!(
                            command = %ctx.command().name,
                            error = %error,
                            "Command failed"
                        );
                    }
                    if let Err(e) = poise::builtins::on_error(error).await {
                        tracing::error!("Error while handling error: {}", e);
                    }
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                tracing::info!("Commands registered, bot is ready");
                Ok::<Data, Error>(data)
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    client.start().await?;
    Ok(())
}
