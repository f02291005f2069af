use std::sync::Arc;

use teloxide::prelude::*;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use wgbot::config::Config;
use wgbot::household::commands::{Command, CommandState, MemeClient, handle_command, handle_unknown_command};
use wgbot::household::{
    ChatBinding, DeploymentGuard, Event, InboundMessage, KeyValueStore, Notifier, SqliteStore,
    TelegramTransport, spawn_schedule,
};
use wgbot::telegram_log;

/// Buffered events between the producers and the notifier.
const EVENT_QUEUE: usize = 64;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wgbot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("wgbot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        let tg_layer = telegram_log::TelegramLogLayer::new(bot.clone(), log_chat_id);
        registry.with(tg_layer).init();
    } else {
        registry.init();
    }

    info!("Starting wgbot...");
    info!("Loaded config from {config_path}");
    info!("Time zone: {}, {} rule(s)", config.timezone, config.rules.len());
    if config.local {
        info!("LOCAL mode: household reminders go to the dev chat");
    }
    match config.wg_chat_id {
        Some(id) => info!("Household chat fixed to {}", id),
        None => info!("Household chat follows '<prefix> ...' binding"),
    }

    let store: Option<Arc<dyn KeyValueStore>> = match SqliteStore::open(&config.data_dir.join("wgbot.db")) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Store unavailable, running without deployment and fire tracking: {}", e);
            None
        }
    };

    let transport = Arc::new(TelegramTransport::new(bot.clone()));
    let composer = config.composer();

    // Runs once, before any schedule or message handler exists
    match store {
        Some(ref store) => {
            DeploymentGuard::new(store.as_ref(), &composer)
                .check_and_announce(&config.build, transport.as_ref(), config.dev_chat_id, config.send_timeout)
                .await;
        }
        None => warn!("Skipping deployment check"),
    }

    let (events, rx) = mpsc::channel::<Event>(EVENT_QUEUE);
    for rule in config.rules.iter().cloned() {
        spawn_schedule(rule, config.timezone, events.clone());
    }

    let notifier = Notifier::new(
        config.rules.clone(),
        ChatBinding::new(config.control.clone()),
        composer.clone(),
        transport.clone(),
        store,
        config.routing(),
        config.send_timeout,
    );
    tokio::spawn(notifier.run(rx));

    let memes = config.meme_api_url.clone().and_then(|url| {
        MemeClient::new(url, config.send_timeout)
            .map_err(|e| warn!("Meme client disabled: {}", e))
            .ok()
    });
    let commands = Arc::new(CommandState {
        composer,
        transport: TelegramTransport::new(bot.clone()),
        memes,
        send_timeout: config.send_timeout,
    });

    if let Err(e) = bot.delete_webhook().drop_pending_updates(true).await {
        warn!("Failed to drop pending updates: {e}");
    }

    let handler = Update::filter_message()
        .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
        .branch(
            dptree::filter(|msg: Message| msg.text().is_some_and(|t| t.starts_with('/')))
                .endpoint(handle_unknown_command),
        )
        .branch(dptree::endpoint(handle_text));

    info!("Bot started");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![commands, events])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/// Free text goes to the notifier, which owns the chat binding.
async fn handle_text(msg: Message, events: mpsc::Sender<Event>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let inbound = InboundMessage { text: text.to_string(), chat_id: msg.chat.id.0 };
    if events.send(Event::Inbound(inbound)).await.is_err() {
        error!("Notifier is gone, dropping message from {}", msg.chat.id);
    }
    Ok(())
}
