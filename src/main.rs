use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use subbot::commands::{CODE_USAGE, LinkCommand, cooldown_reply, parse_command};
use subbot::config::Config;
use subbot::linking::{BridgeClient, LinkMode, LinkRequest, LinkStart, Linker};
use subbot::telegram::TelegramClient;
use subbot::telegram_log;

struct BotState {
    config: Config,
    linker: Arc<Linker>,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "subbot.json".to_string());
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
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("subbot.log"))
        .expect("Failed to open log file");
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

    info!("🚀 Starting subbot...");
    info!("Loaded config from {config_path}");
    info!("Sessions in {}", config.sessions_dir.display());
    if !config.linking.restart_after_cooldown {
        info!("Restart after cooldown disabled");
    }

    let protocol = Arc::new(BridgeClient::new(config.bridge.command.clone(), config.bridge.args.clone()));
    let messenger = Arc::new(TelegramClient::new(bot.clone()));
    let linker = Arc::new(Linker::new(
        protocol,
        messenger,
        config.sessions_dir.clone(),
        config.linking.clone(),
    ));

    let swept = linker.sweep_orphans();
    if swept > 0 {
        info!("🧹 Swept {swept} orphaned auth dir(s)");
    }
    linker.restore_linked().await;

    let state = Arc::new(BotState { config, linker });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_new_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_new_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if !state.config.is_allowed_chat(msg.chat.id) {
        return Ok(());
    }

    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(command) = msg.text().and_then(parse_command) else {
        return Ok(());
    };

    let username = user.username.as_deref().unwrap_or(&user.first_name);

    let (mode, phone) = match command {
        LinkCommand::Code { phone } => (LinkMode::Code, Some(phone)),
        LinkCommand::Qr => (LinkMode::Qr, None),
        LinkCommand::CodeUsage => {
            reply(&bot, &msg, CODE_USAGE).await;
            return Ok(());
        }
    };

    info!("📨 {mode} link request from {username} ({}) in {}", user.id, msg.chat.id.0);

    let request = LinkRequest {
        user_id: user.id.0.to_string(),
        chat_id: msg.chat.id.0,
        reply_to: Some(msg.id.0 as i64),
        mode,
        phone,
    };

    match state.linker.request_link(request).await {
        Ok(LinkStart::Denied { remaining }) => {
            reply(&bot, &msg, &cooldown_reply(remaining)).await;
        }
        Ok(LinkStart::Started(handle)) => {
            // The attempt reports its own outcome; the handle can be detached.
            info!("🔗 Attempt {} started ({})", handle.session_id, handle.mode);
        }
        Err(e) => {
            warn!("Link request from {username} failed: {e}");
            reply(&bot, &msg, &format!("❌ Could not start linking: {e}")).await;
        }
    }

    Ok(())
}

async fn reply(bot: &Bot, msg: &Message, text: &str) {
    if let Err(e) = bot
        .send_message(msg.chat.id, text)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await
    {
        warn!("Failed to reply: {e}");
    }
}
