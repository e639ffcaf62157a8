use anyhow::Result;
use log::{error, info};
use std::env;

use streamcore::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting StreamCore v{}", streamcore::VERSION);

    // First argument or STREAMCORE_CONFIG points at a YAML file; otherwise env vars decide
    let config_path = env::args().nth(1).or_else(|| env::var("STREAMCORE_CONFIG").ok());
    let config = match config_path {
        Some(path) => StreamCoreConfig::load(&path).await?,
        None => {
            info!("No config file given, enabling platforms from environment variables");
            StreamCoreConfig::from_env()
        }
    };

    let shutdown = ShutdownSignal::new();
    let hub = ChatHub::from_config(&config, shutdown.clone());
    if hub.platforms().is_empty() {
        error!("No platform is configured. Set TWITCH_CHANNEL, YOUTUBE_OAUTH_TOKEN or MIXER_OAUTH_TOKEN.");
        return Err(anyhow::anyhow!("nothing to connect to"));
    }

    let logger = hub.client("chat-log");
    for message_type in [MessageType::Message, MessageType::Join, MessageType::Part, MessageType::Moderation, MessageType::Notice] {
        logger.on(message_type, |msg| {
            info!(
                "[{}] #{} {} <{}> {}",
                msg.platform().map(|p| p.as_str()).unwrap_or("local"),
                msg.channel,
                msg.message_type,
                msg.user.display_name,
                msg.message
            );
            Ok(())
        });
    }

    hub.initialize_all();
    shutdown.listen_for_os_signals();

    info!("Connecting to {:?}, press Ctrl+C to stop", hub.platforms());
    shutdown.cancelled().await;

    hub.shutdown().await;
    info!("StreamCore stopped");
    Ok(())
}
