//! Interactive companion chat over stdin/stdout.
//!
//! Usage: `hibiki-chat [CONFIG_PATH]`
//!
//! Each input line is sent as a user turn. Commands:
//! - `/reset` clears the conversation
//! - `/bridge <json>` applies a remote bridge event
//! - `/quit` exits

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use hibiki::bridge::BridgeEvent;
use hibiki::chat::{
    ChatPipeline, ChatProvider, FLUSH_MARKER, FsHistoryStore, HookOptions, ProviderConfig,
    SendOptions,
};
use hibiki::config::CompanionConfig;
use hibiki::idle::{ActiveModel, IdleTalkEngine, StaticModelSource, TalkingFlag};
use hibiki::knowledge::http::HttpKnowledgeStore;
use hibiki::knowledge::injection::KnowledgeInjector;
use hibiki::knowledge::{KnowledgeStore, StaticKnowledgeStore};
use hibiki::providers::{OpenAiConfig, OpenAiProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(CompanionConfig::default_config_path);
    let config = if config_path.exists() {
        CompanionConfig::from_file(&config_path)?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        CompanionConfig::default()
    };
    config.validate()?;

    let mut pipeline = ChatPipeline::new(&config.chat);
    if let Some(dir) = config.chat.history_dir() {
        pipeline = pipeline.with_store(Arc::new(FsHistoryStore::new(dir)?));
    }
    if let Err(e) = pipeline.load_history().await {
        warn!(error = %e, "failed to restore history, starting fresh");
    }

    pipeline.hooks().on_token_literal(
        |text| async move {
            let mut stdout = std::io::stdout();
            if text == FLUSH_MARKER {
                writeln!(stdout)?;
            } else {
                write!(stdout, "{text}")?;
            }
            stdout.flush()?;
            Ok::<(), hibiki::CompanionError>(())
        },
        HookOptions::persistent(),
    );

    let mut openai = OpenAiConfig::new(config.provider.base_url.clone());
    if let Some(key) = &config.provider.api_key {
        openai = openai.with_api_key(key.clone());
    }
    let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::new(openai));
    let provider_config = ProviderConfig {
        headers: config.provider.headers.clone(),
    };

    let knowledge: Arc<dyn KnowledgeStore> = if config.knowledge.enabled {
        Arc::new(HttpKnowledgeStore::from_config(&config.knowledge))
    } else {
        Arc::new(StaticKnowledgeStore::default())
    };

    let talking = TalkingFlag::new();
    let _injector = config.knowledge.enabled.then(|| {
        KnowledgeInjector::new(
            Arc::clone(&knowledge),
            pipeline.clone(),
            talking.clone(),
            &config.knowledge,
        )
        .install()
    });

    let models = Arc::new(StaticModelSource::new(ActiveModel {
        model: config.provider.model.clone(),
        provider: Arc::clone(&provider),
        provider_config: provider_config.clone(),
    }));
    let idle = IdleTalkEngine::new(
        config.idle_talk.clone(),
        pipeline.clone(),
        knowledge,
        models,
        talking,
    );
    idle.initialize();

    info!(model = %config.provider.model, "hibiki-chat ready");

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(line) = lines.next().await {
        let line = line?;
        let text = line.trim();
        match text {
            "" => continue,
            "/quit" => break,
            "/reset" => {
                pipeline.cleanup_messages().await;
                idle.reset_idle_timer(true);
                continue;
            }
            _ => {}
        }

        if let Some(raw) = text.strip_prefix("/bridge ") {
            match BridgeEvent::from_json(raw) {
                Ok(event) => {
                    if let Some(cue) = event.apply(&pipeline).await {
                        info!(url = %cue.audio_url, "audio cue received");
                    }
                }
                Err(e) => warn!(error = %e, "ignoring bridge event"),
            }
            continue;
        }

        let options = SendOptions::new(config.provider.model.clone(), Arc::clone(&provider))
            .with_provider_config(provider_config.clone());
        if let Err(e) = pipeline.send(text, options).await {
            warn!(error = %e, "turn failed");
        }
    }

    idle.dispose();
    info!("hibiki-chat exiting");
    Ok(())
}
