pub mod agent;
pub mod cli;
pub mod config;
pub mod console;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;

use agent::ChatAgent;
use cli::Args;
use config::env::EnvReport;
use config::prompt::{ self, PromptConfig };
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub const DEFAULT_ENV_FILE: &str = ".env";

pub fn build_agent(args: &Args) -> Result<ChatAgent, Box<dyn Error + Send + Sync>> {
    let llm_config = args.llm_config();
    llm_config.validate()?;

    let prompt_config = match &args.prompts_path {
        Some(path) => prompt::load_prompts(path)?,
        None => PromptConfig::default(),
    };
    prompt_config.validate()?;

    Ok(ChatAgent::new(Arc::new(llm_config), prompt_config))
}

pub async fn run(args: Args, env_report: EnvReport) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Pipeline Configuration ---");
    info!("Environment keys present: {}", env_report.present().join(", "));
    env_report.log();
    info!("Chat Backend: {}", args.backend);
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or(args.backend.default_model()));
    info!("Chat Base URL: {}", args.chat_base_url.as_deref().unwrap_or(args.backend.default_base_url()));
    info!("Temperature: {}", args.temperature);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("built-in"));
    info!("Mode: {}", if args.serve { "websocket server" } else { "console" });
    if args.serve {
        info!("Server Address: {}", args.server_addr);
    }
    info!("------------------------------");

    let agent = build_agent(&args)?;

    if args.serve {
        let server = Server::new(args.server_addr.clone(), Arc::new(agent), args.server_api_key.clone());
        info!("Starting server on: {}", args.server_addr);
        server.run().await?;
    } else {
        console::run_console(&agent).await?;
    }

    Ok(())
}
