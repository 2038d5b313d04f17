use clap::Parser;
use pipeline_chatbot::cli::Args;
use pipeline_chatbot::config::env::load_env_file;
use pipeline_chatbot::{ run, DEFAULT_ENV_FILE };
use std::error::Error;
use log::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Loaded before parsing so clap's env fallbacks see the file's values.
    let env_file = std::env::var("ENV_FILE").unwrap_or_else(|_| DEFAULT_ENV_FILE.to_string());
    let env_report = load_env_file(&env_file);

    let args = Args::parse();
    if let Err(e) = run(args, env_report).await {
        error!("Pipeline did not complete: {}", e);
        return Err(e);
    }

    Ok(())
}
