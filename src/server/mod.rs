pub mod websocket;

use crate::agent::ChatAgent;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    agent: Arc<ChatAgent>,
    api_key: Option<String>,
}

impl Server {
    pub fn new(addr: String, agent: Arc<ChatAgent>, api_key: Option<String>) -> Self {
        Self {
            addr,
            agent,
            api_key,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(&self.addr, Arc::clone(&self.agent), self.api_key.clone()).await
    }
}
