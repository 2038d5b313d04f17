pub mod hf_hub;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::{ Future, Stream, StreamExt };
use log::{ debug, warn };
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use super::{ Backend, LlmConfig, LlmError };
use self::hf_hub::HfHubChatClient;
use self::ollama::OllamaChatClient;
use self::openai::OpenAIChatClient;
use crate::config::prompt::Prompt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type FragmentStream = Pin<
    Box<dyn Stream<Item = Result<String, Box<dyn StdError + Send + Sync>>> + Send>
>;

/// A handle to one backend. Replies arrive as incremental text fragments.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream_chat(
        &self,
        prompt: &Prompt
    ) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>>;

    fn model(&self) -> &str;
    fn backend(&self) -> Backend;
}

/// Builds a fresh model handle for each request.
pub trait ModelProvider: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn ChatClient>, Box<dyn StdError + Send + Sync>>;
    fn backend(&self) -> Backend;
}

impl ModelProvider for LlmConfig {
    fn connect(&self) -> Result<Arc<dyn ChatClient>, Box<dyn StdError + Send + Sync>> {
        new_client(self)
    }

    fn backend(&self) -> Backend {
        self.backend
    }
}

pub fn new_client(
    config: &LlmConfig
) -> Result<Arc<dyn ChatClient>, Box<dyn StdError + Send + Sync>> {
    config.validate()?;
    let client: Arc<dyn ChatClient> = match config.backend {
        Backend::HfHub => {
            let specific_client = HfHubChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        Backend::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        Backend::Ollama => {
            let specific_client = OllamaChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    debug!("Constructed {} client for model {}", config.backend, client.model());
    Ok(client)
}

pub(crate) fn require_api_key(config: &LlmConfig) -> Result<String, LlmError> {
    match (&config.api_key, config.backend.api_key_env()) {
        (Some(key), _) if !key.trim().is_empty() => Ok(key.clone()),
        (_, Some(env_key)) =>
            Err(LlmError::MissingApiKey {
                backend: config.backend,
                env_key,
            }),
        (_, None) => Ok(String::new()),
    }
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> FragmentStream
    where
        F: FnOnce(mpsc::Sender<Result<String, Box<dyn StdError + Send + Sync>>>) -> Fut +
            Send +
            'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

pub type LineParser = fn(&str) -> Result<Option<String>, LlmError>;

/// POSTs `payload` and turns the response body into a fragment stream, one
/// parser call per complete line. Lines split across network chunks are
/// reassembled before parsing.
pub async fn http_stream_generate(
    http: reqwest::Client,
    url: String,
    payload: impl serde::Serialize + Send + 'static,
    line_parser: LineParser,
    headers: Vec<(String, String)>
) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>> {
    let mut req = http.post(&url).json(&payload);
    for (name, value) in headers {
        req = req.header(name, value);
    }

    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(
            Box::new(LlmError::Http {
                status: status.as_u16(),
                body,
            })
        );
    }

    Ok(
        create_streaming_response(move |tx| async move {
            let mut bytes = resp.bytes_stream();
            let mut pending: Vec<u8> = Vec::new();
            let mut produced = false;
            let mut first_skipped: Option<String> = None;

            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(buf) => {
                        pending.extend_from_slice(&buf);
                        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = pending.drain(..=pos).collect();
                            match forward_line(&tx, &line, line_parser).await {
                                LineOutcome::Forwarded => {
                                    produced = true;
                                }
                                LineOutcome::Skipped(text) => {
                                    first_skipped.get_or_insert(text);
                                }
                                LineOutcome::Blank => {}
                                LineOutcome::Stop => {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Box::new(e) as _)).await;
                        return;
                    }
                }
            }

            if !pending.is_empty() {
                match forward_line(&tx, &pending, line_parser).await {
                    LineOutcome::Forwarded => {
                        produced = true;
                    }
                    LineOutcome::Skipped(text) => {
                        first_skipped.get_or_insert(text);
                    }
                    LineOutcome::Blank => {}
                    LineOutcome::Stop => {
                        return;
                    }
                }
            }

            // A 200 body that never yields text is a shape the parser does not
            // understand (or an empty body), not an empty reply.
            if !produced {
                let detail = match first_skipped {
                    Some(line) => line.chars().take(MAX_BODY_SNIPPET).collect::<String>(),
                    None => "<empty>".to_string(),
                };
                warn!("Response from {} produced no text: {}", url, detail);
                let err = LlmError::Backend(format!("unrecognised response body: {}", detail));
                let _ = tx.send(Err(Box::new(err) as _)).await;
            }
        })
    )
}

const MAX_BODY_SNIPPET: usize = 200;

enum LineOutcome {
    Forwarded,
    Skipped(String),
    Blank,
    Stop,
}

async fn forward_line(
    tx: &mpsc::Sender<Result<String, Box<dyn StdError + Send + Sync>>>,
    raw: &[u8],
    line_parser: LineParser
) -> LineOutcome {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(|c: char| c == '\r' || c == '\n');
    if line.trim().is_empty() {
        return LineOutcome::Blank;
    }
    match line_parser(line) {
        Ok(Some(fragment)) => {
            if tx.send(Ok(fragment)).await.is_ok() { LineOutcome::Forwarded } else { LineOutcome::Stop }
        }
        Ok(None) => LineOutcome::Skipped(line.to_string()),
        Err(e) => {
            let _ = tx.send(Err(Box::new(e) as _)).await;
            LineOutcome::Stop
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::io::{ AsyncReadExt, AsyncWriteExt };
    use tokio::net::TcpListener;

    /// Serves exactly one HTTP request with the given status and body, then
    /// hands the raw request back through the join handle.
    pub async fn serve_once(
        status: &'static str,
        content_type: &'static str,
        body: String
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        (format!("http://{}", addr), handle)
    }
}
