//! Human approval gate.
//!
//! Only an exact accept or reject token changes anything. Empty input and
//! anything else re-prompts within the same timeout window; silence until
//! the deadline is reported as [`HumanResponse::TimedOut`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use warden_types::{Result, WardenError};

pub const DEFAULT_HUMAN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_ACCEPT_TOKEN: &str = "approve";
pub const DEFAULT_REJECT_TOKEN: &str = "reject";

/// Something that can show a message and wait for one line of reply.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// `Ok(None)` means no further input will ever arrive.
    async fn prompt(&self, message: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanResponse {
    Accept,
    Reject,
    TimedOut,
}

pub struct HumanGate {
    prompter: Arc<dyn Prompter>,
    accept_token: String,
    reject_token: String,
    timeout: Duration,
}

impl HumanGate {
    pub fn new(prompter: Arc<dyn Prompter>) -> Self {
        Self {
            prompter,
            accept_token: DEFAULT_ACCEPT_TOKEN.into(),
            reject_token: DEFAULT_REJECT_TOKEN.into(),
            timeout: DEFAULT_HUMAN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tokens(mut self, accept: impl Into<String>, reject: impl Into<String>) -> Result<Self> {
        let (accept, reject) = (accept.into(), reject.into());
        if accept.trim().is_empty() || reject.trim().is_empty() || accept.trim() == reject.trim() {
            return Err(WardenError::Config(
                "accept and reject tokens must be distinct and non-empty".into(),
            ));
        }
        self.accept_token = accept.trim().to_string();
        self.reject_token = reject.trim().to_string();
        Ok(self)
    }

    /// Interpret one reply. Matching is exact after trimming whitespace.
    pub fn parse(&self, reply: &str) -> Option<HumanResponse> {
        let reply = reply.trim();
        if reply == self.accept_token {
            Some(HumanResponse::Accept)
        } else if reply == self.reject_token {
            Some(HumanResponse::Reject)
        } else {
            None
        }
    }

    /// Block until an explicit token arrives or the window closes.
    pub async fn ask(&self, message: &str) -> Result<HumanResponse> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut text = format!(
            "{message}\nType '{}' to continue or '{}' to abort:",
            self.accept_token, self.reject_token
        );
        loop {
            match tokio::time::timeout_at(deadline, self.prompter.prompt(&text)).await {
                Err(_) => return Ok(HumanResponse::TimedOut),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) => {
                    tokio::time::sleep_until(deadline).await;
                    return Ok(HumanResponse::TimedOut);
                }
                Ok(Ok(Some(reply))) => match self.parse(&reply) {
                    Some(response) => return Ok(response),
                    None => {
                        tracing::warn!(reply = %reply.trim(), "Ignoring non-token reply");
                        text = format!(
                            "Please type exactly '{}' or '{}':",
                            self.accept_token, self.reject_token
                        );
                    }
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConsolePrompter
// ---------------------------------------------------------------------------

/// Prompts on stderr and reads replies from stdin, one prompt at a time.
///
/// Lines are read on a dedicated thread and queued, so a prompt abandoned
/// by the gate timeout never drops input already typed; the next prompt
/// picks it up.
pub struct ConsolePrompter {
    lines: tokio::sync::Mutex<mpsc::Receiver<std::io::Result<String>>>,
}

impl ConsolePrompter {
    pub fn new() -> Self {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: std::io::BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        // A plain thread: a blocking stdin read must not hold up runtime shutdown.
        std::thread::spawn(move || read_lines(reader, tx));
        Self {
            lines: tokio::sync::Mutex::new(rx),
        }
    }
}

fn read_lines<R: std::io::BufRead>(mut reader: R, tx: mpsc::Sender<std::io::Result<String>>) {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                if tx.blocking_send(Ok(line)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

impl Default for ConsolePrompter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prompter for ConsolePrompter {
    async fn prompt(&self, message: &str) -> Result<Option<String>> {
        let mut lines = self.lines.lock().await;
        eprintln!("\n{message}");
        match lines.recv().await {
            Some(line) => Ok(Some(line?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedPrompter
// ---------------------------------------------------------------------------

/// Replays canned replies, then stays silent forever.
pub struct ScriptedPrompter {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A prompter that never answers.
    pub fn silent() -> Self {
        Self::new(Vec::<String>::new())
    }

    /// Every prompt shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn prompt(&self, message: &str) -> Result<Option<String>> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.to_string());
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(reply) => Ok(Some(reply)),
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(replies: &[&str]) -> (HumanGate, Arc<ScriptedPrompter>) {
        let prompter = Arc::new(ScriptedPrompter::new(replies.iter().copied()));
        let gate = HumanGate::new(prompter.clone()).with_timeout(Duration::from_secs(60));
        (gate, prompter)
    }

    #[tokio::test]
    async fn exact_tokens_are_honoured() {
        let (g, _) = gate(&["approve"]);
        assert_eq!(g.ask("Draft ready").await.unwrap(), HumanResponse::Accept);
        let (g, _) = gate(&["  reject\n"]);
        assert_eq!(g.ask("Draft ready").await.unwrap(), HumanResponse::Reject);
    }

    #[tokio::test]
    async fn soft_confirmations_reprompt() {
        let (g, prompter) = gate(&["", "y", "yes", "Approve", "approve please", "approve"]);
        assert_eq!(g.ask("Draft ready").await.unwrap(), HumanResponse::Accept);
        assert_eq!(prompter.prompts().len(), 6);
        assert!(prompter.prompts()[1].starts_with("Please type exactly"));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (g, _) = gate(&[]);
        assert_eq!(g.ask("Anyone?").await.unwrap(), HumanResponse::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_input_never_advances() {
        let (g, prompter) = gate(&["ok", "sure", "lgtm"]);
        assert_eq!(g.ask("Anyone?").await.unwrap(), HumanResponse::TimedOut);
        assert_eq!(prompter.prompts().len(), 4);
    }

    #[test]
    fn custom_tokens_must_be_distinct() {
        let prompter = Arc::new(ScriptedPrompter::silent());
        assert!(HumanGate::new(prompter.clone()).with_tokens("go", "go").is_err());
        assert!(HumanGate::new(prompter.clone()).with_tokens("", "stop").is_err());
        let g = HumanGate::new(prompter).with_tokens("ship-it", "stop").unwrap();
        assert_eq!(g.parse("ship-it"), Some(HumanResponse::Accept));
        assert_eq!(g.parse("approve"), None);
    }

    struct ClosedInput;

    #[async_trait]
    impl Prompter for ClosedInput {
        async fn prompt(&self, _message: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_waits_out_the_window() {
        let g = HumanGate::new(Arc::new(ClosedInput)).with_timeout(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        assert_eq!(g.ask("x").await.unwrap(), HumanResponse::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    /// Hands out its bytes in chunks as the test releases them.
    struct ChunkedInput {
        chunks: std::sync::mpsc::Receiver<Vec<u8>>,
        pending: VecDeque<u8>,
    }

    impl std::io::Read for ChunkedInput {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.chunks.recv() {
                    Ok(chunk) => self.pending.extend(chunk),
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    #[tokio::test]
    async fn console_keeps_a_line_typed_across_a_timeout() {
        let (chunks, rx) = std::sync::mpsc::channel();
        let prompter = ConsolePrompter::from_reader(std::io::BufReader::new(ChunkedInput {
            chunks: rx,
            pending: VecDeque::new(),
        }));

        chunks.send(b"appr".to_vec()).unwrap();
        let first = tokio::time::timeout(Duration::from_millis(100), prompter.prompt("approve?")).await;
        assert!(first.is_err());

        chunks.send(b"ove\n".to_vec()).unwrap();
        let line = prompter.prompt("approve?").await.unwrap();
        assert_eq!(line.as_deref(), Some("approve\n"));

        drop(chunks);
        assert_eq!(prompter.prompt("approve?").await.unwrap(), None);
    }
}
