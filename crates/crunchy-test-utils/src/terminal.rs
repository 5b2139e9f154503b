use async_trait::async_trait;
use crunchy_sandbox::{SandboxError, TerminalProcess, TerminalSize};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Echoing terminal that exits when it receives an `exit` line.
///
/// Every write is echoed back verbatim. Resizes, kills, and raw input are
/// recorded for assertions.
pub struct FakeTerminal {
    state: Mutex<TerminalState>,
    output: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

struct TerminalState {
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    input: Vec<u8>,
    resizes: Vec<TerminalSize>,
    kills: usize,
    size: TerminalSize,
}

impl FakeTerminal {
    /// Start a terminal that greets with `prompt`.
    pub fn new(size: TerminalSize, prompt: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !prompt.is_empty() {
            let _ = sender.send(prompt.as_bytes().to_vec());
        }
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            state: Mutex::new(TerminalState {
                sender: Some(sender),
                input: Vec::new(),
                resizes: Vec::new(),
                kills: 0,
                size,
            }),
            output: tokio::sync::Mutex::new(receiver),
            exit_tx,
            exit_rx,
        }
    }

    /// Bytes written to the terminal so far.
    pub fn input(&self) -> Vec<u8> {
        self.state.lock().input.clone()
    }

    /// Every resize in the order it was received.
    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.state.lock().resizes.clone()
    }

    /// Current window size.
    pub fn size(&self) -> TerminalSize {
        self.state.lock().size
    }

    /// Number of kill requests.
    pub fn kills(&self) -> usize {
        self.state.lock().kills
    }

    /// Emit output as if the shell printed it.
    pub fn emit(&self, data: &[u8]) {
        if let Some(sender) = &self.state.lock().sender {
            let _ = sender.send(data.to_vec());
        }
    }

    fn finish(&self, state: &mut TerminalState, code: i32) {
        state.sender = None;
        let _ = self.exit_tx.send(Some(code));
    }
}

#[async_trait]
impl TerminalProcess for FakeTerminal {
    fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        let Some(sender) = state.sender.clone() else {
            return Err(SandboxError::ExecutionFailed(
                "terminal input closed".to_string(),
            ));
        };
        state.input.extend_from_slice(data);
        let _ = sender.send(data.to_vec());
        let text = String::from_utf8_lossy(&state.input).into_owned();
        if text.contains("exit\r") || text.contains("exit\n") {
            let _ = sender.send(b"\r\nlogout\r\n".to_vec());
            self.finish(&mut state, 0);
        }
        Ok(())
    }

    async fn read(&self) -> Option<Vec<u8>> {
        self.output.lock().await.recv().await
    }

    fn resize(&self, size: TerminalSize) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        state.resizes.push(size);
        state.size = size;
        Ok(())
    }

    fn kill(&self) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        state.kills += 1;
        if state.sender.is_some() {
            self.finish(&mut state, 137);
        }
        Ok(())
    }

    async fn wait(&self) -> Option<i32> {
        let mut exit = self.exit_rx.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        }
    }
}
