// Copyright © 2025 Nipun Kumar

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum InboundLine {
    Stdout(String),
    Stderr(String),
}

/// Newline-delimited JSON over a child's stdio.
pub struct StdioTransport {
    stdin: ChildStdin,
    rx_lines: Option<mpsc::UnboundedReceiver<InboundLine>>,
}

impl StdioTransport {
    pub fn new(stdout: ChildStdout, stderr: ChildStderr, stdin: ChildStdin) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut out_reader = BufReader::new(stdout).lines();
        let tx_out = tx.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = out_reader.next_line().await {
                if tx_out.send(InboundLine::Stdout(line)).is_err() {
                    break;
                }
            }
        });

        let mut err_reader = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = err_reader.next_line().await {
                if tx.send(InboundLine::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        Self {
            stdin,
            rx_lines: Some(rx),
        }
    }

    /// Hands out the inbound line receiver. Only the first caller gets it.
    pub fn take_lines(&mut self) -> Option<mpsc::UnboundedReceiver<InboundLine>> {
        self.rx_lines.take()
    }

    pub async fn send_json<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let mut s = serde_json::to_string(msg)?;
        s.push('\n');
        self.stdin
            .write_all(s.as_bytes())
            .await
            .context("writing to child stdin")?;
        self.stdin.flush().await?;
        Ok(())
    }
}
