use std::future::Future;
use std::time::Duration;

use ganglion_agent::mailbox::{InboundMessage, MailboxDispatcher, OutboundMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportSummary {
    pub received: usize,
    pub rejected: usize,
    pub replied: usize,
    pub abandoned: usize,
}

/// Line-delimited JSON mailbox: one [`InboundMessage`] per input line, one
/// [`OutboundMessage`] per output line. Returns once input ends or `shutdown`
/// resolves and outstanding replies drained (or `drain_timeout` elapsed).
pub async fn run<R, W, S>(
    reader: R,
    mut writer: W,
    dispatcher: &MailboxDispatcher,
    mut replies: mpsc::Receiver<OutboundMessage>,
    shutdown: S,
    drain_timeout: Duration,
) -> std::io::Result<TransportSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = reader.lines();
    let mut summary = TransportSummary::default();
    let mut pending = 0usize;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(event_name = "transport.shutdown", pending, "shutdown requested");
                break;
            }
            Some(reply) = replies.recv() => {
                write_reply(&mut writer, &reply).await?;
                pending = pending.saturating_sub(1);
                summary.replied += 1;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!(event_name = "transport.input_closed", pending, "input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundMessage>(&line) {
                    Ok(message) => {
                        dispatcher.dispatch(message);
                        pending += 1;
                        summary.received += 1;
                    }
                    Err(error) => {
                        warn!(
                            event_name = "transport.line_rejected",
                            error = %error,
                            "input line is not a valid message; skipped"
                        );
                        summary.rejected += 1;
                    }
                }
            }
        }
    }

    let drain = async {
        while pending > 0 {
            let Some(reply) = replies.recv().await else { break };
            write_reply(&mut writer, &reply).await?;
            pending -= 1;
            summary.replied += 1;
        }
        Ok::<(), std::io::Error>(())
    };
    match tokio::time::timeout(drain_timeout, drain).await {
        Ok(result) => result?,
        Err(_) => warn!(
            event_name = "transport.drain_timeout",
            timeout_ms = drain_timeout.as_millis() as u64,
            "gave up waiting for outstanding replies"
        ),
    }
    summary.abandoned = summary.received.saturating_sub(summary.replied);
    writer.flush().await?;
    Ok(summary)
}

async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &OutboundMessage,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(reply).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
