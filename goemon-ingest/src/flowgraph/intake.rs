//! Intake stage: forwards the channel's ordered log stream into the graph.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use goemon_core::metrics::IngestMetrics;
use goemon_core::types::Message;
use goemon_core::Result;

use super::CloseKind;

pub(crate) struct IntakeStage {
    channel_name: String,
    stream: mpsc::Receiver<Message>,
    out: mpsc::Sender<Message>,
    shutdown: watch::Receiver<CloseKind>,
    metrics: IngestMetrics,
}

impl IntakeStage {
    pub fn new(
        channel_name: String,
        stream: mpsc::Receiver<Message>,
        out: mpsc::Sender<Message>,
        shutdown: watch::Receiver<CloseKind>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            channel_name,
            stream,
            out,
            shutdown,
            metrics,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                maybe = self.stream.recv() => {
                    match maybe {
                        Some(message) => {
                            self.metrics.record_message();
                            debug!(channel = %self.channel_name, kind = message.kind(), "message received");
                            if self.out.send(message).await.is_err() {
                                // Downstream stage is gone; nothing left to feed.
                                break;
                            }
                        }
                        None => {
                            info!(channel = %self.channel_name, "log stream ended");
                            break;
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    // Both close kinds stop intake; graceful drain happens
                    // downstream once this stage drops its sender.
                    if *self.shutdown.borrow() != CloseKind::Open {
                        info!(channel = %self.channel_name, "intake stage stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
