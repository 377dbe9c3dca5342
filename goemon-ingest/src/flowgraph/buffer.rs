//! Buffering stage: lands surviving insert/delete payloads in the write
//! buffer and forwards flush-relevant events downstream.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use goemon_core::Result;

use super::{CheckpointEvent, CloseKind, FilteredMessage};
use crate::writebuffer::WriteBuffer;

pub(crate) struct BufferStage {
    rx: mpsc::Receiver<FilteredMessage>,
    out: mpsc::Sender<CheckpointEvent>,
    buffer: Arc<WriteBuffer>,
    shutdown: watch::Receiver<CloseKind>,
}

impl BufferStage {
    pub fn new(
        rx: mpsc::Receiver<FilteredMessage>,
        out: mpsc::Sender<CheckpointEvent>,
        buffer: Arc<WriteBuffer>,
        shutdown: watch::Receiver<CloseKind>,
    ) -> Self {
        Self {
            rx,
            out,
            buffer,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(message) => {
                            if !self.handle(message).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() == CloseKind::Forced {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(&mut self, message: FilteredMessage) -> bool {
        match message {
            FilteredMessage::Insert(payload) => {
                self.buffer.append_insert(
                    payload.segment_id,
                    payload.primary_keys,
                    payload.rows,
                    payload.timestamp,
                );
                true
            }
            FilteredMessage::DeleteRoute {
                segment_id,
                primary_keys,
                timestamp,
            } => {
                self.buffer.append_deletes(segment_id, primary_keys, timestamp);
                true
            }
            FilteredMessage::Seal { segment_id } => self
                .out
                .send(CheckpointEvent::Seal { segment_id })
                .await
                .is_ok(),
            FilteredMessage::Drop { segment_id } => {
                // Dropped segments never reach storage; their rows die here.
                self.buffer.discard(segment_id);
                self.out
                    .send(CheckpointEvent::Drop { segment_id })
                    .await
                    .is_ok()
            }
            FilteredMessage::Tick { timestamp } => self
                .out
                .send(CheckpointEvent::Tick { timestamp })
                .await
                .is_ok(),
        }
    }
}
