//! Broadcast + history sink for decoded commands.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::CommandEnvelope;

/// Default number of commands retained for late subscribers.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Default live channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Outward sink for commands emitted by the inbound pipeline.
///
/// Consumers that attach late receive the retained history, then
/// seamlessly switch to live commands.
pub struct CommandFeed {
    history: RwLock<VecDeque<CommandEnvelope>>,
    history_limit: usize,
    sender: broadcast::Sender<CommandEnvelope>,
}

impl Default for CommandFeed {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT, DEFAULT_CHANNEL_CAPACITY)
    }
}

impl CommandFeed {
    /// Create a feed retaining at most `history_limit` commands.
    #[must_use]
    pub fn new(history_limit: usize, channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            history: RwLock::new(VecDeque::with_capacity(history_limit.min(32))),
            history_limit,
            sender,
        }
    }

    /// Push a command to both live listeners and history.
    pub fn push(&self, command: CommandEnvelope) {
        let _ = self.sender.send(command.clone()); // live listeners

        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(command);
    }

    /// Get a receiver for live commands.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<CommandEnvelope> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<CommandEnvelope> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live commands.
    ///
    /// Live commands dropped because the subscriber lagged are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, CommandEnvelope> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(command) => Some(command),
                Err(e) => {
                    tracing::warn!("command feed subscriber lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}
