// Live Queue
//
// Channel-keyed buffers of recent messages. Push prunes by a cutoff derived
// from the newest message ID; reads prune by wall-clock cutoff. Subscribers
// block on a per-channel notification woken by every push.

use crate::application::worker::ShutdownToken;
use crate::domain::{Channel, Id, LiveMsg};
use crate::port::TimeProvider;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Default)]
struct ChannelBuf {
    msgs: Mutex<VecDeque<LiveMsg>>,
    notify: Notify,
}

impl ChannelBuf {
    fn lock(&self) -> MutexGuard<'_, VecDeque<LiveMsg>> {
        self.msgs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LiveQueue {
    ttl_ms: i64,
    max_per_channel: usize,
    clock: Arc<dyn TimeProvider>,
    channels: Mutex<HashMap<Channel, Arc<ChannelBuf>>>,
}

impl LiveQueue {
    /// Create a queue
    ///
    /// # Arguments
    /// * `ttl` - Messages older than this are pruned
    /// * `max_per_channel` - Per-channel cap, oldest dropped first
    ///
    /// # Panics
    /// If `max_per_channel` is zero.
    pub fn new(ttl: Duration, max_per_channel: usize, clock: Arc<dyn TimeProvider>) -> Self {
        assert!(max_per_channel > 0, "live queue needs room for one message");
        Self {
            ttl_ms: ttl.as_millis() as i64,
            max_per_channel,
            clock,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<Channel, Arc<ChannelBuf>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer(&self, channel: &Channel) -> Arc<ChannelBuf> {
        self.channels()
            .entry(channel.clone())
            .or_default()
            .clone()
    }

    fn existing_buffer(&self, channel: &Channel) -> Option<Arc<ChannelBuf>> {
        self.channels().get(channel).cloned()
    }

    fn cutoff_at(&self, unix_ms: i64) -> Id {
        Id::min_at(unix_ms - self.ttl_ms)
    }

    /// Append a message and wake subscribers. Never blocks on readers.
    ///
    /// Returns false if the message was already older than the TTL relative
    /// to the newest message in the channel and was dropped.
    pub fn push(&self, channel: &Channel, msg: LiveMsg) -> bool {
        let buf = self.buffer(channel);
        let accepted = {
            let mut msgs = buf.lock();
            let newest = msgs.iter().map(|m| m.id).max().unwrap_or(Id::ZERO).max(msg.id);
            let cutoff = self.cutoff_at(newest.time_millis());
            msgs.retain(|m| m.id >= cutoff);

            if msg.id < cutoff {
                false
            } else {
                while msgs.len() >= self.max_per_channel {
                    msgs.pop_front();
                }
                msgs.push_back(msg);
                true
            }
        };

        if accepted {
            buf.notify.notify_waiters();
        } else {
            debug!(channel = %channel, "dropped stale live message");
        }
        accepted
    }

    /// Messages with `ID > after` that are still inside the TTL at `now_ms`,
    /// in push order.
    pub fn messages_after(&self, channel: &Channel, after: Id, now_ms: i64) -> Vec<LiveMsg> {
        match self.existing_buffer(channel) {
            Some(buf) => self.collect(&buf, after, now_ms),
            None => Vec::new(),
        }
    }

    fn collect(&self, buf: &ChannelBuf, after: Id, now_ms: i64) -> Vec<LiveMsg> {
        let cutoff = self.cutoff_at(now_ms);
        let mut msgs = buf.lock();
        msgs.retain(|m| m.id >= cutoff);
        msgs.iter().filter(|m| m.id > after).cloned().collect()
    }

    /// Block until messages after `after` exist or `cancelled` resolves.
    /// Cancellation yields an empty list.
    pub async fn wait_messages<C>(&self, channel: &Channel, after: Id, cancelled: C) -> Vec<LiveMsg>
    where
        C: Future<Output = ()>,
    {
        let buf = self.buffer(channel);
        tokio::pin!(cancelled);

        loop {
            let notified = buf.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed
            notified.as_mut().enable();

            let msgs = self.collect(&buf, after, self.clock.now_millis());
            if !msgs.is_empty() {
                return msgs;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = &mut cancelled => return Vec::new(),
            }
        }
    }

    /// Stream messages to `writer` as server-sent events until `cancel`
    /// fires. Returns the ID of the last message written.
    pub async fn stream_to<W>(
        &self,
        cancel: &ShutdownToken,
        channel: &Channel,
        mut after: Id,
        writer: &mut W,
    ) -> std::io::Result<Id>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while !cancel.is_shutdown() {
            let msgs = self.wait_messages(channel, after, cancel.wait()).await;
            for msg in &msgs {
                msg.write_sse(writer).await?;
                after = after.max(msg.id);
            }
            if !msgs.is_empty() {
                writer.flush().await?;
            }
        }
        Ok(after)
    }

    /// Drop empty channels nobody is waiting on
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut channels = self.channels();
        let before = channels.len();
        channels.retain(|_, buf| {
            let cutoff = self.cutoff_at(now);
            let mut msgs = buf.lock();
            msgs.retain(|m| m.id >= cutoff);
            !msgs.is_empty() || Arc::strong_count(buf) > 1
        });
        before - channels.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Periodic sweeper task body
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: ShutdownToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, "swept idle live channels");
                    }
                }
                _ = shutdown.wait() => {
                    info!("Live queue sweeper stopped");
                    break;
                }
            }
        }
    }
}
