//! Message router and durable mailbox.
//!
//! Direct messages go straight to the recipient's session when it is
//! connected; otherwise they land in the recipient's mailbox table under a
//! monotonic per-recipient sequence and wait to be polled. Broadcasts and
//! channel publishes reach connected agents only. Mailboxes are bounded by
//! a per-recipient FIFO cap and a TTL, both enforced on write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::agents::AgentSupervisor;
use crate::constants::{MAILBOX_CAP_PER_RECIPIENT, MAILBOX_TTL_MS};
use crate::models::now_ms;
use crate::presence::PresenceCache;
use crate::protocol::OutboundFrame;
use crate::store::Table;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxEntry {
    pub seq: u64,
    pub from: String,
    pub recipient: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Pushed to the recipient's live session.
    Delivered,
    /// Recipient offline; parked in its mailbox.
    Queued,
}

/// Per-recipient sequence allocator record, stored in its own table so
/// sequences survive full mailbox eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqCounter {
    next: u64,
}

pub struct MessageRouter {
    mailbox: Arc<Table<MailboxEntry>>,
    seq: Arc<Table<SeqCounter>>,
    presence: PresenceCache,
    supervisor: Arc<AgentSupervisor>,
    /// Channel name → subscriber agent ids. Presence-scoped, not persisted.
    channels: RwLock<HashMap<String, HashSet<String>>>,
    /// Serializes sequence allocation per router.
    alloc: Mutex<()>,
    cap_per_recipient: usize,
    ttl_ms: i64,
}

impl MessageRouter {
    pub fn new(
        mailbox: Arc<Table<MailboxEntry>>,
        seq: Arc<Table<SeqCounter>>,
        presence: PresenceCache,
        supervisor: Arc<AgentSupervisor>,
    ) -> Self {
        Self {
            mailbox,
            seq,
            presence,
            supervisor,
            channels: RwLock::new(HashMap::new()),
            alloc: Mutex::new(()),
            cap_per_recipient: MAILBOX_CAP_PER_RECIPIENT,
            ttl_ms: MAILBOX_TTL_MS,
        }
    }

    fn entry_key(recipient: &str, seq: u64) -> String {
        // Zero-padded so lexicographic key order equals sequence order.
        format!("{recipient}:{seq:016}")
    }

    /// Sends to one agent, falling back to its mailbox when the session is
    /// gone.
    pub async fn send_direct(
        &self,
        from: &str,
        recipient: &str,
        payload: serde_json::Value,
        thread_id: Option<String>,
    ) -> Result<DeliveryOutcome> {
        if let Some(handle) = self.supervisor.lookup(recipient).await {
            if let Some(session) = handle.session.upgrade() {
                let frame = OutboundFrame::Message {
                    from: from.to_string(),
                    payload: payload.clone(),
                    thread_id: thread_id.clone(),
                };
                if session.send(frame).await.is_ok() {
                    debug!(%from, %recipient, "direct message delivered");
                    return Ok(DeliveryOutcome::Delivered);
                }
            }
        }

        self.enqueue(from, recipient, payload, thread_id).await?;
        Ok(DeliveryOutcome::Queued)
    }

    /// Delivers to every connected agent except the sender. Returns how many
    /// sessions took the frame.
    pub async fn broadcast(&self, from: &str, payload: serde_json::Value) -> usize {
        let mut delivered = 0;
        for snapshot in self.presence.list().await {
            if snapshot.agent_id == from {
                continue;
            }
            let Some(handle) = self.supervisor.lookup(&snapshot.agent_id).await else {
                continue;
            };
            let Some(session) = handle.session.upgrade() else {
                continue;
            };
            let frame = OutboundFrame::Message {
                from: from.to_string(),
                payload: payload.clone(),
                thread_id: None,
            };
            if session.send(frame).await.is_ok() {
                delivered += 1;
            }
        }
        info!(%from, delivered, "broadcast complete");
        delivered
    }

    pub async fn subscribe(&self, channel: &str, agent_id: &str) {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(agent_id.to_string());
    }

    pub async fn unsubscribe(&self, channel: &str, agent_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(agent_id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Drops every subscription held by a departing agent.
    pub async fn unsubscribe_all(&self, agent_id: &str) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, subscribers| {
            subscribers.remove(agent_id);
            !subscribers.is_empty()
        });
    }

    /// Publishes to a channel's connected subscribers.
    pub async fn publish_channel(
        &self,
        from: &str,
        channel: &str,
        payload: serde_json::Value,
    ) -> usize {
        let subscribers: Vec<String> = {
            let channels = self.channels.read().await;
            channels
                .get(channel)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for agent_id in subscribers {
            if agent_id == from {
                continue;
            }
            let Some(handle) = self.supervisor.lookup(&agent_id).await else {
                continue;
            };
            let Some(session) = handle.session.upgrade() else {
                continue;
            };
            let frame = OutboundFrame::Message {
                from: from.to_string(),
                payload: payload.clone(),
                thread_id: Some(format!("channel:{channel}")),
            };
            if session.send(frame).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn enqueue(
        &self,
        from: &str,
        recipient: &str,
        payload: serde_json::Value,
        thread_id: Option<String>,
    ) -> Result<()> {
        let _guard = self.alloc.lock().await;

        // The counter lives in its own table so sequences never regress,
        // even after every entry has been evicted.
        let counter = self
            .seq
            .lookup(recipient)
            .await
            .unwrap_or(SeqCounter { next: 1 });
        let seq = counter.next;
        self.seq
            .insert(recipient, &SeqCounter { next: seq + 1 })
            .await?;

        let entry = MailboxEntry {
            seq,
            from: from.to_string(),
            recipient: recipient.to_string(),
            payload,
            timestamp: now_ms(),
            thread_id,
        };
        self.mailbox
            .insert(&Self::entry_key(recipient, seq), &entry)
            .await?;
        debug!(%recipient, seq, "message queued to mailbox");

        self.evict(recipient).await?;
        Ok(())
    }

    /// TTL plus FIFO-cap eviction for one recipient.
    async fn evict(&self, recipient: &str) -> Result<()> {
        let prefix = format!("{recipient}:");
        let mut entries = self.mailbox.scan_prefix(&prefix).await;
        entries.sort_by_key(|(_, e)| e.seq);

        let cutoff = now_ms() - self.ttl_ms;
        let mut expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.timestamp < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        let live = entries.len() - expired.len();
        if live > self.cap_per_recipient {
            let overflow = live - self.cap_per_recipient;
            expired.extend(
                entries
                    .iter()
                    .filter(|(_, e)| e.timestamp >= cutoff)
                    .take(overflow)
                    .map(|(k, _)| k.clone()),
            );
        }

        for key in expired {
            self.mailbox.delete(&key).await?;
        }
        Ok(())
    }

    /// Poll interface: entries after `since_seq` plus the highest sequence
    /// seen, which the caller passes back next time.
    pub async fn fetch(
        &self,
        recipient: &str,
        since_seq: u64,
        limit: usize,
    ) -> (Vec<MailboxEntry>, u64) {
        let prefix = format!("{recipient}:");
        let cutoff = now_ms() - self.ttl_ms;
        let mut entries: Vec<MailboxEntry> = self
            .mailbox
            .scan_prefix(&prefix)
            .await
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.seq > since_seq && e.timestamp >= cutoff)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.truncate(limit);

        let max_seq = entries
            .last()
            .map(|e| e.seq)
            .unwrap_or(since_seq);
        (entries, max_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::queue::TaskQueue;
    use crate::session::{ChannelSession, SessionHandle};
    use crate::store::Store;
    use std::sync::Weak;

    struct Fixture {
        router: MessageRouter,
        supervisor: Arc<AgentSupervisor>,
        presence: PresenceCache,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path());
        let mut store = Store::open(config.store.clone());
        let bus = EventBus::new();
        let queue = Arc::new(
            TaskQueue::load(store.table("tasks").unwrap(), bus.clone(), config.queue).await,
        );
        let presence = PresenceCache::new();
        let supervisor = Arc::new(AgentSupervisor::new(
            queue,
            presence.clone(),
            bus,
            60_000,
        ));
        let router = MessageRouter::new(
            store.table("mailbox").unwrap(),
            store.table("mailbox_seq").unwrap(),
            presence.clone(),
            supervisor.clone(),
        );
        Fixture {
            router,
            supervisor,
            presence,
            _dir: dir,
        }
    }

    async fn connect(
        f: &Fixture,
        agent_id: &str,
    ) -> (
        Arc<ChannelSession>,
        tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>,
    ) {
        let (session, rx) = ChannelSession::new();
        f.supervisor
            .start(
                agent_id,
                agent_id,
                HashSet::new(),
                Arc::downgrade(&session) as Weak<dyn SessionHandle>,
            )
            .await
            .unwrap();
        for _ in 0..100 {
            if f.presence.get(agent_id).await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        (session, rx)
    }

    #[tokio::test]
    async fn direct_message_reaches_connected_agent() {
        let f = fixture().await;
        let (_session, mut frames) = connect(&f, "bob").await;

        let outcome = f
            .router
            .send_direct("alice", "bob", serde_json::json!({"hi": 1}), None)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let frame = frames.recv().await.unwrap();
        assert!(matches!(frame, OutboundFrame::Message { ref from, .. } if from == "alice"));
    }

    #[tokio::test]
    async fn offline_recipient_gets_mailbox_entry() {
        let f = fixture().await;

        let outcome = f
            .router
            .send_direct("alice", "bob", serde_json::json!({"n": 1}), None)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Queued);
        f.router
            .send_direct("alice", "bob", serde_json::json!({"n": 2}), None)
            .await
            .unwrap();

        let (entries, max_seq) = f.router.fetch("bob", 0, 100).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[1].seq, 2);
        assert_eq!(max_seq, 2);

        // Resuming from max_seq yields nothing new.
        let (rest, _) = f.router.fetch("bob", max_seq, 100).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn sequences_survive_eviction() {
        let f = fixture().await;
        f.router
            .send_direct("a", "bob", serde_json::json!({}), None)
            .await
            .unwrap();

        // Wipe all entries, then enqueue again: the sequence must advance.
        let (entries, _) = f.router.fetch("bob", 0, 100).await;
        for entry in &entries {
            f.router
                .mailbox
                .delete(&MessageRouter::entry_key("bob", entry.seq))
                .await
                .unwrap();
        }

        f.router
            .send_direct("a", "bob", serde_json::json!({}), None)
            .await
            .unwrap();
        let (entries, max_seq) = f.router.fetch("bob", 0, 100).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(max_seq, 2);
    }

    #[tokio::test]
    async fn channel_publish_reaches_subscribers_only() {
        let f = fixture().await;
        let (_s1, mut frames1) = connect(&f, "sub").await;
        let (_s2, mut frames2) = connect(&f, "other").await;

        f.router.subscribe("builds", "sub").await;
        let delivered = f
            .router
            .publish_channel("announcer", "builds", serde_json::json!({"done": true}))
            .await;
        assert_eq!(delivered, 1);

        assert!(frames1.recv().await.is_some());
        assert!(frames2.try_recv().is_err());

        f.router.unsubscribe_all("sub").await;
        let delivered = f
            .router
            .publish_channel("announcer", "builds", serde_json::json!({}))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let f = fixture().await;
        let (_s1, mut frames1) = connect(&f, "a1").await;
        let (_s2, mut frames2) = connect(&f, "a2").await;

        let delivered = f.router.broadcast("a1", serde_json::json!({"all": 1})).await;
        assert_eq!(delivered, 1);
        assert!(frames2.recv().await.is_some());
        assert!(frames1.try_recv().is_err());
    }
}
