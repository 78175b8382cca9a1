use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

/// Keeps one conversation id per live call when the caller number is
/// unknown, so every turn of the call lands in the same conversation.
pub struct VoiceSessionCache {
    ttl: Duration,
    sessions: Mutex<HashMap<String, (String, Instant)>>,
}

impl VoiceSessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, sessions: Mutex::new(HashMap::new()) }
    }

    /// Returns the live id for `key`, refreshing its expiry, or mints a
    /// new one.
    pub async fn get_or_create(&self, org_id: &str, key: &str) -> String {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, (_, expires_at)| *expires_at > now);

        if let Some((conversation_id, expires_at)) = sessions.get_mut(key) {
            *expires_at = now + self.ttl;
            return conversation_id.clone();
        }

        let conversation_id = Self::mint(org_id);
        sessions.insert(key.to_string(), (conversation_id.clone(), now + self.ttl));
        conversation_id
    }

    /// A one-off `voice:<org>:call-<uuid>` for a turn with nothing to key a
    /// session on. Never cached.
    pub fn mint(org_id: &str) -> String {
        format!("voice:{org_id}:call-{}", Uuid::new_v4().simple())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::VoiceSessionCache;

    #[tokio::test]
    async fn turns_of_one_call_share_a_conversation() {
        let cache = VoiceSessionCache::new(Duration::from_secs(900));
        let first = cache.get_or_create("org-1", "call-abc").await;
        let second = cache.get_or_create("org-1", "call-abc").await;
        cache.get_or_create("org-1", "call-xyz").await;

        assert!(first.starts_with("voice:org-1:call-"));
        assert_eq!(first, second);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn expired_sessions_are_replaced() {
        let cache = VoiceSessionCache::new(Duration::ZERO);
        let first = cache.get_or_create("org-1", "call-abc").await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = cache.get_or_create("org-1", "call-abc").await;
        assert_ne!(first, second);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn calls_started_together_get_distinct_conversations() {
        let cache = VoiceSessionCache::new(Duration::from_secs(900));
        let first = cache.get_or_create("org-1", "call-abc").await;
        let second = cache.get_or_create("org-1", "call-def").await;
        assert_ne!(first, second);

        let minted = VoiceSessionCache::mint("org-1");
        assert!(minted.starts_with("voice:org-1:call-"));
        assert_ne!(minted, VoiceSessionCache::mint("org-1"));
        assert_eq!(cache.len().await, 2);
    }
}
