use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{ChatRequest, ChatResponse, Message};
use crate::utils::hex_encode;

/// The canonical structure hashed for the cache key. Field order is
/// content-defining: model, messages, temperature, top_p. The `stream`
/// flag is deliberately excluded so a buffered miss populates the cache
/// for both buffered and streaming followers.
#[derive(Serialize)]
struct CacheKey<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

/// SHA-256 hex of the cache-relevant fields of a request.
pub fn key_for(req: &ChatRequest) -> String {
    let key = CacheKey {
        model: &req.model,
        messages: &req.messages,
        temperature: req.temperature,
        top_p: req.top_p,
    };
    let data = serde_json::to_vec(&key).expect("cache key serialization");
    let mut hasher = Sha256::new();
    hasher.update(&data);
    hex_encode(&hasher.finalize())
}

#[derive(Clone, Debug)]
struct Entry {
    response: ChatResponse,
    expires_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    // Front = least recently used, back = most recently used.
    order: VecDeque<String>,
}

/// In-memory exact-match cache with TTL and strict LRU eviction.
///
/// Expired entries are never returned but may linger until touched; there
/// is no background reaper. A single mutex guards the map and the LRU
/// order; the critical sections never await.
pub struct ExactCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_entries: usize,
}

impl ExactCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Looks up a cached response, promoting the entry to most recently
    /// used. Returns `None` on miss or expiry.
    pub fn get(&self, req: &ChatRequest) -> Option<ChatResponse> {
        self.get_at(&key_for(req), Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<ChatResponse> {
        let mut inner = self.inner.lock().expect("exact cache lock");

        let expires_at = inner.entries.get(key)?.expires_at;
        if now >= expires_at {
            inner.entries.remove(key);
            inner.order.retain(|candidate| candidate != key);
            return None;
        }

        inner.order.retain(|candidate| candidate != key);
        inner.order.push_back(key.to_string());
        Some(inner.entries.get(key)?.response.clone())
    }

    /// Stores a response. An existing key is replaced in place and
    /// promoted; at capacity the least recently used entry is evicted
    /// before a new key is inserted.
    pub fn put(&self, req: &ChatRequest, response: ChatResponse) {
        self.put_at(key_for(req), response, Instant::now());
    }

    pub fn put_at(&self, key: String, response: ChatResponse, now: Instant) {
        let mut inner = self.inner.lock().expect("exact cache lock");

        let entry = Entry {
            response,
            expires_at: now + self.ttl,
        };

        if inner.entries.contains_key(&key) {
            inner.entries.insert(key.clone(), entry);
            inner.order.retain(|candidate| candidate != &key);
            inner.order.push_back(key);
            return;
        }

        while inner.entries.len() >= self.max_entries {
            let Some(victim) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&victim);
        }

        inner.entries.insert(key.clone(), entry);
        inner.order.push_back(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("exact cache lock");
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("exact cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Choice, Usage};

    fn request(model: &str, content: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![Message::new("user", content)],
            ..Default::default()
        }
    }

    fn response(id: &str) -> ChatResponse {
        ChatResponse {
            id: id.to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::new("assistant", "hello"),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        }
    }

    #[test]
    fn key_ignores_stream_flag_and_unrelated_fields() {
        let mut a = request("gpt-4o", "hello");
        let mut b = a.clone();
        b.stream = true;
        b.max_tokens = Some(100);
        b.user = Some("u-1".to_string());
        b.n = Some(2);
        assert_eq!(key_for(&a), key_for(&b));

        a.temperature = Some(0.0);
        assert_ne!(key_for(&a), key_for(&b));
        b.temperature = Some(0.0);
        assert_eq!(key_for(&a), key_for(&b));
    }

    #[test]
    fn key_depends_on_model_messages_temperature_top_p() {
        let base = request("gpt-4o", "hello");

        let mut other_model = base.clone();
        other_model.model = "gpt-4o-mini".to_string();
        assert_ne!(key_for(&base), key_for(&other_model));

        let mut other_message = base.clone();
        other_message.messages[0].content = "hello!".to_string();
        assert_ne!(key_for(&base), key_for(&other_message));

        let mut with_top_p = base.clone();
        with_top_p.top_p = Some(0.9);
        assert_ne!(key_for(&base), key_for(&with_top_p));
    }

    #[test]
    fn get_hits_until_ttl_then_removes() {
        let cache = ExactCache::new(Duration::from_secs(60), 10);
        let now = Instant::now();
        let key = key_for(&request("gpt-4o", "hi"));

        cache.put_at(key.clone(), response("r-1"), now);
        assert!(cache.get_at(&key, now + Duration::from_secs(59)).is_some());
        assert!(cache.get_at(&key, now + Duration::from_secs(60)).is_none());
        // Expiry-on-access removed the entry.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = ExactCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();

        cache.put_at("a".to_string(), response("a"), now);
        cache.put_at("b".to_string(), response("b"), now);
        cache.put_at("c".to_string(), response("c"), now);

        assert!(cache.get_at("a", now).is_none());
        assert!(cache.get_at("b", now).is_some());
        assert!(cache.get_at("c", now).is_some());
    }

    #[test]
    fn read_promotes_entry_out_of_eviction_order() {
        let cache = ExactCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();

        cache.put_at("a".to_string(), response("a"), now);
        cache.put_at("b".to_string(), response("b"), now);
        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get_at("a", now).is_some());
        cache.put_at("c".to_string(), response("c"), now);

        assert!(cache.get_at("a", now).is_some());
        assert!(cache.get_at("b", now).is_none());
        assert!(cache.get_at("c", now).is_some());
    }

    #[test]
    fn put_replaces_existing_key_in_place() {
        let cache = ExactCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();

        cache.put_at("a".to_string(), response("old"), now);
        cache.put_at("a".to_string(), response("new"), now);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at("a", now).expect("hit").id, "new");
    }

    #[test]
    fn clear_drops_everything() {
        let cache = ExactCache::new(Duration::from_secs(60), 10);
        cache.put(&request("gpt-4o", "x"), response("r"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
