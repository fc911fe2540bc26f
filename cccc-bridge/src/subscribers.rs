//! Subscriber store (`state/im_subscribers.json`).
//!
//! Keys are `chat_id` or `chat_id:thread_id` for threaded chats. Subscribing
//! twice is idempotent (verbose setting preserved); unsubscribing keeps the
//! record with `subscribed=false` so preferences survive resubscription.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cccc_core::fsutil::{atomic_write_json, read_json_or_default};
use cccc_core::timeutil::utc_now_iso;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscriber {
    #[serde(skip)]
    pub chat_id: String,
    pub subscribed: bool,
    /// Verbose chats also see agent-to-agent traffic.
    pub verbose: bool,
    pub subscribed_at: String,
    pub chat_title: String,
    pub thread_id: i64,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self {
            chat_id: String::new(),
            subscribed: true,
            verbose: true,
            subscribed_at: String::new(),
            chat_title: String::new(),
            thread_id: 0,
        }
    }
}

pub struct SubscriberManager {
    path: PathBuf,
    subscribers: BTreeMap<String, Subscriber>,
}

fn key_for(chat_id: &str, thread_id: i64) -> String {
    if thread_id > 0 {
        format!("{chat_id}:{thread_id}")
    } else {
        chat_id.to_string()
    }
}

impl SubscriberManager {
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join("im_subscribers.json");
        let raw: BTreeMap<String, Subscriber> = read_json_or_default(&path);
        let mut subscribers = BTreeMap::new();
        for (key, mut sub) in raw {
            // Keys may carry the thread id; prefer it over the stored field.
            let (chat_id, thread_id) = match key.rsplit_once(':') {
                Some((head, tail)) => match tail.parse::<i64>() {
                    Ok(tid) => (head.to_string(), tid),
                    Err(_) => (key.clone(), 0),
                },
                None => (key.clone(), 0),
            };
            sub.chat_id = chat_id;
            if thread_id > 0 {
                sub.thread_id = thread_id;
            }
            subscribers.insert(key_for(&sub.chat_id, sub.thread_id), sub);
        }
        Self { path, subscribers }
    }

    fn save(&self) {
        let _ = atomic_write_json(&self.path, &self.subscribers);
    }

    pub fn subscribe(&mut self, chat_id: &str, chat_title: &str, thread_id: i64) -> &Subscriber {
        let key = key_for(chat_id, thread_id);
        let sub = self.subscribers.entry(key.clone()).or_insert_with(|| Subscriber {
            chat_id: chat_id.to_string(),
            subscribed_at: utc_now_iso(),
            thread_id,
            ..Default::default()
        });
        sub.chat_id = chat_id.to_string();
        sub.subscribed = true;
        if !chat_title.is_empty() {
            sub.chat_title = chat_title.to_string();
        }
        self.save();
        self.subscribers.get(&key).expect("just inserted")
    }

    /// Returns true when the chat was subscribed.
    pub fn unsubscribe(&mut self, chat_id: &str, thread_id: i64) -> bool {
        let key = key_for(chat_id, thread_id);
        match self.subscribers.get_mut(&key) {
            Some(sub) => {
                let was = sub.subscribed;
                sub.subscribed = false;
                self.save();
                was
            }
            None => false,
        }
    }

    /// Toggle verbose; `None` when the chat is not subscribed.
    pub fn toggle_verbose(&mut self, chat_id: &str, thread_id: i64) -> Option<bool> {
        let key = key_for(chat_id, thread_id);
        let sub = self.subscribers.get_mut(&key)?;
        sub.verbose = !sub.verbose;
        let verbose = sub.verbose;
        self.save();
        Some(verbose)
    }

    pub fn subscribed_targets(&self) -> Vec<&Subscriber> {
        self.subscribers.values().filter(|s| s.subscribed).collect()
    }
}
