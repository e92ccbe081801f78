//! Channel and pattern subscriptions.
//!
//! Every subscription owns a mailbox. The hub keeps only weak references to
//! mailboxes, so dropping a [`Subscription`] unsubscribes it; dead entries are
//! pruned on the next publish to their channel.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::task::Waker;

use crate::error::{Result, StoreError};

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// The channel the message was published on.
    pub channel: String,
    /// The message payload.
    pub payload: String,
}

#[derive(Debug, Default)]
struct MailboxState {
    messages: VecDeque<PubSubMessage>,
    closed: bool,
    wakers: Vec<Waker>,
}

/// Per-subscription inbox.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
}

impl Mailbox {
    fn deliver(&self, msg: PubSubMessage) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.messages.push_back(msg);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Close the mailbox and wake anyone waiting on it.
    pub(crate) fn close(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

type Subscribers = HashMap<String, Vec<Weak<Mailbox>>>;

/// Routes published messages to channel and pattern subscribers.
#[derive(Debug, Default)]
pub(crate) struct PubSubHub {
    channels: RwLock<Subscribers>,
    patterns: RwLock<Subscribers>,
}

impl PubSubHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self, channel: &str) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::default());
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Arc::downgrade(&mailbox));
        mailbox
    }

    pub(crate) fn psubscribe(&self, pattern: &str) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::default());
        self.patterns
            .write()
            .entry(pattern.to_string())
            .or_default()
            .push(Arc::downgrade(&mailbox));
        mailbox
    }

    /// Publish a message; returns the number of receiving subscriptions.
    pub(crate) fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut count = 0;

        {
            let mut channels = self.channels.write();
            if let Some(subscribers) = channels.get_mut(channel) {
                subscribers.retain(|weak| match weak.upgrade() {
                    Some(mailbox) => {
                        let msg = PubSubMessage {
                            pattern: None,
                            channel: channel.to_string(),
                            payload: payload.to_string(),
                        };
                        if mailbox.deliver(msg) {
                            count += 1;
                        }
                        true
                    }
                    None => false,
                });
                if subscribers.is_empty() {
                    channels.remove(channel);
                }
            }
        }

        let mut patterns = self.patterns.write();
        for (pattern, subscribers) in patterns.iter_mut() {
            if !pattern_matches(pattern, channel) {
                continue;
            }
            subscribers.retain(|weak| match weak.upgrade() {
                Some(mailbox) => {
                    let msg = PubSubMessage {
                        pattern: Some(pattern.clone()),
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    };
                    if mailbox.deliver(msg) {
                        count += 1;
                    }
                    true
                }
                None => false,
            });
        }
        patterns.retain(|_, subscribers| !subscribers.is_empty());

        count
    }

    /// Number of live subscriptions on an exact channel.
    pub(crate) fn numsub(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|subs| subs.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Close every mailbox. Used on server shutdown.
    pub(crate) fn close_all(&self) {
        let mut channels = self.channels.write();
        let mut patterns = self.patterns.write();
        for weak in channels.values().chain(patterns.values()).flatten() {
            if let Some(mailbox) = weak.upgrade() {
                mailbox.close();
            }
        }
        channels.clear();
        patterns.clear();
    }
}

/// A live channel or pattern subscription.
///
/// Messages queue up until read. Once the owning connection or the server
/// goes away every read fails with [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct Subscription {
    mailbox: Arc<Mailbox>,
    topic: String,
    endpoint: String,
}

impl Subscription {
    pub(crate) fn new(mailbox: Arc<Mailbox>, topic: &str, endpoint: String) -> Self {
        Self {
            mailbox,
            topic: topic.to_string(),
            endpoint,
        }
    }

    /// The channel or pattern subscribed to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Take the oldest queued message, if any.
    pub fn try_recv(&self) -> Result<Option<PubSubMessage>> {
        let mut state = self.mailbox.state.lock();
        if state.closed {
            return Err(self.unavailable());
        }
        Ok(state.messages.pop_front())
    }

    /// Take every queued message.
    pub fn drain(&self) -> Result<Vec<PubSubMessage>> {
        let mut state = self.mailbox.state.lock();
        if state.closed {
            return Err(self.unavailable());
        }
        Ok(state.messages.drain(..).collect())
    }

    /// Number of queued messages.
    pub fn pending(&self) -> usize {
        self.mailbox.state.lock().messages.len()
    }

    /// Wake `waker` on the next delivery or on close.
    ///
    /// Wakers fire once and must be registered again afterwards. A closed
    /// subscription wakes immediately.
    pub fn register_waker(&self, waker: &Waker) {
        let mut state = self.mailbox.state.lock();
        if state.closed {
            drop(state);
            waker.wake_by_ref();
            return;
        }
        if !state.wakers.iter().any(|w| w.will_wake(waker)) {
            state.wakers.push(waker.clone());
        }
    }

    /// Forget a waker registered with [`register_waker`](Self::register_waker).
    pub fn deregister_waker(&self, waker: &Waker) {
        self.mailbox
            .state
            .lock()
            .wakers
            .retain(|w| !w.will_wake(waker));
    }

    /// Number of wakers waiting for the next delivery.
    pub fn waker_count(&self) -> usize {
        self.mailbox.state.lock().wakers.len()
    }

    /// True once the connection or server has gone away.
    pub fn is_closed(&self) -> bool {
        self.mailbox.state.lock().closed
    }

    /// Close this subscription.
    pub fn close(&self) {
        self.mailbox.close();
    }

    pub(crate) fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    fn unavailable(&self) -> StoreError {
        StoreError::Unavailable {
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Glob-style match used by pattern subscriptions and `KEYS`.
///
/// Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes.
pub fn pattern_matches(pattern: &str, s: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();
    glob(&pattern, &s)
}

fn glob(pattern: &[char], s: &[char]) -> bool {
    let Some((&p, rest)) = pattern.split_first() else {
        return s.is_empty();
    };
    match p {
        '*' => (0..=s.len()).any(|skip| glob(rest, &s[skip..])),
        '?' => !s.is_empty() && glob(rest, &s[1..]),
        '[' => {
            let Some((&c, s_rest)) = s.split_first() else {
                return false;
            };
            match match_class(rest, c) {
                Some((true, after)) => glob(after, s_rest),
                Some((false, _)) => false,
                // Unterminated class: treat '[' literally
                None => c == '[' && glob(rest, s_rest),
            }
        }
        '\\' => match rest.split_first() {
            Some((&escaped, rest)) => s.first() == Some(&escaped) && glob(rest, &s[1..]),
            None => s.first() == Some(&'\\') && glob(rest, &s[1..]),
        },
        literal => s.first() == Some(&literal) && glob(rest, &s[1..]),
    }
}

/// Match `c` against the class body following `[`.
/// Returns the verdict and the pattern after the closing `]`.
fn match_class(body: &[char], c: char) -> Option<(bool, &[char])> {
    let (negated, mut i) = match body.first() {
        Some('^') => (true, 1),
        _ => (false, 0),
    };
    let mut matched = false;
    while i < body.len() {
        match body[i] {
            ']' => return Some((matched != negated, &body[i + 1..])),
            '\\' if i + 1 < body.len() => {
                matched |= body[i + 1] == c;
                i += 2;
            }
            lo if i + 2 < body.len() && body[i + 1] == '-' && body[i + 2] != ']' => {
                let hi = body[i + 2];
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                matched |= (lo..=hi).contains(&c);
                i += 3;
            }
            other => {
                matched |= other == c;
                i += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sub(hub: &PubSubHub, channel: &str) -> Subscription {
        Subscription::new(hub.subscribe(channel), channel, "test".into())
    }

    // =========================================================================
    // Glob matching
    // =========================================================================

    #[test]
    fn pattern_star() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("__keyspace@0__:T:*", "__keyspace@0__:T:aaa"));
        assert!(pattern_matches("__keyspace@0__:T:*", "__keyspace@0__:T:"));
        assert!(!pattern_matches("__keyspace@0__:T:*", "__keyspace@0__:TT:aaa"));
        assert!(pattern_matches("a*c*e", "abcde"));
        assert!(!pattern_matches("a*c*e", "abcd"));
    }

    #[test]
    fn pattern_question_and_class() {
        assert!(pattern_matches("h?llo", "hello"));
        assert!(!pattern_matches("h?llo", "hllo"));
        assert!(pattern_matches("h[ae]llo", "hallo"));
        assert!(!pattern_matches("h[ae]llo", "hillo"));
        assert!(pattern_matches("h[^e]llo", "hallo"));
        assert!(!pattern_matches("h[^e]llo", "hello"));
        assert!(pattern_matches("port[0-9]", "port7"));
        assert!(!pattern_matches("port[0-9]", "portx"));
    }

    #[test]
    fn pattern_escape() {
        assert!(pattern_matches(r"a\*b", "a*b"));
        assert!(!pattern_matches(r"a\*b", "axb"));
    }

    // =========================================================================
    // Hub
    // =========================================================================

    #[test]
    fn publish_reaches_channel_and_pattern_subscribers() {
        let hub = PubSubHub::new();
        let exact = sub(&hub, "T_CHANNEL@0");
        let pattern = Subscription::new(hub.psubscribe("T_*"), "T_*", "test".into());

        assert_eq!(hub.publish("T_CHANNEL@0", "G"), 2);

        let msg = exact.try_recv().unwrap().unwrap();
        assert_eq!(msg.payload, "G");
        assert!(msg.pattern.is_none());

        let msg = pattern.try_recv().unwrap().unwrap();
        assert_eq!(msg.pattern.as_deref(), Some("T_*"));
        assert_eq!(msg.channel, "T_CHANNEL@0");
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let hub = PubSubHub::new();
        let s = sub(&hub, "c");
        assert_eq!(hub.numsub("c"), 1);
        drop(s);
        assert_eq!(hub.publish("c", "x"), 0);
        assert_eq!(hub.numsub("c"), 0);
    }

    #[test]
    fn messages_keep_publish_order() {
        let hub = PubSubHub::new();
        let s = sub(&hub, "c");
        for i in 0..5 {
            hub.publish("c", &i.to_string());
        }
        let payloads: Vec<String> = s.drain().unwrap().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, ["0", "1", "2", "3", "4"]);
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn waker_fires_once_per_registration() {
        let hub = PubSubHub::new();
        let s = sub(&hub, "c");
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());

        s.register_waker(&waker);
        s.register_waker(&waker);
        hub.publish("c", "1");
        hub.publish("c", "2");

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregistered_waker_is_not_woken() {
        let hub = PubSubHub::new();
        let s = sub(&hub, "c");
        let kept = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let dropped = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let kept_waker = Waker::from(kept.clone());
        let dropped_waker = Waker::from(dropped.clone());

        s.register_waker(&kept_waker);
        s.register_waker(&dropped_waker);
        assert_eq!(s.waker_count(), 2);
        s.deregister_waker(&dropped_waker);
        assert_eq!(s.waker_count(), 1);

        hub.publish("c", "1");
        assert_eq!(kept.0.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.0.load(Ordering::SeqCst), 0);
        assert_eq!(s.waker_count(), 0);
    }

    #[test]
    fn close_all_fails_reads() {
        let hub = PubSubHub::new();
        let s = sub(&hub, "c");
        hub.close_all();
        assert!(s.is_closed());
        assert!(matches!(s.try_recv(), Err(StoreError::Unavailable { .. })));
        assert_eq!(hub.publish("c", "x"), 0);
    }
}
