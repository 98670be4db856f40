use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::wire::{CommandKind, DIGEST_LEN, Reply, SourceExtension};

/// Request view handed to pre/post handlers.
pub struct HookRequest<'a> {
    pub addr: Option<IpAddr>,
    pub cmd: CommandKind,
    pub digest: &'a [u8; DIGEST_LEN],
    pub is_shingle: bool,
    pub extensions: &'a [SourceExtension],
}

/// An artificial reply produced by a handler. `flag: None` keeps the flag
/// the reply already carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HookDecision {
    pub value: i32,
    pub prob: f32,
    pub flag: Option<u32>,
}

pub type PreHandler = dyn Fn(&HookRequest<'_>) -> Option<HookDecision> + Send + Sync;
pub type PostHandler = dyn Fn(&HookRequest<'_>, &Reply) -> Option<HookDecision> + Send + Sync;
pub type BlacklistHandler = dyn Fn(Option<IpAddr>, &str) + Send + Sync;

/// One replaceable slot per hook kind. Callers snapshot the slot before
/// invoking so a handler replacing itself mid-call cannot free the closure
/// it is running in.
#[derive(Default)]
pub struct HookSet {
    pre: Mutex<Option<Arc<PreHandler>>>,
    post: Mutex<Option<Arc<PostHandler>>>,
    blacklist: Mutex<Option<Arc<BlacklistHandler>>>,
}

impl HookSet {
    pub fn set_pre_handler(&self, handler: Arc<PreHandler>) {
        *self.pre.lock().unwrap() = Some(handler);
    }

    pub fn set_post_handler(&self, handler: Arc<PostHandler>) {
        *self.post.lock().unwrap() = Some(handler);
    }

    pub fn set_blacklist_handler(&self, handler: Arc<BlacklistHandler>) {
        *self.blacklist.lock().unwrap() = Some(handler);
    }

    pub fn pre_snapshot(&self) -> Option<Arc<PreHandler>> {
        self.pre.lock().unwrap().clone()
    }

    pub fn post_snapshot(&self) -> Option<Arc<PostHandler>> {
        self.post.lock().unwrap().clone()
    }

    /// Fires the blacklist notification, if registered. Never fatal.
    pub fn notify_blacklisted(&self, addr: Option<IpAddr>, reason: &str) {
        let handler = self.blacklist.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(addr, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request<'a>(digest: &'a [u8; DIGEST_LEN]) -> HookRequest<'a> {
        HookRequest {
            addr: None,
            cmd: CommandKind::Check,
            digest,
            is_shingle: false,
            extensions: &[],
        }
    }

    #[test]
    fn registration_replaces_previous_handler() {
        let hooks = HookSet::default();
        hooks.set_pre_handler(Arc::new(|_| {
            Some(HookDecision {
                value: 403,
                prob: 0.0,
                flag: None,
            })
        }));
        hooks.set_pre_handler(Arc::new(|_| None));

        let digest = [0u8; DIGEST_LEN];
        let handler = hooks.pre_snapshot().expect("handler should be registered");
        assert_eq!(handler(&request(&digest)), None);
    }

    #[test]
    fn blacklist_notification_is_optional() {
        let hooks = HookSet::default();
        hooks.notify_blacklisted(None, "ratelimit");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        hooks.set_blacklist_handler(Arc::new(move |_, reason| {
            assert_eq!(reason, "ratelimit");
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        hooks.notify_blacklisted("192.0.2.1".parse().ok(), "ratelimit");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
