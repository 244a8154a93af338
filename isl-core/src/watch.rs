//! Focus-aware polling cadence for repository refreshes.
//!
//! Decides when to re-fetch state without being told: connected pages report
//! focus changes, an optional external watcher supplies change hints, and a
//! base timer covers everything else. Subscribers receive `(kind, poll
//! kind)` pairs; the first emission after subscribing is always a full
//! refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use isl_model::{FetchKind, PageId, PageVisibility, PollKind};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Cadence knobs. The numbers are defaults, not contracts.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval while any page is focused.
    pub focused_interval: Duration,
    /// Interval while some page is visible but none focused.
    pub visible_interval: Duration,
    /// Base interval with all pages hidden and no healthy watcher.
    pub hidden_interval: Duration,
    /// Base interval when a healthy external watcher supplies hints.
    pub watcher_interval: Duration,
    /// Minimum gap between focus-triggered polls.
    pub focus_throttle: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            focused_interval: Duration::from_secs(20),
            visible_interval: Duration::from_secs(60),
            hidden_interval: Duration::from_secs(5 * 60),
            watcher_interval: Duration::from_secs(10 * 60),
            focus_throttle: Duration::from_secs(15),
        }
    }
}

type ChangeSender = mpsc::UnboundedSender<(FetchKind, PollKind)>;
pub type ChangeReceiver = mpsc::UnboundedReceiver<(FetchKind, PollKind)>;

#[derive(Debug, Default)]
struct PollerState {
    pages: HashMap<PageId, PageVisibility>,
    watcher_healthy: bool,
    last_focus_poll: Option<Instant>,
    subscribers: Vec<ChangeSender>,
}

/// Adaptive poller; one per repository.
#[derive(Debug)]
pub struct WatchForChanges {
    config: PollerConfig,
    state: Mutex<PollerState>,
    /// Wakes the timer task so it recomputes its interval.
    reschedule: Notify,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl WatchForChanges {
    pub fn new(config: PollerConfig) -> Arc<Self> {
        let poller = Arc::new(Self {
            config,
            state: Mutex::new(PollerState::default()),
            reschedule: Notify::new(),
            timer: Mutex::new(None),
        });
        let task = tokio::spawn(Self::timer_loop(Arc::clone(&poller)));
        *poller.timer.lock() = Some(task);
        poller
    }

    /// Subscribe to change notifications. Emits `(Everything, Polling)`
    /// immediately so new subscribers start with a full refresh.
    pub fn subscribe(&self) -> ChangeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send((FetchKind::Everything, PollKind::Polling));
        self.state
            .lock()
            .subscribers
            .push(tx);
        rx
    }

    fn emit(&self, kind: FetchKind, poll: PollKind) {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|tx| tx.send((kind, poll)).is_ok());
    }

    /// Explicit poll request. `Force` bypasses both cadence and the
    /// repository's hold-off window.
    pub fn poll(&self, poll: PollKind) {
        self.emit(FetchKind::Everything, poll);
    }

    /// Record a page's visibility. Gaining focus polls immediately, at most
    /// once per throttle window, so focus flapping cannot double-poll.
    pub fn set_page_visibility(&self, page: PageId, visibility: PageVisibility) {
        let should_poll = {
            let mut state = self.state.lock();
            let prev = state.pages.insert(page, visibility);
            let gained_focus = visibility == PageVisibility::Focused
                && prev != Some(PageVisibility::Focused);
            if !gained_focus {
                false
            } else {
                let throttled = state
                    .last_focus_poll
                    .is_some_and(|at| at.elapsed() < self.config.focus_throttle);
                if throttled {
                    false
                } else {
                    state.last_focus_poll = Some(Instant::now());
                    true
                }
            }
        };
        self.reschedule.notify_one();
        if should_poll {
            debug!("focus gained, polling");
            self.emit(FetchKind::Everything, PollKind::Polling);
        }
    }

    /// Forget a page that disconnected.
    pub fn page_disconnected(&self, page: &PageId) {
        self.state
            .lock()
            .pages
            .remove(page);
        self.reschedule.notify_one();
    }

    /// A hint from the external watcher: refresh one fetch kind now and
    /// push the base timer back.
    pub fn external_change_hint(&self, kind: FetchKind) {
        self.state
            .lock()
            .watcher_healthy = true;
        self.emit(kind, PollKind::Hint);
        self.reschedule.notify_one();
    }

    pub fn set_watcher_healthy(&self, healthy: bool) {
        self.state
            .lock()
            .watcher_healthy = healthy;
        self.reschedule.notify_one();
    }

    /// Wire an external watcher's event stream into this poller.
    pub fn attach_watcher(self: &Arc<Self>, mut events: ChangeHintReceiver) {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(kind) = events.recv().await {
                poller.external_change_hint(kind);
            }
            poller.set_watcher_healthy(false);
        });
    }

    fn current_interval(&self) -> Duration {
        let state = self.state.lock();
        let any_focused = state
            .pages
            .values()
            .any(|v| *v == PageVisibility::Focused);
        let any_visible = state
            .pages
            .values()
            .any(|v| *v == PageVisibility::Visible);
        if any_focused {
            self.config.focused_interval
        } else if any_visible {
            self.config.visible_interval
        } else if state.watcher_healthy {
            self.config.watcher_interval
        } else {
            self.config.hidden_interval
        }
    }

    async fn timer_loop(poller: Arc<Self>) {
        loop {
            let interval = poller.current_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    poller.emit(FetchKind::Everything, PollKind::Polling);
                }
                _ = poller.reschedule.notified() => {}
            }
        }
    }

    /// Stop the timer task. Subscribers see their channel close.
    pub fn dispose(&self) {
        if let Some(task) = self.timer.lock().take()
        {
            task.abort();
        }
        self.state
            .lock()
            .subscribers
            .clear();
    }
}

impl Drop for WatchForChanges {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Contract for pluggable external watchers: they emit coarse change kinds.
pub type ChangeHintSender = mpsc::UnboundedSender<FetchKind>;
pub type ChangeHintReceiver = mpsc::UnboundedReceiver<FetchKind>;

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: &str) -> PageId {
        PageId::from(n)
    }

    #[tokio::test]
    async fn subscription_starts_with_full_refresh() {
        let poller = WatchForChanges::new(PollerConfig::default());
        let mut rx = poller.subscribe();
        assert_eq!(
            rx.recv().await,
            Some((FetchKind::Everything, PollKind::Polling))
        );
        poller.dispose();
    }

    #[tokio::test]
    async fn focus_gain_polls_once_within_throttle() {
        let poller = WatchForChanges::new(PollerConfig::default());
        let mut rx = poller.subscribe();
        let _ = rx.recv().await; // initial

        poller.set_page_visibility(page("p1"), PageVisibility::Focused);
        assert_eq!(
            rx.try_recv().ok(),
            Some((FetchKind::Everything, PollKind::Polling))
        );

        // hidden -> visible -> hidden -> focused inside the throttle window
        poller.set_page_visibility(page("p1"), PageVisibility::Hidden);
        poller.set_page_visibility(page("p1"), PageVisibility::Visible);
        poller.set_page_visibility(page("p1"), PageVisibility::Hidden);
        poller.set_page_visibility(page("p1"), PageVisibility::Focused);
        assert!(rx.try_recv().is_err(), "throttle must swallow the re-focus");
        poller.dispose();
    }

    #[tokio::test]
    async fn watcher_hint_refreshes_one_kind() {
        let poller = WatchForChanges::new(PollerConfig::default());
        let mut rx = poller.subscribe();
        let _ = rx.recv().await;

        poller.external_change_hint(FetchKind::UncommittedChanges);
        assert_eq!(
            rx.try_recv().ok(),
            Some((FetchKind::UncommittedChanges, PollKind::Hint))
        );
        poller.dispose();
    }

    #[tokio::test]
    async fn interval_follows_visibility_tiers() {
        let config = PollerConfig::default();
        let poller = WatchForChanges::new(config.clone());

        assert_eq!(poller.current_interval(), config.hidden_interval);
        poller.set_watcher_healthy(true);
        assert_eq!(poller.current_interval(), config.watcher_interval);

        poller.set_page_visibility(page("p1"), PageVisibility::Visible);
        assert_eq!(poller.current_interval(), config.visible_interval);

        poller.set_page_visibility(page("p2"), PageVisibility::Focused);
        assert_eq!(poller.current_interval(), config.focused_interval);

        poller.page_disconnected(&page("p2"));
        assert_eq!(poller.current_interval(), config.visible_interval);
        poller.dispose();
    }

    #[tokio::test]
    async fn force_poll_reaches_subscribers() {
        let poller = WatchForChanges::new(PollerConfig::default());
        let mut rx = poller.subscribe();
        let _ = rx.recv().await;
        poller.poll(PollKind::Force);
        assert_eq!(
            rx.try_recv().ok(),
            Some((FetchKind::Everything, PollKind::Force))
        );
        poller.dispose();
    }
}
