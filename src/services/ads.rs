//! Interstitial gate shown before a user-initiated skip.

use super::entitlements::Entitlements;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdEvent {
    Loaded,
    Closed,
    Error(String),
}

/// The ad SDK surface the manager drives.
#[async_trait]
pub trait InterstitialPresenter: Send + Sync {
    async fn initialize(&self) -> Result<(), anyhow::Error>;

    /// Starts loading one interstitial; lifecycle events go to `events`.
    fn load(&self, events: mpsc::UnboundedSender<AdEvent>) -> Result<(), anyhow::Error>;

    fn show(&self) -> Result<(), anyhow::Error>;
}

/// Resolves exactly once, whether or not anything was shown.
#[async_trait]
pub trait InterstitialGate: Send + Sync {
    async fn maybe_show_interstitial(&self);
}

#[derive(Debug, Clone)]
pub struct AdConfig {
    pub cooldown: Duration,
    pub ready_wait: Duration,
    /// How long a load may take before the gate gives up.
    pub show_timeout: Duration,
    /// How long a shown interstitial may stay up without reporting closed.
    pub close_timeout: Duration,
}

impl Default for AdConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(4 * 60),
            ready_wait: Duration::from_secs(1),
            show_timeout: Duration::from_millis(1500),
            close_timeout: Duration::from_secs(60),
        }
    }
}

pub struct AdManager {
    presenter: Arc<dyn InterstitialPresenter>,
    entitlements: Arc<dyn Entitlements>,
    config: AdConfig,
    ready: watch::Sender<bool>,
    init_started: AtomicBool,
    showing: AtomicBool,
    last_shown: Mutex<Option<Instant>>,
}

impl AdManager {
    pub fn new(
        presenter: Arc<dyn InterstitialPresenter>,
        entitlements: Arc<dyn Entitlements>,
        config: AdConfig,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            presenter,
            entitlements,
            config,
            ready,
            init_started: AtomicBool::new(false),
            showing: AtomicBool::new(false),
            last_shown: Mutex::new(None),
        }
    }

    /// Initializes the SDK once. A failed init leaves ads disabled.
    pub async fn init(&self) -> bool {
        if self.init_started.swap(true, Ordering::SeqCst) {
            return self.is_ready();
        }
        let ready = match self.presenter.initialize().await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "Ads", "Ad SDK init failed: {e}");
                false
            }
        };
        self.ready.send_replace(ready);
        ready
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn on_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    async fn wait_ready(&self) -> bool {
        let mut ready = self.on_ready();
        let wait = ready.wait_for(|ready| *ready);
        matches!(tokio::time::timeout(self.config.ready_wait, wait).await, Ok(Ok(_)))
    }

    async fn cooled_down(&self) -> bool {
        match *self.last_shown.lock().await {
            Some(at) => at.elapsed() >= self.config.cooldown,
            None => true,
        }
    }

    async fn run_interstitial(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self.presenter.load(tx) {
            debug!(target: "Ads", "Interstitial load failed: {e}");
            return;
        }

        let deadline = tokio::time::sleep(self.config.show_timeout);
        tokio::pin!(deadline);
        let mut shown = false;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(AdEvent::Loaded) if !shown => match self.presenter.show() {
                        Ok(()) => {
                            shown = true;
                            let now = Instant::now();
                            *self.last_shown.lock().await = Some(now);
                            deadline.as_mut().reset(now + self.config.close_timeout);
                            info!(target: "Ads", "Interstitial shown");
                        }
                        Err(e) => {
                            debug!(target: "Ads", "Interstitial show failed: {e}");
                            return;
                        }
                    },
                    Some(AdEvent::Loaded) => {}
                    Some(AdEvent::Closed) => return,
                    Some(AdEvent::Error(e)) => {
                        debug!(target: "Ads", "Interstitial error: {e}");
                        return;
                    }
                    None => return,
                },
                _ = &mut deadline => {
                    if shown {
                        warn!(target: "Ads", "Interstitial never reported closed");
                    } else {
                        debug!(target: "Ads", "Interstitial did not load in time");
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl InterstitialGate for AdManager {
    async fn maybe_show_interstitial(&self) {
        if self.entitlements.is_premium() {
            return;
        }
        if !self.cooled_down().await {
            debug!(target: "Ads", "Interstitial skipped: cooldown");
            return;
        }
        if !self.wait_ready().await {
            debug!(target: "Ads", "Interstitial skipped: SDK not ready");
            return;
        }
        if self.showing.swap(true, Ordering::SeqCst) {
            debug!(target: "Ads", "Interstitial already on screen");
            return;
        }
        let _showing = scopeguard::guard(&self.showing, |flag| flag.store(false, Ordering::SeqCst));
        self.run_interstitial().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakePresenter {
        fail_init: bool,
        script: Vec<(Duration, AdEvent)>,
        shows: StdMutex<usize>,
        loads: StdMutex<usize>,
    }

    #[async_trait]
    impl InterstitialPresenter for FakePresenter {
        async fn initialize(&self) -> Result<(), anyhow::Error> {
            if self.fail_init {
                anyhow::bail!("no sdk");
            }
            Ok(())
        }

        fn load(&self, events: mpsc::UnboundedSender<AdEvent>) -> Result<(), anyhow::Error> {
            *self.loads.lock().unwrap() += 1;
            let script = self.script.clone();
            tokio::spawn(async move {
                for (delay, event) in script {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(event);
                }
            });
            Ok(())
        }

        fn show(&self) -> Result<(), anyhow::Error> {
            *self.shows.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Tier(bool);

    #[async_trait]
    impl Entitlements for Tier {
        fn is_premium(&self) -> bool {
            self.0
        }
        async fn refresh(&self) -> bool {
            self.0
        }
    }

    fn manager(presenter: Arc<FakePresenter>, premium: bool) -> AdManager {
        AdManager::new(presenter, Arc::new(Tier(premium)), AdConfig::default())
    }

    fn shown_then_closed() -> Vec<(Duration, AdEvent)> {
        vec![
            (Duration::from_millis(200), AdEvent::Loaded),
            (Duration::from_secs(5), AdEvent::Closed),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn shows_once_then_respects_cooldown() {
        let presenter = Arc::new(FakePresenter {
            script: shown_then_closed(),
            ..Default::default()
        });
        let ads = manager(presenter.clone(), false);
        assert!(ads.init().await);

        let started = Instant::now();
        ads.maybe_show_interstitial().await;
        // Waits for the close even past the load timeout once shown.
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(*presenter.shows.lock().unwrap(), 1);

        ads.maybe_show_interstitial().await;
        assert_eq!(*presenter.loads.lock().unwrap(), 1);

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        ads.maybe_show_interstitial().await;
        assert_eq!(*presenter.shows.lock().unwrap(), 2);
    }

    struct SilentAfterLoad {
        held: StdMutex<Option<mpsc::UnboundedSender<AdEvent>>>,
    }

    #[async_trait]
    impl InterstitialPresenter for SilentAfterLoad {
        async fn initialize(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn load(&self, events: mpsc::UnboundedSender<AdEvent>) -> Result<(), anyhow::Error> {
            let _ = events.send(AdEvent::Loaded);
            *self.held.lock().unwrap() = Some(events);
            Ok(())
        }

        fn show(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shown_ad_that_never_closes_still_resolves() {
        let presenter = Arc::new(SilentAfterLoad {
            held: StdMutex::new(None),
        });
        let ads = AdManager::new(presenter.clone(), Arc::new(Tier(false)), AdConfig::default());
        ads.init().await;

        let started = Instant::now();
        let resolved = tokio::time::timeout(
            Duration::from_secs(600),
            ads.maybe_show_interstitial(),
        )
        .await;
        assert!(resolved.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert!(presenter.held.lock().unwrap().is_some());
        assert!(!ads.showing.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_times_out() {
        let presenter = Arc::new(FakePresenter {
            script: vec![(Duration::from_secs(10), AdEvent::Loaded)],
            ..Default::default()
        });
        let ads = manager(presenter.clone(), false);
        ads.init().await;

        let started = Instant::now();
        ads.maybe_show_interstitial().await;
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert_eq!(*presenter.shows.lock().unwrap(), 0);
        assert!(!ads.showing.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_resolves_after_the_ready_wait() {
        let presenter = Arc::new(FakePresenter {
            fail_init: true,
            script: shown_then_closed(),
            ..Default::default()
        });
        let ads = manager(presenter.clone(), false);
        assert!(!ads.init().await);

        let started = Instant::now();
        ads.maybe_show_interstitial().await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(*presenter.loads.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn premium_skips_immediately() {
        let presenter = Arc::new(FakePresenter {
            script: shown_then_closed(),
            ..Default::default()
        });
        let ads = manager(presenter.clone(), true);
        ads.init().await;
        let started = Instant::now();
        ads.maybe_show_interstitial().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(*presenter.loads.lock().unwrap(), 0);
    }
}
