//! Lifecycle extension pipeline
//!
//! Extensions hook the controller's lifecycle transitions. Each link inspects
//! the event and returns a [`Verdict`]: `Proceed` hands control to the next
//! link (and ultimately to the controller's forced terminal action), `Veto`
//! stops the event. Blocking work such as head-start delays or readiness
//! polling happens inside `invoke` before the verdict is returned, so a link
//! cannot accidentally drop the rest of the chain.

use crate::controller::{ActivitySender, ControllerStatus};
use crate::scale::{ScaleTarget, SharedScaleClient};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval between readiness probe attempts
const READINESS_PROBE_INTERVAL: Duration = Duration::from_secs(3);
/// Ceiling after which the readiness gate gives up and proceeds anyway
const READINESS_PROBE_CEILING: Duration = Duration::from_secs(60);
/// Per-attempt timeout for readiness probes
const READINESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Tick interval for the scheduled always-on loop
const SCHEDULE_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// A lifecycle transition the controller is about to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ActivationRequested,
    DeactivationRequested,
    StatusChangeRequested {
        current: ControllerStatus,
        proposed: ControllerStatus,
    },
}

/// Outcome of one extension link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue with the rest of the chain and the terminal action
    Proceed,
    /// Drop the event; the terminal action does not run
    Veto,
}

/// One link in the lifecycle pipeline
#[async_trait]
pub trait Extension: Send + Sync {
    async fn invoke(&self, event: &LifecycleEvent) -> anyhow::Result<Verdict>;
}

#[async_trait]
impl<T: Extension + ?Sized> Extension for Arc<T> {
    async fn invoke(&self, event: &LifecycleEvent) -> anyhow::Result<Verdict> {
        (**self).invoke(event).await
    }
}

/// Ordered extension pipeline. An empty chain always proceeds.
#[derive(Default)]
pub struct ExtensionChain {
    links: Vec<Box<dyn Extension>>,
}

impl ExtensionChain {
    pub fn new(links: Vec<Box<dyn Extension>>) -> Self {
        Self { links }
    }

    /// Run every link in order, stopping at the first veto.
    pub async fn run(&self, event: &LifecycleEvent) -> anyhow::Result<Verdict> {
        for link in &self.links {
            if link.invoke(event).await? == Verdict::Veto {
                return Ok(Verdict::Veto);
            }
        }
        Ok(Verdict::Proceed)
    }
}

/// Mirrors activation and deactivation onto a companion deployment.
///
/// A fresh generation token is minted for every activation/deactivation; a
/// delayed patch captured against an older token silently no-ops when it
/// fires. That token check is the only thing preventing a stale delayed start
/// from out-of-order execution during rapid start/stop/start sequences.
pub struct CompanionDeploymentExtension {
    target: ScaleTarget,
    client: SharedScaleClient,
    head_start: Option<Duration>,
    delay_start: Option<Duration>,
    head_stop: Option<Duration>,
    delay_stop: Option<Duration>,
    generation: Arc<Mutex<Uuid>>,
}

impl CompanionDeploymentExtension {
    pub fn new(
        target: ScaleTarget,
        client: SharedScaleClient,
        head_start: Option<Duration>,
        delay_start: Option<Duration>,
        head_stop: Option<Duration>,
        delay_stop: Option<Duration>,
    ) -> anyhow::Result<Self> {
        if head_start.is_some() && delay_start.is_some() {
            anyhow::bail!("cannot specify both head_start and delay_start");
        }
        if head_stop.is_some() && delay_stop.is_some() {
            anyhow::bail!("cannot specify both head_stop and delay_stop");
        }
        Ok(Self {
            target,
            client,
            head_start,
            delay_start,
            head_stop,
            delay_stop,
            generation: Arc::new(Mutex::new(Uuid::nil())),
        })
    }

    /// Mint a new generation token, superseding any pending delayed patch
    fn next_generation(&self) -> Uuid {
        let token = Uuid::new_v4();
        *self.generation.lock() = token;
        token
    }

    /// Patch the companion now, or schedule it after `delay` guarded by `token`
    async fn patch(&self, replicas: i32, head: Option<Duration>, delay: Option<Duration>, token: Uuid) {
        if let Some(delay) = delay {
            let client = Arc::clone(&self.client);
            let target = self.target.clone();
            let generation = Arc::clone(&self.generation);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if *generation.lock() != token {
                    debug!(target = %target, replicas, "Delayed companion patch superseded");
                    return;
                }
                if let Err(e) = client.patch_scale(&target, replicas).await {
                    warn!(target = %target, replicas, error = %e, "Delayed companion patch failed");
                }
            });
            return;
        }

        if let Err(e) = self.client.patch_scale(&self.target, replicas).await {
            warn!(target = %self.target, replicas, error = %e, "Companion patch failed");
            return;
        }
        if let Some(head) = head {
            tokio::time::sleep(head).await;
        }
    }
}

#[async_trait]
impl Extension for CompanionDeploymentExtension {
    async fn invoke(&self, event: &LifecycleEvent) -> anyhow::Result<Verdict> {
        match event {
            LifecycleEvent::ActivationRequested => {
                let token = self.next_generation();
                let scale = self.client.read_scale(&self.target).await?;
                if scale.desired < 1 {
                    info!(target = %self.target, "Activating companion deployment");
                    self.patch(1, self.head_start, self.delay_start, token).await;
                }
            }
            LifecycleEvent::DeactivationRequested => {
                let token = self.next_generation();
                let scale = self.client.read_scale(&self.target).await?;
                if scale.desired > 0 {
                    info!(target = %self.target, "Deactivating companion deployment");
                    self.patch(0, self.head_stop, self.delay_stop, token).await;
                }
            }
            LifecycleEvent::StatusChangeRequested { .. } => {}
        }
        Ok(Verdict::Proceed)
    }
}

/// Blocks a status transition to `Ready` until a health probe succeeds.
///
/// Best-effort: probe failures are swallowed and retried, and after the
/// one-minute ceiling the transition proceeds regardless.
pub struct ReadinessCheckExtension {
    url: reqwest::Url,
    http: reqwest::Client,
}

impl ReadinessCheckExtension {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(url)?;
        let http = reqwest::Client::builder()
            .timeout(READINESS_PROBE_TIMEOUT)
            .build()?;
        Ok(Self { url, http })
    }

    async fn wait_for_ready(&self) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < READINESS_PROBE_CEILING {
            match self.http.get(self.url.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %self.url, "Readiness probe succeeded");
                    return;
                }
                Ok(response) => {
                    debug!(url = %self.url, status = %response.status(), "Readiness probe not yet successful");
                }
                Err(e) => {
                    debug!(url = %self.url, error = %e, "Readiness probe failed");
                }
            }
            tokio::time::sleep(READINESS_PROBE_INTERVAL).await;
        }
        warn!(url = %self.url, "Readiness probe ceiling reached, proceeding anyway");
    }
}

#[async_trait]
impl Extension for ReadinessCheckExtension {
    async fn invoke(&self, event: &LifecycleEvent) -> anyhow::Result<Verdict> {
        if let LifecycleEvent::StatusChangeRequested {
            proposed: ControllerStatus::Ready,
            ..
        } = event
        {
            self.wait_for_ready().await;
        }
        Ok(Verdict::Proceed)
    }
}

/// Vetoes deactivation inside a configured weekday/time-of-day window and,
/// when `autostart` is set, emits synthetic activity while inside it.
pub struct ScheduledAlwaysOnExtension {
    from: NaiveTime,
    to: NaiveTime,
    weekdays: Vec<Weekday>,
    autostart: bool,
    activity: ActivitySender,
}

impl ScheduledAlwaysOnExtension {
    pub fn new(
        from_utc: &str,
        to_utc: &str,
        weekdays: &str,
        autostart: bool,
        activity: ActivitySender,
    ) -> anyhow::Result<Self> {
        let from = parse_time_of_day(from_utc)?;
        let to = parse_time_of_day(to_utc)?;
        let weekdays = weekdays
            .split(',')
            .map(|day| {
                Weekday::from_str(day.trim())
                    .map_err(|_| anyhow::anyhow!("invalid weekday '{}'", day.trim()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            from,
            to,
            weekdays,
            autostart,
            activity,
        })
    }

    fn in_window(&self, now: DateTime<Utc>) -> bool {
        let time = now.time();
        self.weekdays.contains(&now.weekday()) && time >= self.from && time <= self.to
    }

    /// Background loop emitting synthetic activity while inside the window.
    /// Returns immediately unless `autostart` is configured; otherwise never.
    pub async fn run(&self) {
        if !self.autostart {
            return;
        }
        info!("Scheduled always-on loop started");
        loop {
            if self.in_window(Utc::now()) {
                // Fire and forget; a full or closed channel must not stop the loop
                let _ = self.activity.try_send(());
            }
            tokio::time::sleep(SCHEDULE_TICK_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Extension for ScheduledAlwaysOnExtension {
    async fn invoke(&self, event: &LifecycleEvent) -> anyhow::Result<Verdict> {
        if *event == LifecycleEvent::DeactivationRequested && self.in_window(Utc::now()) {
            info!("Deactivation vetoed by schedule window");
            return Ok(Verdict::Veto);
        }
        Ok(Verdict::Proceed)
    }
}

fn parse_time_of_day(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| anyhow::anyhow!("invalid time of day '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::activity_channel;
    use crate::scale::Scale;
    use crate::testutil::MockScaleClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        calls: AtomicUsize,
        verdict: Verdict,
    }

    #[async_trait]
    impl Extension for Recorder {
        async fn invoke(&self, _event: &LifecycleEvent) -> anyhow::Result<Verdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }
    }

    #[tokio::test]
    async fn test_empty_chain_proceeds() {
        let chain = ExtensionChain::default();
        let verdict = chain.run(&LifecycleEvent::ActivationRequested).await.unwrap();
        assert_eq!(verdict, Verdict::Proceed);
    }

    #[tokio::test]
    async fn test_veto_stops_the_chain() {
        let first = Arc::new(Recorder {
            calls: AtomicUsize::new(0),
            verdict: Verdict::Veto,
        });
        let second = Arc::new(Recorder {
            calls: AtomicUsize::new(0),
            verdict: Verdict::Proceed,
        });

        struct Link(Arc<Recorder>);
        #[async_trait]
        impl Extension for Link {
            async fn invoke(&self, event: &LifecycleEvent) -> anyhow::Result<Verdict> {
                self.0.invoke(event).await
            }
        }

        let chain = ExtensionChain::new(vec![
            Box::new(Link(Arc::clone(&first))),
            Box::new(Link(Arc::clone(&second))),
        ]);

        let verdict = chain.run(&LifecycleEvent::DeactivationRequested).await.unwrap();
        assert_eq!(verdict, Verdict::Veto);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    fn companion(
        client: &Arc<MockScaleClient>,
        delay_start: Option<Duration>,
    ) -> CompanionDeploymentExtension {
        CompanionDeploymentExtension::new(
            ScaleTarget::new("default", "cache"),
            client.clone() as SharedScaleClient,
            None,
            delay_start,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_companion_rejects_head_and_delay() {
        let client = Arc::new(MockScaleClient::new());
        let result = CompanionDeploymentExtension::new(
            ScaleTarget::new("default", "cache"),
            client as SharedScaleClient,
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(10)),
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_companion_immediate_start() {
        let client = Arc::new(MockScaleClient::new());
        client.set_scale("default/cache", Scale { desired: 0, observed: 0 });
        let ext = companion(&client, None);

        ext.invoke(&LifecycleEvent::ActivationRequested).await.unwrap();
        assert_eq!(client.patches(), vec![("default/cache".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_companion_skips_start_when_already_up() {
        let client = Arc::new(MockScaleClient::new());
        client.set_scale("default/cache", Scale { desired: 1, observed: 1 });
        let ext = companion(&client, None);

        ext.invoke(&LifecycleEvent::ActivationRequested).await.unwrap();
        assert!(client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_delayed_start_superseded_by_deactivation() {
        let client = Arc::new(MockScaleClient::new());
        client.set_scale("default/cache", Scale { desired: 0, observed: 0 });
        let ext = companion(&client, Some(Duration::from_millis(80)));

        // Activation schedules a delayed start; deactivation 20ms later mints a
        // new generation, so the start at t=80ms must not fire.
        ext.invoke(&LifecycleEvent::ActivationRequested).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ext.invoke(&LifecycleEvent::DeactivationRequested).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_rapid_start_stop_start_runs_only_final_action() {
        let client = Arc::new(MockScaleClient::new());
        client.set_scale("default/cache", Scale { desired: 0, observed: 0 });
        let ext = companion(&client, Some(Duration::from_millis(80)));

        ext.invoke(&LifecycleEvent::ActivationRequested).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ext.invoke(&LifecycleEvent::DeactivationRequested).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ext.invoke(&LifecycleEvent::ActivationRequested).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only the final scheduled start executes
        assert_eq!(client.patches(), vec![("default/cache".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_status_change_passes_companion_untouched() {
        let client = Arc::new(MockScaleClient::new());
        let ext = companion(&client, None);

        let verdict = ext
            .invoke(&LifecycleEvent::StatusChangeRequested {
                current: ControllerStatus::Unknown,
                proposed: ControllerStatus::Ready,
            })
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Proceed);
        assert!(client.patches().is_empty());
        assert_eq!(client.reads(), 0);
    }

    fn schedule(weekdays: &str, from: &str, to: &str) -> ScheduledAlwaysOnExtension {
        let (tx, _rx) = activity_channel();
        ScheduledAlwaysOnExtension::new(from, to, weekdays, false, tx).unwrap()
    }

    #[test]
    fn test_window_membership() {
        let ext = schedule("monday,tuesday", "08:00", "18:00");

        // Monday 2026-08-24 12:00 UTC is inside
        let inside = "2026-08-24T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(ext.in_window(inside));

        // Monday 19:00 is outside the time range
        let late = "2026-08-24T19:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(!ext.in_window(late));

        // Wednesday noon is outside the weekday set
        let wednesday = "2026-08-26T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(!ext.in_window(wednesday));
    }

    #[tokio::test]
    async fn test_schedule_vetoes_deactivation_in_window() {
        // Window covers every moment of every day
        let ext = schedule(
            "monday,tuesday,wednesday,thursday,friday,saturday,sunday",
            "00:00",
            "23:59:59",
        );

        let verdict = ext.invoke(&LifecycleEvent::DeactivationRequested).await.unwrap();
        assert_eq!(verdict, Verdict::Veto);

        // Activation is never vetoed
        let verdict = ext.invoke(&LifecycleEvent::ActivationRequested).await.unwrap();
        assert_eq!(verdict, Verdict::Proceed);
    }

    #[test]
    fn test_invalid_weekday_rejected() {
        let (tx, _rx) = activity_channel();
        let result = ScheduledAlwaysOnExtension::new("08:00", "18:00", "funday", false, tx);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(
            parse_time_of_day("08:30").unwrap(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap()
        );
        assert_eq!(
            parse_time_of_day("23:59:59").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 59).unwrap()
        );
        assert!(parse_time_of_day("25:00").is_err());
    }
}
