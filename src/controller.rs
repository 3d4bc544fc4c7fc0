//! Deployment scale controller
//!
//! Owns the scale-target status and drives it toward observed reality: a
//! reconciliation loop polls the scale subresource every few seconds, an
//! activity channel wakes the deployment when traffic arrives, and an idle
//! timeout scales it back to zero. Unforced transitions are routed through
//! the extension chain; its terminal action is the forced call.

use crate::extensions::{ExtensionChain, LifecycleEvent, Verdict};
use crate::scale::{Scale, ScaleTarget, SharedScaleClient};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interval between reconciliation cycles
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the activity channel; signals beyond it are dropped,
/// which is fine because one pending signal is as good as many
const ACTIVITY_CHANNEL_CAPACITY: usize = 16;

/// Sends activity signals to a controller. Cloned into every middleware or
/// extension that reports traffic.
pub type ActivitySender = mpsc::Sender<()>;
pub type ActivityReceiver = mpsc::Receiver<()>;

/// Create the bounded activity channel wired between an engine's
/// traffic-observing components and its controller.
pub fn activity_channel() -> (ActivitySender, ActivityReceiver) {
    mpsc::channel(ACTIVITY_CHANNEL_CAPACITY)
}

/// Scale state of the controlled deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Unknown,
    Activating,
    Ready,
    Deactivating,
    Deactivated,
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerStatus::Unknown => "unknown",
            ControllerStatus::Activating => "activating",
            ControllerStatus::Ready => "ready",
            ControllerStatus::Deactivating => "deactivating",
            ControllerStatus::Deactivated => "deactivated",
        };
        f.write_str(s)
    }
}

struct ControllerState {
    status: ControllerStatus,
    last_status_change: Instant,
    last_activity: Instant,
}

/// Controls one deployment's replica count
pub struct Controller {
    target: ScaleTarget,
    client: SharedScaleClient,
    extensions: ExtensionChain,
    idle_timeout: Option<Duration>,
    state: Mutex<ControllerState>,
}

impl Controller {
    /// Create a new controller.
    ///
    /// Returns `Arc<Self>` because the controller is shared between its
    /// reconciliation loop and the request middlewares reading its status.
    pub fn new(
        target: ScaleTarget,
        client: SharedScaleClient,
        extensions: ExtensionChain,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            target,
            client,
            extensions,
            idle_timeout,
            state: Mutex::new(ControllerState {
                status: ControllerStatus::Unknown,
                last_status_change: now,
                last_activity: now,
            }),
        })
    }

    pub fn status(&self) -> ControllerStatus {
        self.state.lock().status
    }

    pub fn last_status_change(&self) -> Instant {
        self.state.lock().last_status_change
    }

    /// Refresh the status from an observed scale, fetching it when absent
    pub async fn update_status(&self, observed: Option<Scale>) -> anyhow::Result<()> {
        let scale = match observed {
            Some(scale) => scale,
            None => self.client.read_scale(&self.target).await?,
        };
        let status = classify(scale)?;
        self.set_status(status, false).await
    }

    /// Change the status. A call with the current status is a no-op. Unforced
    /// calls route a `StatusChangeRequested` event through the extension
    /// chain before applying.
    pub async fn set_status(&self, status: ControllerStatus, force: bool) -> anyhow::Result<()> {
        let current = self.status();
        if current == status {
            return Ok(());
        }

        if !force {
            let event = LifecycleEvent::StatusChangeRequested {
                current,
                proposed: status,
            };
            if self.extensions.run(&event).await? == Verdict::Veto {
                return Ok(());
            }
        }

        self.apply_status(status);
        Ok(())
    }

    fn apply_status(&self, status: ControllerStatus) {
        let mut state = self.state.lock();
        if state.status == status {
            return;
        }
        info!(target = %self.target, from = %state.status, to = %status, "Status changed");
        state.status = status;
        state.last_status_change = Instant::now();
    }

    /// Scale the deployment up. Unforced calls run the extension chain first;
    /// its terminal action is the forced call.
    pub async fn activate(&self, force: bool) -> anyhow::Result<()> {
        if !force {
            info!(target = %self.target, "Activation requested");
            if self.extensions.run(&LifecycleEvent::ActivationRequested).await? == Verdict::Veto {
                return Ok(());
            }
        }
        self.activate_forced().await
    }

    async fn activate_forced(&self) -> anyhow::Result<()> {
        let scale = self.client.read_scale(&self.target).await?;
        self.update_status(Some(scale)).await?;
        if matches!(
            self.status(),
            ControllerStatus::Ready | ControllerStatus::Activating
        ) {
            debug!(target = %self.target, "Already ready or activating");
            return Ok(());
        }
        info!(target = %self.target, "Activating");
        self.client.patch_scale(&self.target, 1).await?;
        self.update_status(None).await
    }

    /// Scale the deployment down to zero. Same chain routing as [`activate`].
    ///
    /// [`activate`]: Controller::activate
    pub async fn deactivate(&self, force: bool) -> anyhow::Result<()> {
        if !force {
            info!(target = %self.target, "Deactivation requested");
            if self
                .extensions
                .run(&LifecycleEvent::DeactivationRequested)
                .await?
                == Verdict::Veto
            {
                return Ok(());
            }
        }
        self.deactivate_forced().await
    }

    async fn deactivate_forced(&self) -> anyhow::Result<()> {
        let scale = self.client.read_scale(&self.target).await?;
        self.update_status(Some(scale)).await?;
        if matches!(
            self.status(),
            ControllerStatus::Deactivating | ControllerStatus::Deactivated
        ) {
            debug!(target = %self.target, "Already deactivating or deactivated");
            return Ok(());
        }
        info!(target = %self.target, "Deactivating");
        self.client.patch_scale(&self.target, 0).await?;
        self.update_status(None).await
    }

    /// Record observed traffic and wake the deployment if it is down
    pub async fn handle_activity(&self) {
        {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
        }
        let status = self.status();
        if status != ControllerStatus::Ready && status != ControllerStatus::Activating {
            if let Err(e) = self.activate(false).await {
                warn!(target = %self.target, error = %e, "Activation on activity failed");
            }
        }
    }

    /// One reconciliation cycle: refresh status, then deactivate if the idle
    /// timeout has elapsed. A failed refresh is logged and skipped; the next
    /// cycle self-heals.
    async fn reconcile(&self) {
        if let Err(e) = self.update_status(None).await {
            error!(target = %self.target, error = %e, "Status reconciliation failed");
            return;
        }

        let Some(idle_timeout) = self.idle_timeout else {
            return;
        };
        let idle = self.state.lock().last_activity.elapsed();
        if idle <= idle_timeout {
            return;
        }
        if matches!(
            self.status(),
            ControllerStatus::Ready | ControllerStatus::Activating
        ) {
            info!(
                target = %self.target,
                idle_secs = idle.as_secs(),
                "Idle timeout reached, deactivating"
            );
            if let Err(e) = self.deactivate(false).await {
                error!(target = %self.target, error = %e, "Idle deactivation failed");
            }
        }
    }

    /// Reconciliation loop. Runs for the lifetime of the engine: polls the
    /// scale subresource every cycle and consumes activity signals in between.
    pub async fn run(&self, mut activity: ActivityReceiver) {
        info!(
            target = %self.target,
            idle_timeout = ?self.idle_timeout,
            "Controller started"
        );
        // A fixed-deadline interval, not a per-iteration sleep: activity
        // bursts must not push the next reconciliation out indefinitely
        let mut reconcile_tick = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = reconcile_tick.tick() => {
                    self.reconcile().await;
                }
                signal = activity.recv() => match signal {
                    Some(()) => self.handle_activity().await,
                    None => {
                        // All senders dropped; nothing can wake us anymore
                        warn!(target = %self.target, "Activity channel closed, controller stopping");
                        break;
                    }
                },
            }
        }
    }
}

/// Classify a scale reading into a controller status.
///
/// A combination outside the four expected quadrants means the API server
/// returned something nonsensical; the cycle fails and the caller retries.
fn classify(scale: Scale) -> anyhow::Result<ControllerStatus> {
    match (scale.observed, scale.desired) {
        (o, d) if o > 0 && d > 0 => Ok(ControllerStatus::Ready),
        (o, d) if o > 0 && d == 0 => Ok(ControllerStatus::Deactivating),
        (o, d) if o == 0 && d > 0 => Ok(ControllerStatus::Activating),
        (0, 0) => Ok(ControllerStatus::Deactivated),
        (o, d) => anyhow::bail!("unexpected deployment scale: observed={}, desired={}", o, d),
    }
}
