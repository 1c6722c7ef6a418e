//! Animation manager.
//!
//! Plays at most one [`Pattern`] at a time through a [`DeviceController`].
//! A session is a tokio task driven by an interval timer and steered through
//! a control channel; its status is shared over a watch channel.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::{DeviceController, Event};
use crate::pattern::Pattern;

/// Default tick period.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Errors returned by the animation manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnimationError {
    /// A session exists; `stop` it first.
    #[error("an animation is already running")]
    AlreadyRunning,

    #[error("no animation is running")]
    NotRunning,

    /// The session hit a send failure; `stop` it first.
    #[error("animation faulted: {0}")]
    Faulted(String),

    #[error("pattern has no steps")]
    EmptyPattern,
}

/// Animation lifecycle events published on the controller stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnimationEvent {
    Started { pattern: String },
    Completed { pattern: String },
    Faulted { pattern: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Running,
    Paused,
    Faulted,
    Completed,
}

/// Snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub pattern: String,
    pub step: usize,
    pub state: PlaybackState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

enum Control {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Swap(Arc<Pattern>, oneshot::Sender<()>),
    Stop,
}

struct Session {
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl Session {
    fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Sends a control message and waits for the task to apply it.
    async fn request(&self, build: impl FnOnce(oneshot::Sender<()>) -> Control) -> Result<(), AnimationError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(build(tx))
            .map_err(|_| AnimationError::NotRunning)?;
        rx.await.map_err(|_| AnimationError::NotRunning)
    }

    async fn stop(self) {
        let _ = self.control.send(Control::Stop);
        if let Err(e) = self.task.await {
            warn!("Animation task ended abnormally: {}", e);
        }
    }
}

/// Drives pattern playback.
pub struct AnimationManager {
    controller: DeviceController,
    tick: Duration,
    session: Mutex<Option<Session>>,
}

impl AnimationManager {
    pub fn new(controller: DeviceController) -> Self {
        Self {
            controller,
            tick: DEFAULT_TICK,
            session: Mutex::new(None),
        }
    }

    /// Sets the tick period.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Starts playing `pattern`.
    pub async fn start(&self, pattern: Pattern) -> Result<(), AnimationError> {
        if pattern.steps.is_empty() {
            return Err(AnimationError::EmptyPattern);
        }
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.status().state != PlaybackState::Completed {
                return Err(AnimationError::AlreadyRunning);
            }
        }
        if let Some(finished) = slot.take() {
            finished.stop().await;
        }

        let pattern = Arc::new(pattern);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            pattern: pattern.name.clone(),
            step: 0,
            state: PlaybackState::Running,
            fault: None,
        });

        info!(
            "Starting animation '{}' ({} steps, {:?} per pass)",
            pattern.name,
            pattern.steps.len(),
            pattern.duration()
        );
        self.controller
            .publish(Event::Animation(AnimationEvent::Started {
                pattern: pattern.name.clone(),
            }));
        let task = tokio::spawn(run_session(
            self.controller.clone(),
            pattern,
            self.tick,
            control_rx,
            status_tx,
        ));
        *slot = Some(Session {
            control: control_tx,
            status: status_rx,
            task,
        });
        Ok(())
    }

    /// Stops and destroys the session. Returns once the tick task has exited.
    pub async fn stop(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            let name = session.status().pattern;
            session.stop().await;
            info!("Stopped animation '{}'", name);
        }
    }

    /// Freezes the timer, keeping the step position.
    pub async fn pause(&self) -> Result<(), AnimationError> {
        let slot = self.session.lock().await;
        let session = Self::live(&slot)?;
        session.request(Control::Pause).await
    }

    /// Unfreezes a paused session.
    pub async fn resume(&self) -> Result<(), AnimationError> {
        let slot = self.session.lock().await;
        let session = Self::live(&slot)?;
        session.request(Control::Resume).await
    }

    /// Replaces the running pattern; playback restarts at its first step.
    pub async fn swap(&self, pattern: Pattern) -> Result<(), AnimationError> {
        if pattern.steps.is_empty() {
            return Err(AnimationError::EmptyPattern);
        }
        let slot = self.session.lock().await;
        let session = Self::live(&slot)?;
        let pattern = Arc::new(pattern);
        info!(
            "Swapping animation to '{}' ({:?} per pass)",
            pattern.name,
            pattern.duration()
        );
        session
            .request(|ack| Control::Swap(pattern, ack))
            .await
    }

    /// Current session snapshot, if any.
    pub async fn status(&self) -> Option<SessionStatus> {
        self.session.lock().await.as_ref().map(Session::status)
    }

    fn live(slot: &Option<Session>) -> Result<&Session, AnimationError> {
        let session = slot.as_ref().ok_or(AnimationError::NotRunning)?;
        let status = session.status();
        match status.state {
            PlaybackState::Running | PlaybackState::Paused => Ok(session),
            PlaybackState::Completed => Err(AnimationError::NotRunning),
            PlaybackState::Faulted => Err(AnimationError::Faulted(status.fault.unwrap_or_default())),
        }
    }
}

async fn run_session(
    controller: DeviceController,
    mut pattern: Arc<Pattern>,
    tick: Duration,
    mut control: mpsc::UnboundedReceiver<Control>,
    status: watch::Sender<SessionStatus>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut step = 0usize;
    // When the current step was entered; `None` until its command is issued.
    let mut entered: Option<Instant> = None;
    let mut paused_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = interval.tick(), if paused_at.is_none() => {
                let now = Instant::now();
                if let Some(at) = entered {
                    if now.duration_since(at) < pattern.steps[step].hold() {
                        continue;
                    }
                    step += 1;
                    if step == pattern.steps.len() {
                        if !pattern.looping {
                            info!("Animation '{}' completed", pattern.name);
                            status.send_modify(|s| s.state = PlaybackState::Completed);
                            controller.publish(Event::Animation(AnimationEvent::Completed {
                                pattern: pattern.name.clone(),
                            }));
                            return;
                        }
                        step = 0;
                    }
                }

                let command = pattern.steps[step].command;
                if let Err(e) = controller.send(command).await {
                    warn!("Animation '{}' faulted at step {}: {}", pattern.name, step, e);
                    let reason = e.to_string();
                    status.send_modify(|s| {
                        s.step = step;
                        s.state = PlaybackState::Faulted;
                        s.fault = Some(reason.clone());
                    });
                    controller.publish(Event::Animation(AnimationEvent::Faulted {
                        pattern: pattern.name.clone(),
                        reason,
                    }));
                    return;
                }
                entered = Some(Instant::now());
                status.send_modify(|s| s.step = step);
            }
            message = control.recv() => match message {
                Some(Control::Pause(ack)) => {
                    if paused_at.is_none() {
                        paused_at = Some(Instant::now());
                        status.send_modify(|s| s.state = PlaybackState::Paused);
                        debug!("Animation '{}' paused at step {}", pattern.name, step);
                    }
                    let _ = ack.send(());
                }
                Some(Control::Resume(ack)) => {
                    if let Some(at) = paused_at.take() {
                        let frozen = at.elapsed();
                        if let Some(entered) = entered.as_mut() {
                            *entered += frozen;
                        }
                        interval.reset();
                        status.send_modify(|s| s.state = PlaybackState::Running);
                        debug!("Animation '{}' resumed at step {}", pattern.name, step);
                    }
                    let _ = ack.send(());
                }
                Some(Control::Swap(next, ack)) => {
                    pattern = next;
                    step = 0;
                    entered = None;
                    status.send_modify(|s| {
                        s.pattern = pattern.name.clone();
                        s.step = 0;
                    });
                    let _ = ack.send(());
                }
                Some(Control::Stop) | None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ConnectionState;
    use crate::pattern::Step;
    use ledrig_hw::{Color, Command, MemoryTransport};

    async fn setup() -> (DeviceController, Arc<MemoryTransport>, AnimationManager) {
        let transport = Arc::new(MemoryTransport::new("rig"));
        let controller = DeviceController::new();
        controller.connect_transport(transport.clone()).await.unwrap();
        let manager = AnimationManager::new(controller.clone());
        (controller, transport, manager)
    }

    fn red_blue() -> Pattern {
        Pattern::new(
            "red-blue",
            vec![
                Step::new(Command::Fill { color: Color::RED }, Duration::from_millis(100)),
                Step::new(Command::Fill { color: Color::BLUE }, Duration::from_millis(100)),
            ],
            true,
        )
    }

    fn last_sent(controller: &DeviceController) -> Option<Command> {
        controller.sent_log().last().map(|s| s.command)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fidelity_samples() {
        let (controller, _transport, manager) = setup().await;
        let t0 = Instant::now();
        manager.start(red_blue()).await.unwrap();

        let red = Command::Fill { color: Color::RED };
        let blue = Command::Fill { color: Color::BLUE };
        for (at, expected) in [(50, red), (150, blue), (250, red)] {
            tokio::time::sleep_until(t0 + Duration::from_millis(at)).await;
            assert_eq!(last_sent(&controller), Some(expected), "sample at {}ms", at);
        }
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let (_controller, _transport, manager) = setup().await;
        manager.start(red_blue()).await.unwrap();
        assert_eq!(
            manager.start(red_blue()).await,
            Err(AnimationError::AlreadyRunning)
        );
        manager.stop().await;
        manager.start(red_blue()).await.unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_empty_pattern_rejected() {
        let (_controller, _transport, manager) = setup().await;
        let empty = Pattern::new("empty", Vec::new(), true);
        assert_eq!(manager.start(empty).await, Err(AnimationError::EmptyPattern));
        assert!(manager.status().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_position() {
        let (controller, _transport, manager) = setup().await;
        manager.start(red_blue()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.pause().await.unwrap();
        let sent_before = controller.sent_log().len();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.sent_log().len(), sent_before);
        let status = manager.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Paused);
        assert_eq!(status.step, 1);

        manager.resume().await.unwrap();
        // 50ms of the blue hold remained when paused.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(controller.sent_log().len(), sent_before);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            last_sent(&controller),
            Some(Command::Fill { color: Color::RED })
        );
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_looping_pattern_completes() {
        let (controller, _transport, manager) = setup().await;
        let mut events = controller.subscribe();
        let once = Pattern::new(
            "once",
            vec![Step::new(Command::Clear, Duration::from_millis(20))],
            false,
        );
        manager.start(once).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            manager.status().await.map(|s| s.state),
            Some(PlaybackState::Completed)
        );
        assert_eq!(controller.sent_log().len(), 1);
        assert_eq!(
            events.recv().await,
            Some(Event::Animation(AnimationEvent::Started {
                pattern: "once".into()
            }))
        );
        assert_eq!(
            events.recv().await,
            Some(Event::Animation(AnimationEvent::Completed {
                pattern: "once".into()
            }))
        );
        // A completed session does not block a new one.
        manager.start(red_blue()).await.unwrap();
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_restarts_at_first_step() {
        let (controller, _transport, manager) = setup().await;
        manager.start(red_blue()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let green = Pattern::new(
            "green",
            vec![Step::new(
                Command::Fill {
                    color: Color::GREEN,
                },
                Duration::from_millis(100),
            )],
            true,
        );
        manager.swap(green).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            last_sent(&controller),
            Some(Command::Fill {
                color: Color::GREEN
            })
        );
        let status = manager.status().await.unwrap();
        assert_eq!(status.pattern, "green");
        assert_eq!(status.step, 0);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_faults_session() {
        let (controller, transport, manager) = setup().await;
        let mut events = controller.subscribe();
        manager.start(red_blue()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.fail_next_sends(u32::MAX);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.state(), ConnectionState::Failed);

        let status = manager.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Faulted);
        let attempts = transport.send_attempts();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.send_attempts(), attempts);

        assert_eq!(
            manager.start(red_blue()).await,
            Err(AnimationError::AlreadyRunning)
        );
        assert!(matches!(
            manager.pause().await,
            Err(AnimationError::Faulted(_))
        ));

        let mut faults = 0;
        while let Some(event) = events.recv_timeout(Duration::from_millis(10)).await {
            if matches!(event, Event::Animation(AnimationEvent::Faulted { .. })) {
                faults += 1;
            }
        }
        assert_eq!(faults, 1);

        manager.stop().await;
        transport.fail_next_sends(0);
        controller.connect_transport(transport.clone()).await.unwrap();
        manager.start(red_blue()).await.unwrap();
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_synchronous() {
        let (controller, _transport, manager) = setup().await;
        manager.start(red_blue()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.stop().await;
        let sent = controller.sent_log().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.sent_log().len(), sent);
        assert!(manager.status().await.is_none());
        assert_eq!(manager.pause().await, Err(AnimationError::NotRunning));
    }
}
