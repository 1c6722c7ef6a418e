//! Serial gate: the only task that writes to the serial transport.
//!
//! Forward requests queue on an mpsc channel and are written one at a time in
//! arrival order. Each write gets the next link sequence number, so the serial
//! line sees one increasing sequence no matter how many clients share it; acks
//! are mapped back to the client's own number before they are fanned out. The
//! gate also owns the reader task, and reopens a failed link with exponential
//! backoff.

use ledrig_hw::transport::{LinkStatus, Received, Transport};
use ledrig_hw::{DeviceEvent, Frame};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::backoff::Backoff;

/// Queue depth for pending forward requests.
const QUEUE_DEPTH: usize = 256;

/// Unacked writes remembered for ack routing.
const ROUTE_CAPACITY: usize = 1024;

/// A frame waiting for its turn on the serial link.
pub struct ForwardRequest {
    pub frame: Frame,
    /// Answered with the link sequence number the frame was written under.
    pub reply: oneshot::Sender<Result<u32, DeviceDown>>,
}

/// A device event, tagged with the link write it acknowledges.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub link_seq: Option<u32>,
    pub event: DeviceEvent,
}

/// Link sequence number to client sequence number, oldest first.
#[derive(Debug, Default)]
struct SeqRoutes {
    pending: Mutex<VecDeque<(u32, u32)>>,
}

impl SeqRoutes {
    fn insert(&self, link_seq: u32, client_seq: u32) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.len() == ROUTE_CAPACITY {
            pending.pop_front();
        }
        pending.push_back((link_seq, client_seq));
    }

    fn take(&self, link_seq: u32) -> Option<u32> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let at = pending.iter().position(|(link, _)| *link == link_seq)?;
        pending.remove(at).map(|(_, client)| client)
    }

    /// Rewrites a device ack to the client's numbering.
    fn route(&self, event: DeviceEvent) -> RoutedEvent {
        match event {
            DeviceEvent::Ack { ack, seq } => match self.take(seq) {
                Some(client_seq) => RoutedEvent {
                    link_seq: Some(seq),
                    event: DeviceEvent::Ack { ack, seq: client_seq },
                },
                None => {
                    debug!("Ack for unknown link seq={}", seq);
                    RoutedEvent {
                        link_seq: None,
                        event: DeviceEvent::Ack { ack, seq },
                    }
                }
            },
            event => RoutedEvent {
                link_seq: None,
                event,
            },
        }
    }
}

/// The serial link is not usable right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDown;

/// Handle to a running gate.
pub struct Gate {
    pub requests: mpsc::Sender<ForwardRequest>,
    pub available: watch::Receiver<bool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Gate {
    /// Spawns the gate. The first open attempt happens inside the task.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<RoutedEvent>,
        backoff: Backoff,
    ) -> Self {
        let (requests, request_rx) = mpsc::channel(QUEUE_DEPTH);
        let (available_tx, available) = watch::channel(false);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let actor = GateActor {
            transport,
            events,
            backoff,
            available: available_tx,
            reader: None,
            reader_generation: 0,
            next_seq: 1,
            routes: Arc::new(SeqRoutes::default()),
        };
        let task = tokio::spawn(actor.run(request_rx, shutdown_rx));
        Self {
            requests,
            available,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Stops the gate and waits for it and its reader to exit.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.task.await {
            warn!("Gate task ended abnormally: {}", e);
        }
    }
}

struct GateActor {
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<RoutedEvent>,
    backoff: Backoff,
    available: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    /// Bumped on every reader spawn; down notices from older readers are stale.
    reader_generation: u64,
    next_seq: u32,
    routes: Arc<SeqRoutes>,
}

impl GateActor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ForwardRequest>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let (down_tx, mut down_rx) = mpsc::channel::<u64>(4);
        let mut retry_at = if self.try_open(&down_tx).await {
            None
        } else {
            Some(self.schedule_retry())
        };

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let result = self.forward(request.frame).await;
                    if result.is_err() && retry_at.is_none() && self.transport.status() == LinkStatus::Failed {
                        self.go_down().await;
                        retry_at = Some(self.schedule_retry());
                    }
                    let _ = request.reply.send(result);
                }
                Some(generation) = down_rx.recv() => {
                    if generation == self.reader_generation && retry_at.is_none() {
                        self.go_down().await;
                        retry_at = Some(self.schedule_retry());
                    }
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = if self.try_open(&down_tx).await {
                        None
                    } else {
                        Some(self.schedule_retry())
                    };
                }
            }
        }

        self.stop_reader().await;
        if let Err(e) = self.transport.close().await {
            debug!("Closing {} failed: {}", self.transport.endpoint(), e);
        }
        info!("Serial gate stopped");
    }

    async fn forward(&mut self, frame: Frame) -> Result<u32, DeviceDown> {
        if !*self.available.borrow() {
            return Err(DeviceDown);
        }
        let client_seq = frame.seq;
        let link_seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let frame = Frame {
            seq: link_seq,
            ..frame
        };

        // Registered before the write so a fast ack always finds its route.
        self.routes.insert(link_seq, client_seq);
        match self.transport.send(&frame).await {
            Ok(_) => {
                debug!(
                    "Forwarded client seq={} as link seq={} to {}",
                    client_seq,
                    link_seq,
                    self.transport.endpoint()
                );
                Ok(link_seq)
            }
            Err(e) => {
                self.routes.take(link_seq);
                warn!("Forwarding client seq={} failed: {}", client_seq, e);
                Err(DeviceDown)
            }
        }
    }

    async fn try_open(&mut self, down_tx: &mpsc::Sender<u64>) -> bool {
        self.stop_reader().await;
        let _ = self.transport.close().await;
        match self.transport.open().await {
            Ok(()) => {
                if self.backoff.attempts() > 0 {
                    info!(
                        "Serial link {} restored after {} retries",
                        self.transport.endpoint(),
                        self.backoff.attempts()
                    );
                }
                self.backoff.reset();
                self.reader_generation += 1;
                self.reader = Some(tokio::spawn(read_loop(
                    self.transport.clone(),
                    self.events.clone(),
                    self.routes.clone(),
                    down_tx.clone(),
                    self.reader_generation,
                )));
                self.available.send_replace(true);
                true
            }
            Err(e) => {
                warn!("Cannot open serial link {}: {}", self.transport.endpoint(), e);
                false
            }
        }
    }

    async fn go_down(&mut self) {
        warn!("Serial link {} is down", self.transport.endpoint());
        self.available.send_replace(false);
        self.stop_reader().await;
    }

    fn schedule_retry(&mut self) -> Instant {
        let delay = self.backoff.next_delay();
        debug!("Next serial reconnect attempt in {:?}", delay);
        Instant::now() + delay
    }

    async fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
    }
}

/// Reads device traffic and fans it out until the link fails.
async fn read_loop(
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<RoutedEvent>,
    routes: Arc<SeqRoutes>,
    down: mpsc::Sender<u64>,
    generation: u64,
) {
    loop {
        match transport.recv().await {
            Ok(Received::Timeout) => {}
            Ok(Received::Event(event)) => {
                let _ = events.send(routes.route(event));
            }
            Ok(Received::Frame(frame)) => match DeviceEvent::from_frame(&frame) {
                Ok(event) => {
                    let _ = events.send(routes.route(event));
                }
                Err(e) => warn!("Ignoring device frame seq={}: {}", frame.seq, e),
            },
            Err(e) => match transport.status() {
                LinkStatus::Open => debug!("Transient serial read error: {}", e),
                _ => {
                    warn!("Serial reader stopped: {}", e);
                    let _ = down.send(generation).await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledrig_hw::{Command, MemoryTransport};
    use std::time::Duration;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(500), Duration::from_secs(10))
    }

    async fn forward(gate: &Gate, frame: Frame) -> Result<u32, DeviceDown> {
        let (reply, rx) = oneshot::channel();
        gate.requests
            .send(ForwardRequest { frame, reply })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn wait_available(gate: &Gate, want: bool) {
        let mut available = gate.available.clone();
        available.wait_for(|v| *v == want).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_and_fans_out_acks() {
        let transport = Arc::new(MemoryTransport::new("serial").with_auto_ack());
        let (events, mut rx) = broadcast::channel(16);
        let gate = Gate::spawn(transport.clone(), events, backoff());
        wait_available(&gate, true).await;

        let link_seq = forward(&gate, Frame::from_command(42, &Command::Ping)).await.unwrap();
        assert_eq!(link_seq, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            RoutedEvent {
                link_seq: Some(1),
                event: DeviceEvent::ack(42),
            }
        );
        assert_eq!(transport.written()[0].seq, 1);
        gate.shutdown().await;
        assert_eq!(transport.status(), LinkStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_link_rejects_then_recovers() {
        let transport = Arc::new(MemoryTransport::new("serial"));
        let (events, _rx) = broadcast::channel(16);
        let gate = Gate::spawn(transport.clone(), events, backoff());
        wait_available(&gate, true).await;

        transport.fail_next_sends(3);
        transport.fail_next_opens(1);
        for seq in 1..=3 {
            assert_eq!(
                forward(&gate, Frame::from_command(seq, &Command::Clear)).await,
                Err(DeviceDown)
            );
        }
        assert!(!*gate.available.borrow());
        assert_eq!(
            forward(&gate, Frame::from_command(4, &Command::Clear)).await,
            Err(DeviceDown)
        );
        // The rejected request never reached the transport.
        assert_eq!(transport.send_attempts(), 3);

        // First reopen (after 500ms) fails, the second (1s later) succeeds.
        let start = Instant::now();
        wait_available(&gate, true).await;
        assert!(start.elapsed() >= Duration::from_millis(1400));
        forward(&gate, Frame::from_command(5, &Command::Clear)).await.unwrap();
        gate.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_link_keeps_one_sequence() {
        let transport = Arc::new(MemoryTransport::new("serial"));
        let (events, mut rx) = broadcast::channel(16);
        let gate = Gate::spawn(transport.clone(), events, backoff());
        wait_available(&gate, true).await;

        // Two clients that both count from 1, then one going backwards.
        let first = forward(&gate, Frame::from_command(1, &Command::Ping)).await.unwrap();
        let second = forward(&gate, Frame::from_command(1, &Command::Ping)).await.unwrap();
        let third = forward(&gate, Frame::from_command(0, &Command::Clear)).await.unwrap();
        assert_eq!((first, second, third), (1, 2, 3));
        let seqs: Vec<u32> = transport.written().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        transport.push_inbound(Received::Frame(Frame::ack(second)));
        let routed = rx.recv().await.unwrap();
        assert_eq!(routed.link_seq, Some(second));
        assert_eq!(routed.event, DeviceEvent::ack(1));

        // Each route is used once; a repeated ack is passed on unrouted.
        transport.push_inbound(Received::Frame(Frame::ack(second)));
        let routed = rx.recv().await.unwrap();
        assert_eq!(routed.link_seq, None);

        // Reports are not rewritten.
        let report = DeviceEvent::Report(serde_json::json!({"ack": true, "seq": 3, "state": "on"}));
        transport.push_inbound(Received::Event(report.clone()));
        assert_eq!(rx.recv().await.unwrap().event, report);
        gate.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_failing_right_after_reopen_takes_link_down() {
        let transport = Arc::new(MemoryTransport::new("serial"));
        let (events, _rx) = broadcast::channel(16);
        let gate = Gate::spawn(transport.clone(), events, backoff());
        wait_available(&gate, true).await;

        transport.fail_next_sends(3);
        for seq in 1..=3 {
            let _ = forward(&gate, Frame::from_command(seq, &Command::Clear)).await;
        }
        wait_available(&gate, false).await;

        // The reader of the next session fails as soon as it starts.
        transport.fail_next_recvs(3);
        while transport.opens() < 3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        wait_available(&gate, true).await;
        forward(&gate, Frame::from_command(4, &Command::Clear)).await.unwrap();
        gate.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_device_keeps_retrying() {
        let transport = Arc::new(MemoryTransport::new("serial"));
        transport.fail_next_opens(3);
        let (events, _rx) = broadcast::channel(16);
        let gate = Gate::spawn(transport.clone(), events, backoff());

        assert_eq!(
            forward(&gate, Frame::from_command(1, &Command::Ping)).await,
            Err(DeviceDown)
        );
        // Startup failure, then retries at +500ms and +1s fail, +2s succeeds.
        wait_available(&gate, true).await;
        assert_eq!(transport.opens(), 1);
        gate.shutdown().await;
    }
}
