//! Per-sender ordered dispatch of inbound messages to the upper layer.
//!
//! Messages from one sender are submitted strictly in receipt order with at most
//!  one in flight at a time, without ever blocking the submitting task: if the
//!  upper layer does not complete a message within the submission call, the
//!  remaining messages queue up until the completion signal arrives. The signal may
//!  come from any task; everything else about an entry is only ever touched from
//!  the execution context of the connection its sender communicates through.
//!
//! Queued bytes per sender are bounded by a watermark pair: crossing the high
//!  watermark pauses reads on the sender's connection, draining below the low
//!  watermark resumes them.
//!
//! Out-of-band messages bypass all of this: each is handed to a worker task
//!  immediately and its payload is released as soon as the submission returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::config::TcpTransportConfig;
use crate::connection::{ConnCommand, ExecutionContext};
use crate::message::{MessageId, TransportMessage};
use crate::message_sink::MessageSink;
use crate::node_addr::NodeAddr;

pub struct DispatchEngine {
    sink: Arc<dyn MessageSink>,
    sender_table: RwLock<FxHashMap<NodeAddr, Arc<SenderEntry>>>,
    low_watermark: usize,
    high_watermark: usize,
}

struct SenderEntry {
    sender: NodeAddr,
    /// the execution context of the connection this sender communicates through
    ctx: Mutex<ExecutionContext>,
    state: Mutex<EntryState>,
    submitted_msgs: AtomicU64,
    queued_msgs: AtomicU64,
}

struct EntryState {
    pending: VecDeque<TransportMessage>,
    in_flight: Option<InFlight>,
    /// true while a submission call into the sink is on the stack, to recognize
    ///  completion signals arriving re-entrantly from within that call
    running: bool,
    queued_bytes: usize,
    overflow_signaled: bool,
}

struct InFlight {
    id: MessageId,
    /// The message itself while awaiting its completion signal; already taken (and
    ///  released) once the signal arrived but the dispatch-next step has not run
    ///  yet - the marker must outlive the message so a newly read message cannot
    ///  jump ahead of the queue in the meantime.
    msg: Option<TransportMessage>,
}

impl SenderEntry {
    fn new(sender: NodeAddr, ctx: ExecutionContext) -> SenderEntry {
        debug_assert!(ctx.is_current());
        SenderEntry {
            sender,
            ctx: Mutex::new(ctx),
            state: Mutex::new(EntryState {
                pending: VecDeque::new(),
                in_flight: None,
                running: false,
                queued_bytes: 0,
                overflow_signaled: false,
            }),
            submitted_msgs: AtomicU64::new(0),
            queued_msgs: AtomicU64::new(0),
        }
    }

    /// All mutation except the completion signal must happen on the bound context.
    ///  When the bound connection is gone (the sender reconnected through a new
    ///  one), the entry follows its sender to the live context.
    fn check_binding(&self, ctx: &ExecutionContext) {
        let mut bound = self.ctx.lock().unwrap();
        if bound.is_current() {
            return;
        }
        if bound.is_alive() {
            error!(
                "dispatch entry for {:?} touched from a foreign execution context - this is most likely a bug",
                self.sender
            );
        } else {
            debug!(
                "connection owning the dispatch entry for {:?} is gone, rebinding to the live one",
                self.sender
            );
            *bound = ctx.clone();
        }
    }

    fn bound_ctx(&self) -> ExecutionContext {
        self.ctx.lock().unwrap().clone()
    }

    fn reset(&self) {
        self.submitted_msgs.store(0, Ordering::Relaxed);
        self.queued_msgs.store(0, Ordering::Relaxed);
    }

    fn dump_line(&self) -> String {
        let state = self.state.lock().unwrap();
        format!(
            "{:?}: pending={} queued msgs={} submitted msgs={}",
            self.sender,
            state.pending.len(),
            self.queued_msgs.load(Ordering::Relaxed),
            self.submitted_msgs.load(Ordering::Relaxed),
        )
    }
}

impl DispatchEngine {
    pub fn new(sink: Arc<dyn MessageSink>, config: &TcpTransportConfig) -> DispatchEngine {
        let (low_watermark, high_watermark) = config.effective_watermarks();
        DispatchEngine {
            sink,
            sender_table: RwLock::new(FxHashMap::default()),
            low_watermark,
            high_watermark,
        }
    }

    /// Submit a regular message for in-order dispatch, on the execution context of
    ///  the connection it arrived through. Returns whether the message was
    ///  processed synchronously.
    pub async fn process(&self, ctx: &ExecutionContext, msg: TransportMessage) -> bool {
        if msg.is_oob() {
            return self.process_oob(msg);
        }
        let Some(sender) = msg.src() else {
            warn!("dropping message {:?} without a source address", msg.id());
            msg.release();
            return true;
        };
        let entry = self.get_or_create_entry(ctx, sender);

        {
            let mut state = entry.state.lock().unwrap();
            if state.in_flight.is_some() {
                entry.queued_msgs.fetch_add(1, Ordering::Relaxed);
                state.queued_bytes += msg.payload_len();
                state.pending.push_back(msg);
                drop(state);
                self.notify_on_watermark_overflow(&entry);
                return false;
            }
        }
        entry.submitted_msgs.fetch_add(1, Ordering::Relaxed);
        self.submit_message(&entry, msg).await
    }

    /// Submit an ordered group of messages from one sender. Submissions continue
    ///  synchronously through the batch until one suspends; the rest queue up.
    pub async fn process_batch(
        &self,
        ctx: &ExecutionContext,
        sender: NodeAddr,
        msgs: Vec<TransportMessage>,
    ) -> bool {
        if msgs.is_empty() {
            return true;
        }
        let entry = self.get_or_create_entry(ctx, sender);

        let mut iter = msgs.into_iter();
        let busy = entry.state.lock().unwrap().in_flight.is_some();
        if !busy {
            let mut submitted = 0;
            for msg in iter.by_ref() {
                submitted += 1;
                if !self.submit_message(&entry, msg).await {
                    break;
                }
            }
            entry.submitted_msgs.fetch_add(submitted, Ordering::Relaxed);
        }

        let mut queued = 0;
        {
            let mut state = entry.state.lock().unwrap();
            for msg in iter {
                queued += 1;
                state.queued_bytes += msg.payload_len();
                state.pending.push_back(msg);
            }
        }
        if queued > 0 {
            entry.queued_msgs.fetch_add(queued, Ordering::Relaxed);
        }
        self.notify_on_watermark_overflow(&entry);
        false
    }

    /// Out-of-band: submitted on a worker task immediately, independent of the
    ///  sender's queue, and released unconditionally once the submission returns -
    ///  out-of-band messages do not participate in the completion-signal protocol.
    pub fn process_oob(&self, msg: TransportMessage) -> bool {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.submit(&msg).await;
            msg.release();
        });
        true
    }

    /// The completion signal for the message currently in flight for its sender.
    ///  Safe to call from any task; a signal that does not match the in-flight
    ///  message indicates a bug upstream and is logged without advancing dispatch.
    pub async fn message_completed(&self, msg: &TransportMessage) {
        let Some(src) = msg.src() else {
            warn!("completion signal for message {:?} without a source address", msg.id());
            return;
        };
        let Some(entry) = self.get_entry(&src) else {
            debug!(
                "message {:?} was marked as completed, but sender {:?} is not in the sender table - most likely a concurrent stop",
                msg.id(),
                src
            );
            return;
        };
        trace!("marking message {:?} from {:?} as completed", msg.id(), src);

        let ctx = entry.bound_ctx();
        let parked = {
            let mut state = entry.state.lock().unwrap();
            let running = state.running;
            match &mut state.in_flight {
                None => {
                    error!(
                        "inconsistent completion signal: {:?} completed but nothing is in flight for {:?} - this is most likely a bug",
                        msg.id(),
                        src
                    );
                    return;
                }
                Some(in_flight) if in_flight.id != msg.id() => {
                    error!(
                        "inconsistent completion signal: completed {:?} versus in flight {:?} for {:?} - this is most likely a bug",
                        msg.id(),
                        in_flight.id,
                        src
                    );
                    return;
                }
                Some(in_flight) => {
                    if ctx.is_current() && running {
                        trace!("message {:?} completed synchronously for sender {:?}", msg.id(), src);
                        state.in_flight = None;
                        return;
                    }
                    // NB: the in-flight marker stays set until the dispatch-next
                    //  step runs on the owning context - clearing it here would let
                    //  a message read in the meantime jump ahead of the queue
                    in_flight.msg.take()
                }
            }
        };
        if let Some(parked) = parked {
            parked.release();
        }

        trace!(
            "message {:?} completed async, dispatching next message if applicable for sender {:?}",
            msg.id(),
            src
        );
        if ctx.is_current() {
            self.dispatch_next_entry(&entry).await;
        } else if !ctx.post(ConnCommand::DispatchNext(src)) {
            // the owning connection is gone and cannot run the step; run it from
            //  here so the queue does not stall until the sender reconnects
            debug!("owning connection for {:?} is gone, running dispatch-next directly", src);
            self.dispatch_next_entry(&entry).await;
        }
    }

    /// The dispatch-next step for a sender, invoked on the owning execution context
    ///  after an asynchronous completion.
    pub(crate) async fn dispatch_next(&self, sender: NodeAddr) {
        let Some(entry) = self.get_entry(&sender) else {
            debug!("dispatch-next for {:?} whose entry is gone - pruned by a view change", sender);
            return;
        };
        self.dispatch_next_entry(&entry).await;
    }

    async fn dispatch_next_entry(&self, entry: &Arc<SenderEntry>) {
        {
            let mut state = entry.state.lock().unwrap();
            // drops a parked, already-released marker - or the parked message
            //  itself if the completion raced us to it
            state.in_flight = None;
            if state.pending.is_empty() {
                trace!("queue is exhausted for sender {:?}", entry.sender);
                return;
            }
            trace!(
                "queue has {} messages remaining for sender {:?}",
                state.pending.len(),
                entry.sender
            );
        }

        let mut processed = 0;
        loop {
            let next = {
                let mut state = entry.state.lock().unwrap();
                let msg = state.pending.pop_front();
                if let Some(msg) = &msg {
                    state.queued_bytes -= msg.payload_len();
                }
                msg
            };
            let Some(msg) = next else { break };
            processed += 1;
            if !self.submit_message(entry, msg).await {
                break;
            }
        }

        let resume = {
            let mut state = entry.state.lock().unwrap();
            trace!(
                "processed {} messages for {:?}, new queued byte total is {}",
                processed,
                entry.sender,
                state.queued_bytes
            );
            if state.overflow_signaled && state.queued_bytes < self.low_watermark {
                state.overflow_signaled = false;
                true
            } else {
                false
            }
        };
        if resume {
            trace!("low watermark met for {:?}, resuming reads", entry.sender);
            entry.bound_ctx().post(ConnCommand::ResumeReads);
        }
    }

    /// Submit a single message to the sink; returns whether it completed within
    ///  the call.
    async fn submit_message(&self, entry: &Arc<SenderEntry>, msg: TransportMessage) -> bool {
        {
            let mut state = entry.state.lock().unwrap();
            state.running = true;
            state.in_flight = Some(InFlight {
                id: msg.id(),
                msg: None,
            });
        }

        self.sink.submit(&msg).await;

        let mut state = entry.state.lock().unwrap();
        state.running = false;

        if !msg.needs_async_completion() {
            trace!("message {:?} assumed to complete synchronously, no completion signal expected", msg.id());
            state.in_flight = None;
            drop(state);
            msg.release();
            return true;
        }

        match &mut state.in_flight {
            Some(in_flight) if in_flight.id == msg.id() => {
                trace!(
                    "message {:?} not completed synchronously, must wait until it is completed later",
                    msg.id()
                );
                in_flight.msg = Some(msg);
                false
            }
            _ => {
                // the completion signal arrived re-entrantly during the submission
                drop(state);
                msg.release();
                true
            }
        }
    }

    fn notify_on_watermark_overflow(&self, entry: &Arc<SenderEntry>) {
        let pause = {
            let mut state = entry.state.lock().unwrap();
            trace!(
                "queued byte total for {:?} is now {} with {} pending messages",
                entry.sender,
                state.queued_bytes,
                state.pending.len()
            );
            if !state.overflow_signaled && state.queued_bytes > self.high_watermark {
                state.overflow_signaled = true;
                true
            } else {
                false
            }
        };
        if pause {
            trace!("high watermark met for sender {:?}, pausing reads", entry.sender);
            entry.bound_ctx().post(ConnCommand::PauseReads);
        }
    }

    fn get_entry(&self, sender: &NodeAddr) -> Option<Arc<SenderEntry>> {
        self.sender_table.read().unwrap().get(sender).cloned()
    }

    fn get_or_create_entry(&self, ctx: &ExecutionContext, sender: NodeAddr) -> Arc<SenderEntry> {
        {
            let table = self.sender_table.read().unwrap();
            if let Some(entry) = table.get(&sender) {
                entry.check_binding(ctx);
                return entry.clone();
            }
        }
        self.sender_table
            .write()
            .unwrap()
            .entry(sender)
            .or_insert_with(|| {
                trace!("creating inbound dispatch entry for sender {:?}", sender);
                Arc::new(SenderEntry::new(sender, ctx.clone()))
            })
            .clone()
    }

    /// prune entries of senders that left the membership view
    pub fn on_view_change(&self, members: &[NodeAddr]) {
        self.sender_table
            .write()
            .unwrap()
            .retain(|sender, _| members.contains(sender));
    }

    /// reset per-sender counters
    pub fn reset(&self) {
        for entry in self.sender_table.read().unwrap().values() {
            entry.reset();
        }
    }

    /// drop all per-sender state (shutdown)
    pub fn clear(&self) {
        self.sender_table.write().unwrap().clear();
    }

    pub fn num_senders(&self) -> usize {
        self.sender_table.read().unwrap().len()
    }

    /// human-readable per-sender statistics
    pub fn dump(&self) -> String {
        self.sender_table
            .read()
            .unwrap()
            .values()
            .map(|entry| entry.dump_line())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::config::TcpTransportConfig;
    use crate::connection::test_context;
    use crate::message::MessageFlags;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct RecordingSink {
        events: mpsc::UnboundedSender<(MessageId, Vec<u8>)>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn submit(&self, msg: &TransportMessage) {
            self.events
                .send((msg.id(), msg.flat_payload().to_vec()))
                .ok();
        }
    }

    struct Fixture {
        engine: Arc<DispatchEngine>,
        pool: Arc<BufferPool>,
        delivered: mpsc::UnboundedReceiver<(MessageId, Vec<u8>)>,
    }

    fn fixture(low: usize, high: usize) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = TcpTransportConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        config.low_watermark = low;
        config.high_watermark = high;
        Fixture {
            engine: Arc::new(DispatchEngine::new(Arc::new(RecordingSink { events: tx }), &config)),
            pool: Arc::new(BufferPool::new(1024, 16)),
            delivered: rx,
        }
    }

    fn sender() -> NodeAddr {
        NodeAddr::localhost(7800)
    }

    fn msg(fixture: &Fixture, flags: MessageFlags, payload: &[u8]) -> TransportMessage {
        TransportMessage::new(
            Some(sender()),
            None,
            flags,
            Bytes::new(),
            Some(fixture.pool.allocate(payload)),
        )
    }

    fn sync_msg(fixture: &Fixture, payload: &[u8]) -> TransportMessage {
        msg(fixture, MessageFlags::empty(), payload)
    }

    fn async_msg(fixture: &Fixture, payload: &[u8]) -> TransportMessage {
        msg(fixture, MessageFlags::ASYNC_COMPLETION, payload)
    }

    async fn next_delivered(fixture: &mut Fixture) -> (MessageId, Vec<u8>) {
        timeout(Duration::from_secs(5), fixture.delivered.recv())
            .await
            .expect("expected a delivery")
            .expect("sink channel closed")
    }

    fn assert_nothing_delivered(fixture: &mut Fixture) {
        assert!(fixture.delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_messages_flow_through() {
        let mut fixture = fixture(100, 200);
        let (ctx, _commands) = test_context(1);

        let engine = fixture.engine.clone();
        let m1 = sync_msg(&fixture, b"one");
        let m2 = sync_msg(&fixture, b"two");
        crate::connection::in_context(1, async {
            assert!(engine.process(&ctx, m1).await);
            assert!(engine.process(&ctx, m2).await);
        })
        .await;

        assert_eq!(next_delivered(&mut fixture).await.1, b"one");
        assert_eq!(next_delivered(&mut fixture).await.1, b"two");
    }

    #[tokio::test]
    async fn test_suspended_message_queues_followers_in_order() {
        let mut fixture = fixture(100, 200);
        let (ctx, mut commands) = test_context(1);

        let engine = fixture.engine.clone();
        let m1 = async_msg(&fixture, b"first");
        let m1_completion = m1.retain();
        let followers: Vec<_> = [b"second".as_slice(), b"third", b"fourth"]
            .iter()
            .map(|p| sync_msg(&fixture, p))
            .collect();

        crate::connection::in_context(1, async {
            assert!(!engine.process(&ctx, m1).await);
            for msg in followers {
                assert!(!engine.process(&ctx, msg).await);
            }
        })
        .await;

        // the suspended head was submitted, the followers are queued behind it
        assert_eq!(next_delivered(&mut fixture).await.1, b"first");
        assert_nothing_delivered(&mut fixture);

        // completing from a foreign task posts the dispatch-next step to the
        //  owning context
        engine.message_completed(&m1_completion).await;
        m1_completion.release();
        match commands.try_recv() {
            Ok(ConnCommand::DispatchNext(s)) => assert_eq!(s, sender()),
            _ => panic!("expected a dispatch-next command"),
        }
        crate::connection::in_context(1, engine.dispatch_next(sender())).await;

        assert_eq!(next_delivered(&mut fixture).await.1, b"second");
        assert_eq!(next_delivered(&mut fixture).await.1, b"third");
        assert_eq!(next_delivered(&mut fixture).await.1, b"fourth");
        assert_nothing_delivered(&mut fixture);
    }

    #[tokio::test]
    async fn test_watermark_pause_and_resume() {
        let mut fixture = fixture(100, 200);
        let (ctx, mut commands) = test_context(1);
        let engine = fixture.engine.clone();

        let head = async_msg(&fixture, b"head");
        let head_completion = head.retain();

        crate::connection::in_context(1, async {
            assert!(!engine.process(&ctx, head).await);
            // 150 queued bytes: below the high watermark, no pause
            for _ in 0..3 {
                engine.process(&ctx, sync_msg(&fixture, &[0u8; 50])).await;
            }
            assert!(commands.try_recv().is_err());

            // 250 queued bytes: exactly one pause signal
            for _ in 0..2 {
                engine.process(&ctx, sync_msg(&fixture, &[0u8; 50])).await;
            }
            match commands.try_recv() {
                Ok(ConnCommand::PauseReads) => {}
                _ => panic!("expected a pause-reads command"),
            }

            // growing further does not signal again
            engine.process(&ctx, sync_msg(&fixture, &[0u8; 50])).await;
            assert!(commands.try_recv().is_err());
        })
        .await;
        assert_eq!(next_delivered(&mut fixture).await.1, b"head");

        // completion from a foreign task; the owning context then drains the
        //  queue, dropping below the low watermark - exactly one resume signal
        engine.message_completed(&head_completion).await;
        head_completion.release();
        match commands.try_recv() {
            Ok(ConnCommand::DispatchNext(_)) => {}
            _ => panic!("expected a dispatch-next command"),
        }
        crate::connection::in_context(1, engine.dispatch_next(sender())).await;

        for _ in 0..6 {
            next_delivered(&mut fixture).await;
        }
        match commands.try_recv() {
            Ok(ConnCommand::ResumeReads) => {}
            _ => panic!("expected a resume-reads command"),
        }
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_resume_while_drain_stops_above_low_watermark() {
        let mut fixture = fixture(100, 200);
        let (ctx, mut commands) = test_context(1);
        let engine = fixture.engine.clone();

        let head = async_msg(&fixture, b"head");
        let head_completion = head.retain();
        let middle = async_msg(&fixture, &[1u8; 100]);
        let middle_completion = middle.retain();

        crate::connection::in_context(1, async {
            assert!(!engine.process(&ctx, head).await);
            engine.process(&ctx, middle).await;
            engine.process(&ctx, sync_msg(&fixture, &[2u8; 120])).await;
        })
        .await;
        // 220 queued bytes
        match commands.try_recv() {
            Ok(ConnCommand::PauseReads) => {}
            _ => panic!("expected a pause-reads command"),
        }
        assert_eq!(next_delivered(&mut fixture).await.1, b"head");

        // draining stops at the suspending middle message with 120 bytes still
        //  queued - no resume yet
        engine.message_completed(&head_completion).await;
        head_completion.release();
        commands.recv().await; // the dispatch-next command
        crate::connection::in_context(1, engine.dispatch_next(sender())).await;
        assert_eq!(next_delivered(&mut fixture).await.1, vec![1u8; 100]);
        assert!(commands.try_recv().is_err());

        // the second drain empties the queue and resumes
        engine.message_completed(&middle_completion).await;
        middle_completion.release();
        commands.recv().await;
        crate::connection::in_context(1, engine.dispatch_next(sender())).await;
        assert_eq!(next_delivered(&mut fixture).await.1, vec![2u8; 120]);
        match commands.try_recv() {
            Ok(ConnCommand::ResumeReads) => {}
            _ => panic!("expected a resume-reads command"),
        }
    }

    #[tokio::test]
    async fn test_oob_bypasses_busy_sender() {
        let mut fixture = fixture(100, 200);
        let (ctx, _commands) = test_context(1);
        let engine = fixture.engine.clone();

        let head = async_msg(&fixture, b"blocked");
        crate::connection::in_context(1, async {
            assert!(!engine.process(&ctx, head).await);
            engine.process(&ctx, sync_msg(&fixture, b"waiting")).await;
        })
        .await;
        assert_eq!(next_delivered(&mut fixture).await.1, b"blocked");

        // the out-of-band message is delivered although "blocked" never completes
        let oob = msg(&fixture, MessageFlags::OOB, b"urgent");
        engine.process_oob(oob);
        assert_eq!(next_delivered(&mut fixture).await.1, b"urgent");
        assert_nothing_delivered(&mut fixture);
    }

    #[tokio::test]
    async fn test_batch_submits_until_suspension() {
        let mut fixture = fixture(100, 200);
        let (ctx, mut commands) = test_context(1);
        let engine = fixture.engine.clone();

        let suspending = async_msg(&fixture, b"c");
        let completion = suspending.retain();
        let batch = vec![
            sync_msg(&fixture, b"a"),
            sync_msg(&fixture, b"b"),
            suspending,
            sync_msg(&fixture, b"d"),
        ];

        crate::connection::in_context(1, async {
            assert!(!engine.process_batch(&ctx, sender(), batch).await);
        })
        .await;

        assert_eq!(next_delivered(&mut fixture).await.1, b"a");
        assert_eq!(next_delivered(&mut fixture).await.1, b"b");
        assert_eq!(next_delivered(&mut fixture).await.1, b"c");
        assert_nothing_delivered(&mut fixture);

        engine.message_completed(&completion).await;
        completion.release();
        commands.recv().await;
        crate::connection::in_context(1, engine.dispatch_next(sender())).await;
        assert_eq!(next_delivered(&mut fixture).await.1, b"d");

        assert!(engine.dump().contains("queued msgs=1"));
        assert!(engine.dump().contains("submitted msgs=3"));
    }

    #[tokio::test]
    async fn test_mismatched_completion_is_logged_not_fatal() {
        let mut fixture = fixture(100, 200);
        let (ctx, mut commands) = test_context(1);
        let engine = fixture.engine.clone();

        let head = async_msg(&fixture, b"head");
        let head_completion = head.retain();
        let unrelated = async_msg(&fixture, b"unrelated");

        crate::connection::in_context(1, async {
            assert!(!engine.process(&ctx, head).await);
            engine.process(&ctx, sync_msg(&fixture, b"queued")).await;
        })
        .await;
        assert_eq!(next_delivered(&mut fixture).await.1, b"head");

        // a completion signal for a message that is not in flight does not advance
        //  anything
        engine.message_completed(&unrelated).await;
        unrelated.release();
        assert!(commands.try_recv().is_err());
        assert_nothing_delivered(&mut fixture);

        // the real completion still works afterwards
        engine.message_completed(&head_completion).await;
        head_completion.release();
        commands.recv().await;
        crate::connection::in_context(1, engine.dispatch_next(sender())).await;
        assert_eq!(next_delivered(&mut fixture).await.1, b"queued");
    }

    #[tokio::test]
    async fn test_completion_for_unknown_sender_is_ignored() {
        let fixture = fixture(100, 200);
        let engine = fixture.engine.clone();
        let stray = async_msg(&fixture, b"stray");
        engine.message_completed(&stray).await;
        stray.release();
    }

    #[tokio::test]
    async fn test_view_change_prunes_departed_senders() {
        let mut fixture = fixture(100, 200);
        let (ctx, _commands) = test_context(1);
        let engine = fixture.engine.clone();

        let other = NodeAddr::localhost(7801);
        crate::connection::in_context(1, async {
            engine.process(&ctx, sync_msg(&fixture, b"from a")).await;
            let from_b = TransportMessage::new(
                Some(other),
                None,
                MessageFlags::empty(),
                Bytes::new(),
                Some(fixture.pool.allocate(b"from b")),
            );
            engine.process(&ctx, from_b).await;
        })
        .await;
        assert_eq!(engine.num_senders(), 2);

        engine.on_view_change(&[sender()]);
        assert_eq!(engine.num_senders(), 1);

        engine.clear();
        assert_eq!(engine.num_senders(), 0);
        next_delivered(&mut fixture).await;
        next_delivered(&mut fixture).await;
    }

    #[tokio::test]
    async fn test_submission_reaches_the_sink() {
        let mut sink = crate::message_sink::MockMessageSink::new();
        sink.expect_submit()
            .withf(|msg| msg.flat_payload() == b"payload")
            .times(1)
            .returning(|_| ());

        let config = TcpTransportConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let engine = Arc::new(DispatchEngine::new(Arc::new(sink), &config));
        let pool = Arc::new(BufferPool::new(1024, 4));
        let (ctx, _commands) = test_context(99);

        let msg = TransportMessage::new(
            Some(sender()),
            None,
            MessageFlags::empty(),
            Bytes::new(),
            Some(pool.allocate(b"payload")),
        );
        crate::connection::in_context(99, async {
            assert!(engine.process(&ctx, msg).await);
        })
        .await;
    }

    #[tokio::test]
    async fn test_reset_zeroes_counters() {
        let fixture = fixture(100, 200);
        let (ctx, _commands) = test_context(1);
        let engine = fixture.engine.clone();

        crate::connection::in_context(1, async {
            engine.process(&ctx, sync_msg(&fixture, b"x")).await;
        })
        .await;
        assert!(engine.dump().contains("submitted msgs=1"));

        engine.reset();
        assert!(engine.dump().contains("submitted msgs=0"));
    }
}
