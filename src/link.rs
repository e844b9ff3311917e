use crate::config::RtpsUdpConfig;
use crate::receive::reassembly::FragmentReassembly;
use crate::receive::receive_buffers::ByteSource;
use crate::receive::receive_strategy::{ReceiveStats, ReceiveStatus, ReceiveStrategy};
use crate::receive::rtps_receiver::{InboundSubmessage, RtpsReceiver, RtpsWireFormat};
use crate::reliability::counts::DropCounters;
use crate::reliability::outbound_sample::OutboundSample;
use crate::reliability::reliable_reader::{DeliveredSample, ReaderOutcome, ReliableReader};
use crate::reliability::reliable_writer::{ReaderState, ReliableWriter, WriterOutcome};
use crate::send::bundler::{AddressResolver, Bundler};
use crate::send::send_pipeline::SendPipeline;
use crate::send::send_queue::SendQueue;
use crate::wire::guid::{EntityId, Guid, GuidPrefix};
use crate::wire::sequence_number::SequenceNumber;
use crate::wire::submessage::Submessage;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::IoSliceMut;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// The application side of the local readers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataSink: Send + Sync + 'static {
    /// called in sequence order per (reader, writer) pair
    async fn on_sample(&self, sample: DeliveredSample);

    /// the first valid HEARTBEAT of a writer arrived at a reader
    async fn on_association_complete(&self, reader: Guid, writer: Guid);
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LinkStats {
    pub receive: ReceiveStats,
    pub drops: DropCounters,
    pub send_failures: u64,
    pub relink_requests: u64,
    pub expired_reassemblies: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
enum TimerKind {
    Heartbeat,
    NackResponse,
    AckNack,
}

type Shared<T> = Arc<tokio::sync::Mutex<T>>;

/// The RTPS/UDP link: it owns the local writers and readers, dispatches received sub-messages to
///  them, and sends what their state machines produce.
///
/// The state machines are synchronous. All I/O, timer scheduling and application callbacks
///  happen here, after the state machine's lock is released.
pub struct RtpsUdpLink {
    myself: Weak<RtpsUdpLink>,
    local_prefix: GuidPrefix,
    config: Arc<RtpsUdpConfig>,

    writers: RwLock<BTreeMap<Guid, Shared<ReliableWriter>>>,
    readers: RwLock<BTreeMap<Guid, Shared<ReliableReader>>>,
    reassembly: Arc<Mutex<FragmentReassembly>>,

    send_queue: SendQueue,
    /// held for the duration of a flush so that sub-message counts go out in the order they
    ///  were assigned
    bundler: tokio::sync::Mutex<Bundler>,
    send_pipeline: SendPipeline,
    resolver: Arc<dyn AddressResolver>,
    data_sink: Arc<dyn DataSink>,

    timers: Mutex<FxHashMap<(Guid, TimerKind), JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Mutex<LinkStats>>,
}

impl Drop for RtpsUdpLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RtpsUdpLink {
    pub fn new(
        local_prefix: GuidPrefix,
        config: Arc<RtpsUdpConfig>,
        send_pipeline: SendPipeline,
        resolver: Arc<dyn AddressResolver>,
        data_sink: Arc<dyn DataSink>,
    ) -> anyhow::Result<Arc<RtpsUdpLink>> {
        config.validate()?;

        let reassembly = Arc::new(Mutex::new(FragmentReassembly::new(config.fragment_reassembly_timeout)));
        Ok(Arc::new_cyclic(|myself| RtpsUdpLink {
            myself: myself.clone(),
            local_prefix,
            writers: Default::default(),
            readers: Default::default(),
            reassembly,
            send_queue: SendQueue::new(),
            bundler: tokio::sync::Mutex::new(Bundler::new(local_prefix, config.max_message_size)),
            send_pipeline,
            resolver,
            data_sink,
            timers: Default::default(),
            background_tasks: Default::default(),
            stats: Default::default(),
            config,
        }))
    }

    /// Binds the receive socket and a send socket for the other address family, and starts the
    ///  receive loop. The receive loop keeps the link alive until [RtpsUdpLink::shutdown] is
    ///  called.
    pub async fn bind(
        local_prefix: GuidPrefix,
        self_addr: SocketAddr,
        config: Arc<RtpsUdpConfig>,
        resolver: Arc<dyn AddressResolver>,
        data_sink: Arc<dyn DataSink>,
    ) -> anyhow::Result<Arc<RtpsUdpLink>> {
        let receive_socket = Arc::new(UdpSocket::bind(self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);
        let (send_socket_v4, send_socket_v6) = if receive_socket.local_addr()?.is_ipv6() {
            (Arc::new(UdpSocket::bind("0.0.0.0:0").await?), receive_socket.clone())
        }
        else {
            (receive_socket.clone(), Arc::new(UdpSocket::bind("[::]:0").await?))
        };

        let send_pipeline = SendPipeline::new(Arc::new(send_socket_v4), Arc::new(send_socket_v6));
        let link = Self::new(local_prefix, config, send_pipeline, resolver, data_sink)?;

        let recv_link = link.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = recv_link.recv_loop(&receive_socket).await {
                error!("receive loop terminated: {}", e);
            }
        });
        link.background_tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
        Ok(link)
    }

    /// Stops the receive loop and all timers. Pending sub-messages are not sent.
    pub fn shutdown(&self) {
        for (_, handle) in self.timers().drain() {
            handle.abort();
        }
        for handle in self.background_tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            handle.abort();
        }
    }

    pub fn local_prefix(&self) -> GuidPrefix {
        self.local_prefix
    }

    pub fn config(&self) -> &RtpsUdpConfig {
        &self.config
    }

    fn timers(&self) -> MutexGuard<'_, FxHashMap<(Guid, TimerKind), JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reassembly(&self) -> MutexGuard<'_, FragmentReassembly> {
        self.reassembly.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link_stats(&self) -> MutexGuard<'_, LinkStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_guid(&self, entity_id: EntityId) -> Guid {
        Guid::new(self.local_prefix, entity_id)
    }

    async fn writer(&self, id: Guid) -> Option<Shared<ReliableWriter>> {
        self.writers.read().await.get(&id).cloned()
    }

    async fn reader(&self, id: Guid) -> Option<Shared<ReliableReader>> {
        self.readers.read().await.get(&id).cloned()
    }

    async fn existing_writer(&self, id: Guid) -> anyhow::Result<Shared<ReliableWriter>> {
        match self.writer(id).await {
            Some(writer) => Ok(writer),
            None => anyhow::bail!("unknown local writer {:?}", id),
        }
    }

    async fn existing_reader(&self, id: Guid) -> anyhow::Result<Shared<ReliableReader>> {
        match self.reader(id).await {
            Some(reader) => Ok(reader),
            None => anyhow::bail!("unknown local reader {:?}", id),
        }
    }

    //--------------------------------------------------- entity management

    pub async fn add_writer(&self, writer: Guid) -> anyhow::Result<()> {
        if writer.prefix != self.local_prefix {
            anyhow::bail!("writer {:?} is not in the local participant", writer);
        }
        let mut writers = self.writers.write().await;
        if writers.contains_key(&writer) {
            anyhow::bail!("writer {:?} already exists", writer);
        }
        debug!("adding local writer {:?}", writer);
        writers.insert(writer, Arc::new(tokio::sync::Mutex::new(ReliableWriter::new(writer, &self.config))));
        Ok(())
    }

    pub async fn add_reader(&self, reader: Guid, durable: bool) -> anyhow::Result<()> {
        if reader.prefix != self.local_prefix {
            anyhow::bail!("reader {:?} is not in the local participant", reader);
        }
        let mut readers = self.readers.write().await;
        if readers.contains_key(&reader) {
            anyhow::bail!("reader {:?} already exists", reader);
        }
        debug!("adding local reader {:?} (durable: {})", reader, durable);
        readers.insert(reader, Arc::new(tokio::sync::Mutex::new(ReliableReader::new(reader, durable))));
        Ok(())
    }

    /// Removes a local writer. Its pending sub-messages and timers are discarded, and samples
    ///  that were not acknowledged are reported as dropped.
    pub async fn remove_writer(&self, writer: Guid) {
        let Some(w) = self.writers.write().await.remove(&writer) else {
            debug!("removing unknown writer {:?} - ignoring", writer);
            return;
        };
        debug!("removing local writer {:?}", writer);
        self.cancel_timers(writer);
        self.send_queue.purge(writer);
        self.bundler.lock().await.forget(writer);

        let outcome = w.lock().await.close();
        outcome.notify_listeners();
    }

    pub async fn remove_reader(&self, reader: Guid) {
        let Some(r) = self.readers.write().await.remove(&reader) else {
            debug!("removing unknown reader {:?} - ignoring", reader);
            return;
        };
        debug!("removing local reader {:?}", reader);
        self.cancel_timers(reader);
        self.send_queue.purge(reader);
        self.bundler.lock().await.forget(reader);

        let remote_writers = r.lock().await.writer_ids();
        for writer in remote_writers {
            if !self.is_read_locally(writer).await {
                self.reassembly().clear_completed(writer);
            }
        }
    }

    async fn is_read_locally(&self, writer: Guid) -> bool {
        let readers: Vec<_> = self.readers.read().await.values().cloned().collect();
        for reader in readers {
            if reader.lock().await.has_writer(writer) {
                return true;
            }
        }
        false
    }

    /// Associates a remote reader with a local writer
    pub async fn associate_reader(&self, writer: Guid, reader: Guid, durable: bool) -> anyhow::Result<()> {
        let w = self.existing_writer(writer).await?;
        let tx = self.send_queue.begin_transaction();
        let outcome = w.lock().await.add_reader(reader, durable);
        self.handle_writer_outcome(writer, outcome);
        drop(tx);
        self.flush().await;
        Ok(())
    }

    /// Associates a remote writer with a local reader. The association is complete when the
    ///  writer's first HEARTBEAT arrives.
    pub async fn associate_writer(&self, reader: Guid, writer: Guid) -> anyhow::Result<()> {
        let r = self.existing_reader(reader).await?;
        r.lock().await.add_writer(writer);
        Ok(())
    }

    pub async fn disassociate_reader(&self, writer: Guid, reader: Guid) -> anyhow::Result<()> {
        let w = self.existing_writer(writer).await?;
        let outcome = w.lock().await.remove_reader(reader);
        self.handle_writer_outcome(writer, outcome);
        self.send_queue.purge_between(writer, reader);
        self.bundler.lock().await.forget_between(writer, reader);
        Ok(())
    }

    pub async fn disassociate_writer(&self, reader: Guid, writer: Guid) -> anyhow::Result<()> {
        let r = self.existing_reader(reader).await?;
        let removed = r.lock().await.remove_writer(writer);
        self.send_queue.purge_between(reader, writer);
        self.bundler.lock().await.forget_between(reader, writer);
        if removed && !self.is_read_locally(writer).await {
            self.reassembly().clear_completed(writer);
        }
        Ok(())
    }

    //--------------------------------------------------- writer API

    /// Sends a sample. Its listener is notified when all associated readers acknowledged it,
    ///  or when it is dropped.
    pub async fn write(&self, sample: OutboundSample) -> anyhow::Result<()> {
        let writer = sample.writer;
        self.with_writer(writer, |w| w.write(sample)).await
    }

    pub async fn skip_sequence(&self, writer: Guid, seq: SequenceNumber) -> anyhow::Result<()> {
        self.with_writer(writer, |w| w.skip_sequence(seq)).await
    }

    pub async fn remove_sample(&self, writer: Guid, seq: SequenceNumber) -> anyhow::Result<()> {
        self.with_writer(writer, |w| w.remove_sample(seq)).await
    }

    pub async fn remove_all_msgs(&self, writer: Guid) -> anyhow::Result<()> {
        self.with_writer(writer, |w| w.remove_all_msgs()).await
    }

    /// Sends historic samples to a durable reader, to be followed by
    ///  [RtpsUdpLink::end_historic_samples]
    pub async fn replay_historic(&self, writer: Guid, reader: Guid, samples: Vec<OutboundSample>) -> anyhow::Result<()> {
        self.with_writer(writer, |w| w.replay_historic(reader, samples)).await
    }

    pub async fn end_historic_samples(&self, writer: Guid, reader: Guid) -> anyhow::Result<()> {
        self.with_writer(writer, |w| w.end_historic_samples(reader)).await
    }

    pub async fn reader_state(&self, writer: Guid, reader: Guid) -> Option<ReaderState> {
        let w = self.writer(writer).await?;
        let state = w.lock().await.reader_state(reader);
        state
    }

    async fn with_writer(&self, writer: Guid, f: impl FnOnce(&mut ReliableWriter) -> WriterOutcome) -> anyhow::Result<()> {
        let w = self.existing_writer(writer).await?;
        let tx = self.send_queue.begin_transaction();
        let outcome = f(&mut *w.lock().await);
        self.handle_writer_outcome(writer, outcome);
        drop(tx);
        self.flush().await;
        Ok(())
    }

    fn handle_writer_outcome(&self, writer: Guid, outcome: WriterOutcome) {
        let restart_heartbeats = outcome.restart_heartbeats;
        let schedule_nack_response = outcome.schedule_nack_response;

        self.send_queue.enqueue_all(outcome.notify_listeners());

        if restart_heartbeats {
            self.restart_heartbeats(writer);
        }
        if schedule_nack_response {
            self.schedule_once(writer, TimerKind::NackResponse, self.config.nack_response_delay, move |link| async move {
                link.send_nack_responses(writer).await;
            });
        }
    }

    async fn send_nack_responses(&self, writer: Guid) {
        let Some(w) = self.writer(writer).await else { return };
        let tx = self.send_queue.begin_transaction();
        let outcome = w.lock().await.send_nack_responses();
        self.handle_writer_outcome(writer, outcome);
        drop(tx);
        self.flush().await;
    }

    async fn send_heartbeats(&self, writer: Guid) {
        let Some(w) = self.writer(writer).await else { return };
        let tx = self.send_queue.begin_transaction();
        let outcome = w.lock().await.send_heartbeats();
        self.send_queue.enqueue_all(outcome.notify_listeners());
        drop(tx);
        self.flush().await;
    }

    async fn send_acknacks(&self, reader: Guid) {
        let Some(r) = self.reader(reader).await else { return };
        let tx = self.send_queue.begin_transaction();
        let msgs = {
            let mut r = r.lock().await;
            let reassembly = self.reassembly();
            r.build_acknacks(&reassembly)
        };
        self.send_queue.enqueue_all(msgs);
        drop(tx);
        self.flush().await;
    }

    //--------------------------------------------------- timers

    /// (Re)starts a writer's periodic HEARTBEATs with the initial period. The task stops when
    ///  all readers are known to have all data, and it is restarted on the next relevant
    ///  change.
    fn restart_heartbeats(&self, writer: Guid) {
        let link = self.myself.clone();
        let handle = tokio::spawn(async move {
            let mut is_first = true;
            loop {
                let interval = {
                    let Some(link) = link.upgrade() else { return };
                    let Some(w) = link.writer(writer).await else { return };
                    let mut w = w.lock().await;
                    if is_first {
                        w.reset_heartbeat_backoff();
                        is_first = false;
                    }
                    if !w.heartbeats_needed() {
                        trace!("writer {:?}: no more heartbeats needed", writer);
                        return;
                    }
                    w.next_heartbeat_interval()
                };
                tokio::time::sleep(interval).await;

                let Some(link) = link.upgrade() else { return };
                link.send_heartbeats(writer).await;
            }
        });

        if let Some(previous) = self.timers().insert((writer, TimerKind::Heartbeat), handle) {
            previous.abort();
        }
    }

    /// Runs `action` after `delay`, unless the same kind of action is already scheduled for the
    ///  entity: requests arriving in the meantime are served by that pending action.
    fn schedule_once<F, Fut>(&self, id: Guid, kind: TimerKind, delay: Duration, action: F)
    where
        F: FnOnce(Arc<RtpsUdpLink>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers();
        if let Some(pending) = timers.get(&(id, kind)) {
            if !pending.is_finished() {
                trace!("{:?} already scheduled for {:?}", kind, id);
                return;
            }
        }

        let link = self.myself.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(link) = link.upgrade() else { return };
            // requests from here on need a new timer
            drop(link.timers().remove(&(id, kind)));
            action(link).await;
        });
        timers.insert((id, kind), handle);
    }

    fn cancel_timers(&self, id: Guid) {
        self.timers().retain(|(timer_id, _), handle| {
            if *timer_id == id {
                handle.abort();
                false
            }
            else {
                true
            }
        });
    }

    fn start_reassembly_expiration(&self) {
        let link = self.myself.clone();
        let period = (self.config.fragment_reassembly_timeout / 4).max(Duration::from_millis(100));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(link) = link.upgrade() else { return };
                let expired = link.reassembly().check_expirations(Instant::now());
                if expired > 0 {
                    debug!("discarded {} expired partial samples", expired);
                    link.link_stats().expired_reassemblies += expired as u64;
                }
            }
        });
        self.background_tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }

    //--------------------------------------------------- sending

    /// Sends everything in the send queue, deduplicated and bundled into as few datagrams as
    ///  possible
    pub async fn flush(&self) {
        let mut bundler = self.bundler.lock().await;
        let msgs = self.send_queue.drain(self.config.send_queue_drain_timeout).await;
        if msgs.is_empty() {
            return;
        }

        let bundles = bundler.bundle(msgs, self.resolver.as_ref());
        let mut failures = 0;
        for bundle in &bundles {
            failures += self.send_pipeline.send_bundle(bundle).await;
        }
        if failures > 0 {
            warn!("{} datagrams could not be sent", failures);
            self.link_stats().send_failures += failures as u64;
        }
    }

    //--------------------------------------------------- receiving

    pub fn new_receiver(&self) -> LinkReceiver {
        LinkReceiver {
            strategy: ReceiveStrategy::new(
                RtpsWireFormat,
                self.config.receive_buffer_count,
                self.config.receive_buffer_size,
                self.config.receive_buffer_low_water,
            ),
            receiver: RtpsReceiver::new(self.local_prefix, self.reassembly.clone()),
            stats: self.stats.clone(),
        }
    }

    /// Reads from `socket` until [RtpsUdpLink::shutdown] is called, the socket fails or the
    ///  receive buffers turn out to be corrupt
    pub async fn recv_loop(&self, socket: &Arc<UdpSocket>) -> anyhow::Result<()> {
        info!("starting receive loop on {:?}", socket.local_addr()?);
        self.start_reassembly_expiration();

        let mut receiver = self.new_receiver();
        let mut source = UdpByteSource::new(socket.clone(), self.config.receive_buffer_size);
        loop {
            if let Err(e) = socket.readable().await {
                error!("socket error - stopping receive loop: {}", e);
                return Err(e.into());
            }

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            let inbound = span.in_scope(|| receiver.on_readable(&mut source))?;
            if inbound.is_empty() {
                continue;
            }

            self.dispatch_all(inbound).instrument(span.clone()).await;

            if let Some(link) = self.myself.upgrade() {
                tokio::spawn(async move { link.flush().await }.instrument(span));
            }
        }
    }

    /// Hands received sub-messages to the local writers and readers they are addressed to
    pub async fn dispatch_all(&self, inbound: Vec<InboundSubmessage>) {
        let tx = self.send_queue.begin_transaction();
        for msg in inbound {
            self.dispatch(msg).await;
        }
        drop(tx);
    }

    async fn dispatch(&self, inbound: InboundSubmessage) {
        let source_prefix = inbound.source_prefix;
        match &inbound.submessage {
            Submessage::Data(data) => {
                let writer = Guid::new(source_prefix, data.writer_id);
                for (reader, r) in self.readers_for(data.reader_id, writer).await {
                    let outcome = r.lock().await.process_data(writer, data.writer_sn, inbound.payload.clone());
                    self.handle_reader_outcome(reader, writer, outcome).await;
                }
            }
            Submessage::Heartbeat(heartbeat) => {
                let writer = Guid::new(source_prefix, heartbeat.writer_id);
                for (reader, r) in self.readers_for(heartbeat.reader_id, writer).await {
                    let outcome = {
                        let mut r = r.lock().await;
                        let reassembly = self.reassembly();
                        r.process_heartbeat(writer, heartbeat, &reassembly)
                    };
                    self.handle_reader_outcome(reader, writer, outcome).await;
                }
            }
            Submessage::HeartbeatFrag(hb_frag) => {
                let writer = Guid::new(source_prefix, hb_frag.writer_id);
                for (reader, r) in self.readers_for(hb_frag.reader_id, writer).await {
                    let outcome = r.lock().await.process_heartbeat_frag(writer, hb_frag);
                    self.handle_reader_outcome(reader, writer, outcome).await;
                }
            }
            Submessage::Gap(gap) => {
                let writer = Guid::new(source_prefix, gap.writer_id);
                for (reader, r) in self.readers_for(gap.reader_id, writer).await {
                    let outcome = r.lock().await.process_gap(writer, gap);
                    self.handle_reader_outcome(reader, writer, outcome).await;
                }
            }
            Submessage::AckNack(acknack) => {
                let writer = self.local_guid(acknack.writer_id);
                let reader = Guid::new(source_prefix, acknack.reader_id);
                let Some(w) = self.writer(writer).await else {
                    trace!("ACKNACK for unknown writer {:?} - ignoring", writer);
                    return;
                };
                let outcome = w.lock().await.process_acknack(reader, acknack);
                self.handle_writer_outcome(writer, outcome);
            }
            Submessage::NackFrag(nack_frag) => {
                let writer = self.local_guid(nack_frag.writer_id);
                let reader = Guid::new(source_prefix, nack_frag.reader_id);
                let Some(w) = self.writer(writer).await else {
                    trace!("NACK_FRAG for unknown writer {:?} - ignoring", writer);
                    return;
                };
                let outcome = w.lock().await.process_nackfrag(reader, nack_frag);
                self.handle_writer_outcome(writer, outcome);
            }
            other => {
                trace!("ignoring sub-message of kind {:#x}", other.kind_id());
            }
        }
    }

    /// the addressed local reader, or all local readers of the writer if the sub-message is
    ///  not addressed to a specific reader
    async fn readers_for(&self, reader_id: EntityId, writer: Guid) -> Vec<(Guid, Shared<ReliableReader>)> {
        if !reader_id.is_unknown() {
            let reader = self.local_guid(reader_id);
            return match self.reader(reader).await {
                Some(r) => vec![(reader, r)],
                None => {
                    trace!("sub-message for unknown reader {:?} - ignoring", reader);
                    vec![]
                }
            };
        }

        let candidates: Vec<_> = self.readers.read().await
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect();
        let mut result = Vec::new();
        for (id, r) in candidates {
            if r.lock().await.has_writer(writer) {
                result.push((id, r));
            }
        }
        result
    }

    async fn handle_reader_outcome(&self, reader: Guid, writer: Guid, outcome: ReaderOutcome) {
        if !outcome.unavailable.is_empty() {
            let mut reassembly = self.reassembly();
            for range in &outcome.unavailable {
                reassembly.data_unavailable(writer, *range);
            }
        }

        for completed in outcome.association_complete {
            self.data_sink.on_association_complete(reader, completed).await;
        }
        for sample in outcome.delivered {
            self.data_sink.on_sample(sample).await;
        }

        if outcome.acknack_needed {
            self.schedule_once(reader, TimerKind::AckNack, self.config.heartbeat_response_delay, move |link| async move {
                link.send_acknacks(reader).await;
            });
        }
    }

    pub async fn stats(&self) -> LinkStats {
        let mut result = *self.link_stats();

        let writers: Vec<_> = self.writers.read().await.values().cloned().collect();
        for w in writers {
            result.drops.accumulate(&w.lock().await.drops());
        }
        let readers: Vec<_> = self.readers.read().await.values().cloned().collect();
        for r in readers {
            result.drops.accumulate(&r.lock().await.drops());
        }
        result
    }
}

/// The socket-reading side of a link. It is owned by the receive loop and does not touch the
///  reliability state machines.
pub struct LinkReceiver {
    strategy: ReceiveStrategy<RtpsWireFormat>,
    receiver: RtpsReceiver,
    stats: Arc<Mutex<LinkStats>>,
}

impl LinkReceiver {
    /// Reads what is available and returns the complete sub-messages. An error means that the
    ///  receive buffers are corrupt, and the link can not continue.
    pub fn on_readable(&mut self, source: &mut impl ByteSource) -> anyhow::Result<Vec<InboundSubmessage>> {
        if self.strategy.on_bytes_available(source, &mut self.receiver)? == ReceiveStatus::Closed {
            // there is no connection for UDP, this is just an empty datagram
            trace!("empty datagram");
        }

        let relink_requested = self.receiver.take_relink_requested();
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.receive = self.strategy.stats();
            if relink_requested {
                stats.relink_requests += 1;
            }
        }
        if relink_requested {
            warn!("receive path requested a relink - UDP sockets are connectionless, continuing");
        }

        Ok(self.receiver.take_inbound())
    }
}

/// Reads datagrams from a UDP socket without blocking. A datagram is received as a whole and
///  then copied into the receive buffers, which need not be contiguous.
struct UdpByteSource {
    socket: Arc<UdpSocket>,
    scratch: Vec<u8>,
}

impl UdpByteSource {
    fn new(socket: Arc<UdpSocket>, max_datagram_size: usize) -> UdpByteSource {
        UdpByteSource {
            socket,
            scratch: vec![0; max_datagram_size],
        }
    }
}

impl ByteSource for UdpByteSource {
    fn receive_bytes(&mut self, buffers: &mut [IoSliceMut<'_>]) -> std::io::Result<(usize, SocketAddr)> {
        let (num_read, from) = self.socket.try_recv_from(&mut self.scratch)?;
        trace!("received datagram of {} bytes from {:?}", num_read, from);

        let mut offs = 0;
        for buf in buffers.iter_mut() {
            if offs == num_read {
                break;
            }
            let n = buf.len().min(num_read - offs);
            buf[..n].copy_from_slice(&self.scratch[offs..offs + n]);
            offs += n;
        }
        if offs < num_read {
            warn!("datagram from {:?} truncated from {} to {} bytes", from, num_read, offs);
        }
        Ok((offs, from))
    }
}
