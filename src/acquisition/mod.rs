//! Acquisition controller - byte stream to session
//!
//! Architecture:
//! - Decode task: reads the probe byte stream, runs the decoder and fans the
//!   resulting event batches out on one channel per consumer
//! - Session writer task: appends samples to the log and the folding buffer
//! - Trigger task (trigger mode only): feeds the trigger engine and records
//!   completed windows
//! - Observer tasks: any extra [`SampleConsumer`] registered with
//!   [`AcquisitionController::with_consumer`]
//!
//! Consumers drain their channel to the end, so every decoded sample is in
//! the session before it is closed. The session is closed on every exit
//! path, including a failed read or a consumer task that panicked.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::shutdown::{request_shutdown, ShutdownReceiver, ShutdownSender};
use crate::common::{AcquisitionCounters, CounterSnapshot};
use crate::config::Config;
use crate::decoder::{samples_of, Decoder, DecoderEvent};
use crate::session::{Session, SessionError};
use crate::storage::StorageError;
use crate::transport::{Capabilities, Transport, TransportError};
use crate::trigger::{TriggerEngine, TriggerWindow};

/// Bytes requested from the source per read
const READ_CHUNK: usize = 16 * 1024;

/// Transport shared between the controller and the trigger task
pub type SharedTransport = Arc<Mutex<Box<dyn Transport + Send>>>;

/// Acquisition errors
#[derive(thiserror::Error, Debug)]
pub enum AcquisitionError {
    #[error("Source read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Every sample consumer has gone away")]
    NoConsumers,

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Running,
    /// Source ended or stop requested, consumers finishing
    Draining,
    Stopped,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Running => write!(f, "Running"),
            AcquisitionState::Draining => write!(f, "Draining"),
            AcquisitionState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Decoder events of one source read
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// Session index of the first sample in `events`
    pub first_index: u64,
    pub events: Arc<[DecoderEvent]>,
}

impl EventBatch {
    /// Samples paired with their session index
    pub fn indexed_samples(&self) -> impl Iterator<Item = (u64, &crate::decoder::SampleEvent)> {
        self.events
            .iter()
            .filter_map(DecoderEvent::sample)
            .zip(self.first_index..)
            .map(|(sample, index)| (index, sample))
    }
}

/// Receiver of decoded event batches
pub trait SampleConsumer: Send + 'static {
    fn name(&self) -> &'static str;

    fn consume(&mut self, batch: &EventBatch);
}

impl SampleConsumer for Box<dyn SampleConsumer> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn consume(&mut self, batch: &EventBatch) {
        (**self).consume(batch)
    }
}

/// Writes every sample into the session
#[derive(Debug)]
pub struct SessionWriter {
    session: Session,
    storage_errors: Vec<StorageError>,
}

impl SessionWriter {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            storage_errors: Vec::new(),
        }
    }

    pub fn into_parts(self) -> (Session, Vec<StorageError>) {
        (self.session, self.storage_errors)
    }
}

impl SampleConsumer for SessionWriter {
    fn name(&self) -> &'static str {
        "session-writer"
    }

    fn consume(&mut self, batch: &EventBatch) {
        let samples = samples_of(&batch.events);
        if !samples.is_empty() {
            self.session.append_samples(&samples);
        }
        for err in self.session.take_errors() {
            error!(error = %err, "Session log reported a disk failure");
            self.storage_errors.push(err);
        }
    }
}

/// Runs the trigger engine over the sample stream
pub struct TriggerConsumer {
    engine: TriggerEngine,
    windows: Arc<Mutex<Vec<TriggerWindow>>>,
    transport: Option<SharedTransport>,
    stop_tx: ShutdownSender,
    stopped_transport: bool,
}

impl TriggerConsumer {
    pub fn new(
        engine: TriggerEngine,
        windows: Arc<Mutex<Vec<TriggerWindow>>>,
        transport: Option<SharedTransport>,
        stop_tx: ShutdownSender,
    ) -> Self {
        Self {
            engine,
            windows,
            transport,
            stop_tx,
            stopped_transport: false,
        }
    }

    /// Whether a single-shot hard trigger stopped the device
    pub fn stopped_transport(&self) -> bool {
        self.stopped_transport
    }
}

impl SampleConsumer for TriggerConsumer {
    fn name(&self) -> &'static str {
        "trigger"
    }

    fn consume(&mut self, batch: &EventBatch) {
        for (index, sample) in batch.indexed_samples() {
            let Some(completion) = self.engine.process(sample, index) else {
                continue;
            };
            self.windows.lock().push(completion.window);

            if completion.stop_transport && !self.stopped_transport {
                self.stopped_transport = true;
                if let Some(transport) = &self.transport {
                    if let Err(e) = transport.lock().stop() {
                        warn!(error = %e, "Failed to stop transport after single shot");
                    }
                }
                info!("Single-shot trigger complete, stopping acquisition");
                request_shutdown(&self.stop_tx, "single-shot trigger");
            }
        }
    }
}

fn spawn_consumer<C: SampleConsumer>(
    mut consumer: C,
    mut rx: mpsc::UnboundedReceiver<EventBatch>,
) -> JoinHandle<C> {
    tokio::spawn(async move {
        let mut batches = 0u64;
        while let Some(batch) = rx.recv().await {
            consumer.consume(&batch);
            batches += 1;
        }
        debug!(consumer = consumer.name(), batches, "Consumer drained");
        consumer
    })
}

/// Result of a finished acquisition
#[derive(Debug, Clone)]
pub struct AcquisitionSummary {
    pub sample_count: u64,
    pub windows: Vec<TriggerWindow>,
    pub storage_errors: usize,
    pub stopped_by_trigger: bool,
    pub counters: CounterSnapshot,
}

/// Top-level owner of one acquisition
pub struct AcquisitionController {
    config: Config,
    capabilities: Capabilities,
    counters: Arc<AcquisitionCounters>,
    windows: Arc<Mutex<Vec<TriggerWindow>>>,
    transport: Option<SharedTransport>,
    observers: Vec<Box<dyn SampleConsumer>>,
    state_tx: watch::Sender<AcquisitionState>,
}

impl AcquisitionController {
    pub fn new(config: Config, capabilities: Capabilities, counters: Arc<AcquisitionCounters>) -> Self {
        let (state_tx, _) = watch::channel(AcquisitionState::Idle);
        Self {
            config,
            capabilities,
            counters,
            windows: Arc::new(Mutex::new(Vec::new())),
            transport: None,
            observers: Vec::new(),
            state_tx,
        }
    }

    /// Control a device through `transport`; its capabilities replace the given ones
    pub fn with_transport(mut self, transport: Box<dyn Transport + Send>) -> Self {
        self.capabilities = transport.capabilities();
        self.transport = Some(Arc::new(Mutex::new(transport)));
        self
    }

    /// Feed every event batch to `consumer` as well
    pub fn with_consumer<C: SampleConsumer>(mut self, consumer: C) -> Self {
        self.observers.push(Box::new(consumer));
        self
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state_tx.subscribe()
    }

    pub fn counters(&self) -> &Arc<AcquisitionCounters> {
        &self.counters
    }

    /// Windows completed so far, shared with the trigger task
    pub fn trigger_windows(&self) -> Arc<Mutex<Vec<TriggerWindow>>> {
        self.windows.clone()
    }

    /// Acquire from `source` into `session` until the source ends or shutdown
    ///
    /// `shutdown` is also used by the trigger task to end a single-shot run.
    pub async fn run<R>(
        mut self,
        source: R,
        decoder: Decoder,
        session: Session,
        shutdown: ShutdownSender,
    ) -> Result<AcquisitionSummary, AcquisitionError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if let Some(transport) = &self.transport {
            transport.lock().start()?;
        }
        self.state_tx.send_replace(AcquisitionState::Running);
        info!(
            variant = %decoder.variant(),
            trigger = self.config.trigger.enabled,
            dir = %session.dir().display(),
            "Acquisition started"
        );

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_handle = spawn_consumer(SessionWriter::new(session), writer_rx);
        let mut outputs = vec![writer_tx];

        let trigger_handle = if self.config.trigger.enabled {
            let engine = TriggerEngine::new(
                &self.config.trigger,
                self.config.sampling_period_us(),
                &self.capabilities,
            );
            let consumer = TriggerConsumer::new(
                engine,
                self.windows.clone(),
                self.transport.clone(),
                shutdown.clone(),
            );
            let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
            outputs.push(trigger_tx);
            Some(spawn_consumer(consumer, trigger_rx))
        } else {
            None
        };

        let mut observer_handles = Vec::with_capacity(self.observers.len());
        for observer in self.observers.drain(..) {
            let (tx, rx) = mpsc::unbounded_channel();
            outputs.push(tx);
            observer_handles.push(spawn_consumer(observer, rx));
        }

        let decode_handle = tokio::spawn(decode_loop(
            source,
            decoder,
            outputs,
            self.counters.clone(),
            shutdown.subscribe(),
        ));

        let decoded = decode_handle.await;
        self.state_tx.send_replace(AcquisitionState::Draining);

        // join everything before propagating, the session must be closed first
        let writer = writer_handle.await;
        let trigger = match trigger_handle {
            Some(handle) => Some(handle.await),
            None => None,
        };
        let mut observers_failed = None;
        for handle in observer_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Observer task failed");
                observers_failed.get_or_insert(e);
            }
        }

        let stopped_by_trigger = match &trigger {
            Some(Ok(consumer)) => consumer.stopped_transport(),
            Some(Err(e)) => {
                error!(error = %e, "Trigger task failed");
                false
            }
            None => false,
        };
        if let Some(transport) = &self.transport {
            if !stopped_by_trigger {
                if let Err(e) = transport.lock().stop() {
                    warn!(error = %e, "Failed to stop transport");
                }
            }
        }

        let (closed, sample_count, storage_errors) = match writer {
            Ok(writer) => {
                let (session, storage_errors) = writer.into_parts();
                let sample_count = session.sample_count();
                (Ok(session.close().await), sample_count, storage_errors)
            }
            // the session went down with the task; its log queued the unflushed tail on drop
            Err(e) => {
                error!(error = %e, "Session writer task failed");
                (Err(e), 0, Vec::new())
            }
        };
        self.state_tx.send_replace(AcquisitionState::Stopped);

        decoded??;
        closed??;
        if let Some(Err(e)) = trigger {
            return Err(e.into());
        }
        if let Some(e) = observers_failed {
            return Err(e.into());
        }

        let summary = AcquisitionSummary {
            sample_count,
            windows: self.windows.lock().clone(),
            storage_errors: storage_errors.len(),
            stopped_by_trigger,
            counters: self.counters.snapshot(),
        };
        info!(
            samples = summary.sample_count,
            lost = summary.counters.samples_lost,
            placeholders = summary.counters.placeholder_samples,
            windows = summary.windows.len(),
            storage_errors = summary.storage_errors,
            "Acquisition stopped"
        );
        Ok(summary)
    }
}

/// Decode task: source bytes to event batches
async fn decode_loop<R: AsyncRead + Unpin>(
    mut source: R,
    mut decoder: Decoder,
    outputs: Vec<mpsc::UnboundedSender<EventBatch>>,
    counters: Arc<AcquisitionCounters>,
    mut shutdown: ShutdownReceiver,
) -> Result<(), AcquisitionError> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut dispatcher = Dispatcher {
        outputs,
        counters,
        next_index: 0,
        replayed: 0,
    };

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("Decode loop received shutdown signal");
                break;
            }

            read = source.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        info!("Source ended");
                        break;
                    }
                    Ok(n) => {
                        let events = decoder.decode(&buf[..n]);
                        dispatcher.dispatch(events, decoder.total_replayed())?;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(error = %e, "Source read failed");
                        let tail = decoder.finish();
                        dispatcher.dispatch(tail, decoder.total_replayed())?;
                        return Err(e.into());
                    }
                }
            }
        }
    }

    let tail = decoder.finish();
    dispatcher.dispatch(tail, decoder.total_replayed())?;
    debug!(samples = dispatcher.next_index, "Decode loop stopped");
    Ok(())
}

struct Dispatcher {
    outputs: Vec<mpsc::UnboundedSender<EventBatch>>,
    counters: Arc<AcquisitionCounters>,
    next_index: u64,
    replayed: u64,
}

impl Dispatcher {
    fn dispatch(&mut self, events: Vec<DecoderEvent>, replayed: u64) -> Result<(), AcquisitionError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut samples = 0u64;
        let mut placeholders = 0u64;
        for event in &events {
            match event {
                DecoderEvent::Sample(sample) => {
                    samples += 1;
                    if sample.is_placeholder() {
                        placeholders += 1;
                    }
                }
                DecoderEvent::DataLoss { missing, .. } => self.counters.add_lost(*missing),
                DecoderEvent::Resync { timestamp_us } => {
                    debug!(timestamp_us, "Probe time base resynchronized");
                }
            }
        }
        self.counters.add_samples(samples);
        self.counters.add_placeholders(placeholders);
        self.counters.add_replayed(replayed - self.replayed);
        self.replayed = replayed;

        let batch = EventBatch {
            first_index: self.next_index,
            events: events.into(),
        };
        self.next_index += samples;

        let mut delivered = 0;
        for output in &self.outputs {
            if output.send(batch.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(AcquisitionError::NoConsumers);
        }
        Ok(())
    }
}
