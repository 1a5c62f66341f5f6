//! Receiver controller
//!
//! One task owns the mode, the tuning and every worker that uses the receiver
//! (monitor, search, digital receiver, audio pass-through). Commands from any
//! [`ReceiverController`] clone and exit events from workers are serialized
//! through it, so two activities never race for the device.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigSource};
use crate::dab::{lookup_channel, DabService, DabStatus, MuxClient};
use crate::decoder::{ListenReport, ListenSession, SessionEnd};
use crate::device::{DeviceLock, DeviceOwner, DeviceStats, Gain, ReceiverMode, StatsSnapshot, Tuning};
use crate::error::{ReceiverError, Result};
use crate::process::{spawn_with_retry, CommandProvider, ReadOutcome, SpawnOptions};
use crate::search::{run_search, SearchContext, SearchOutcome, SearchProgress, SearchSession, SearchStatus};
use crate::sink::SinkDispatcher;
use crate::tools::{audio_pipeline, digital_pipeline};

const COMMAND_QUEUE: usize = 32;

/// Seek step in MHz
const SEEK_STEP_MHZ: f64 = 0.1;

/// Mode the receiver is in, or is switching to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "mode", rename_all = "snake_case")]
pub enum ModeState {
    Active(ReceiverMode),
    /// A switch to this mode has not completed
    Pending(ReceiverMode),
}

impl ModeState {
    pub fn target(self) -> ReceiverMode {
        match self {
            Self::Active(mode) | Self::Pending(mode) => mode,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Read-only snapshot of the receiver
#[derive(Debug, Clone, Serialize)]
pub struct ReceiverStatus {
    pub mode: ModeState,
    pub tuning: Tuning,
    /// The FM monitor or the digital receiver is running
    pub running: bool,
    pub searching: bool,
    pub audio_active: bool,
    pub digital: Option<DabStatus>,
    pub device_holder: Option<DeviceOwner>,
    pub search: SearchSession,
    pub stats: StatsSnapshot,
    pub last_error: Option<String>,
}

/// Part of the status owned by the controller task
#[derive(Debug, Clone)]
struct CoreStatus {
    mode: ModeState,
    tuning: Tuning,
    running: bool,
    audio_active: bool,
    digital: Option<DabStatus>,
    last_error: Option<String>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Start(Reply<()>),
    Tune {
        frequency_mhz: f64,
        gain: Option<Gain>,
        reply: Reply<Tuning>,
    },
    SeekNext(Reply<Tuning>),
    ToggleSearch(Reply<SearchStatus>),
    SwitchMode {
        mode: ReceiverMode,
        reply: Reply<()>,
    },
    TuneDigital {
        channel: String,
        reply: Reply<DabStatus>,
    },
    TuneService {
        sid: String,
        reply: Reply<DabStatus>,
    },
    StartAudio(Reply<AudioStream>),
    StopAudio(Reply<()>),
    /// The consumer dropped an audio stream
    AudioClosed {
        generation: u64,
    },
    Stop(Reply<()>),
    Shutdown(Reply<()>),
}

enum WorkerEvent {
    MonitorExited { generation: u64, report: ListenReport },
    DigitalExited { generation: u64 },
    DigitalServices { generation: u64, services: Vec<DabService> },
    SearchFinished { generation: u64 },
}

/// Live MP3 bytes from the audio pass-through. Dropping the stream hands the
/// receiver back to the monitor.
pub struct AudioStream {
    inner: ReceiverStream<Vec<u8>>,
    generation: u64,
    closer: mpsc::WeakSender<Command>,
}

impl Stream for AudioStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        if let Some(commands) = self.closer.upgrade() {
            let _ = commands.try_send(Command::AudioClosed {
                generation: self.generation,
            });
        }
    }
}

/// Handle on a receiver controller task. Clones address the same task.
#[derive(Clone)]
pub struct ReceiverController {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<CoreStatus>,
    progress: SearchProgress,
    lock: DeviceLock,
    stats: Arc<DeviceStats>,
}

impl ReceiverController {
    /// Start a controller task. Nothing touches the receiver until [`start`](Self::start).
    pub fn spawn(
        config_source: Arc<dyn ConfigSource>,
        provider: Arc<dyn CommandProvider>,
        sink: SinkDispatcher,
    ) -> Self {
        let config = config_source.load();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tuning = Tuning::new(config.start_frequency_mhz, config.default_gain);
        let (status_tx, status_rx) = watch::channel(CoreStatus {
            mode: ModeState::Active(config.start_mode),
            tuning,
            running: false,
            audio_active: false,
            digital: None,
            last_error: None,
        });

        let lock = DeviceLock::new();
        let stats = Arc::new(DeviceStats::new());
        let progress = SearchProgress::new();

        let coordinator = Coordinator {
            config_source,
            provider,
            sink,
            lock: lock.clone(),
            stats: stats.clone(),
            progress: progress.clone(),
            status_tx,
            events: events_tx,
            commands: commands_tx.downgrade(),
            mode: ModeState::Active(config.start_mode),
            tuning,
            dab_channel: config.dab_channel.clone(),
            dab: None,
            dab_api: None,
            next_generation: 0,
            monitor: None,
            search: None,
            digital: None,
            audio: None,
            last_error: None,
        };
        tokio::spawn(coordinator.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            status: status_rx,
            progress,
            lock,
            stats,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ReceiverError::ControllerClosed)?;
        rx.await.map_err(|_| ReceiverError::ControllerClosed)?
    }

    /// Start receiving in the current mode
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    /// Retune the FM monitor; aborts a running search and the audio pass-through
    pub async fn tune(&self, frequency_mhz: f64, gain: Option<Gain>) -> Result<Tuning> {
        self.request(|reply| Command::Tune {
            frequency_mhz,
            gain,
            reply,
        })
        .await
    }

    /// Step up 0.1 MHz, wrapping at the band end
    pub async fn seek_next(&self) -> Result<Tuning> {
        self.request(Command::SeekNext).await
    }

    /// Start a band search, or abort the running one
    pub async fn toggle_search(&self) -> Result<SearchStatus> {
        self.request(Command::ToggleSearch).await
    }

    pub async fn switch_mode(&self, mode: ReceiverMode) -> Result<()> {
        self.request(|reply| Command::SwitchMode { mode, reply }).await
    }

    pub async fn tune_digital(&self, channel: &str) -> Result<DabStatus> {
        let channel = channel.to_string();
        self.request(|reply| Command::TuneDigital { channel, reply })
            .await
    }

    /// Select a service of the received ensemble for the digital audio stream
    pub async fn tune_service(&self, sid: &str) -> Result<DabStatus> {
        let sid = sid.to_string();
        self.request(|reply| Command::TuneService { sid, reply }).await
    }

    pub async fn start_audio(&self) -> Result<AudioStream> {
        self.request(Command::StartAudio).await
    }

    pub async fn stop_audio(&self) -> Result<()> {
        self.request(Command::StopAudio).await
    }

    /// Stop every activity. Afterwards nothing holds the receiver.
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    /// Stop everything and end the controller task
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(Command::Shutdown).await {
            Err(ReceiverError::ControllerClosed) => Ok(()),
            other => other,
        }
    }

    pub fn status(&self) -> ReceiverStatus {
        let core = self.status.borrow().clone();
        let search = self.progress.snapshot();
        ReceiverStatus {
            mode: core.mode,
            tuning: core.tuning,
            running: core.running,
            searching: search.status.is_active(),
            audio_active: core.audio_active,
            digital: core.digital,
            device_holder: self.lock.holder(),
            search,
            stats: self.stats.snapshot(),
            last_error: core.last_error,
        }
    }
}

struct Worker<T> {
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<T>,
}

impl<T> Worker<T> {
    /// Cancel and wait for the task; abort it if it does not finish in time
    async fn stop(mut self, limit: Duration) -> Option<T> {
        self.cancel.cancel();
        match tokio::time::timeout(limit, &mut self.join).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("[Controller] Worker task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("[Controller] Worker did not stop within {:?}, aborting", limit);
                self.join.abort();
                let _ = (&mut self.join).await;
                None
            }
        }
    }
}

struct SearchWorker {
    worker: Worker<SearchOutcome>,
    origin: Tuning,
}

struct Coordinator {
    config_source: Arc<dyn ConfigSource>,
    provider: Arc<dyn CommandProvider>,
    sink: SinkDispatcher,
    lock: DeviceLock,
    stats: Arc<DeviceStats>,
    progress: SearchProgress,
    status_tx: watch::Sender<CoreStatus>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    commands: mpsc::WeakSender<Command>,

    mode: ModeState,
    tuning: Tuning,
    dab_channel: String,
    dab: Option<DabStatus>,
    dab_api: Option<MuxClient>,
    next_generation: u64,

    monitor: Option<Worker<ListenReport>>,
    search: Option<SearchWorker>,
    digital: Option<Worker<()>>,
    audio: Option<Worker<()>>,

    last_error: Option<String>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        info!(
            "[Controller] Ready: {} mode, {:.1} MHz",
            self.mode.target(),
            self.tuning.frequency_mhz
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop_all().await;
                        self.publish();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop_all().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event).await,
            }
            self.publish();
        }

        info!("[Controller] Stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Tune {
                frequency_mhz,
                gain,
                reply,
            } => {
                let result = self.tune(frequency_mhz, gain).await;
                let _ = reply.send(result);
            }
            Command::SeekNext(reply) => {
                let result = self.seek_next().await;
                let _ = reply.send(result);
            }
            Command::ToggleSearch(reply) => {
                let result = self.toggle_search().await;
                let _ = reply.send(result);
            }
            Command::SwitchMode { mode, reply } => {
                let result = self.switch_mode(mode).await;
                let _ = reply.send(result);
            }
            Command::TuneDigital { channel, reply } => {
                let result = self.tune_digital(&channel).await;
                let _ = reply.send(result);
            }
            Command::TuneService { sid, reply } => {
                let result = self.tune_service(&sid).await;
                let _ = reply.send(result);
            }
            Command::StartAudio(reply) => {
                let result = self.start_audio().await;
                let _ = reply.send(result);
            }
            Command::StopAudio(reply) => {
                if self.audio.is_some() {
                    self.finish_audio().await;
                }
                let _ = reply.send(Ok(()));
            }
            Command::AudioClosed { generation } => {
                if self.audio.as_ref().is_some_and(|w| w.generation == generation) {
                    debug!("[Audio] Consumer went away");
                    self.finish_audio().await;
                }
            }
            Command::Stop(reply) => {
                self.stop_all().await;
                info!("[Controller] All activity stopped");
                let _ = reply.send(Ok(()));
            }
            // Handled by the run loop
            Command::Shutdown(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::MonitorExited { generation, report } => {
                if self.monitor.as_ref().is_some_and(|w| w.generation == generation) {
                    self.monitor = None;
                    if report.end == SessionEnd::EndOfStream {
                        self.last_error = Some(format!(
                            "decoder pipeline exited on {:.1} MHz",
                            report.frequency_mhz
                        ));
                    }
                }
            }
            WorkerEvent::DigitalExited { generation } => {
                if self.digital.as_ref().is_some_and(|w| w.generation == generation) {
                    self.digital = None;
                    self.dab = None;
                    self.dab_api = None;
                    self.last_error = Some("welle-cli exited".to_string());
                }
            }
            WorkerEvent::DigitalServices { generation, services } => {
                if !self.digital.as_ref().is_some_and(|w| w.generation == generation) {
                    return;
                }
                if let Some(dab) = self.dab.as_mut() {
                    if dab.services != services {
                        info!("[DAB] {} services on {}", services.len(), dab.channel);
                        dab.services = services;
                    }
                }
            }
            WorkerEvent::SearchFinished { generation } => {
                if self
                    .search
                    .as_ref()
                    .is_some_and(|s| s.worker.generation == generation)
                {
                    let config = self.config();
                    if let Some(resume) = self.stop_search(config.stop_timeout).await {
                        self.resume_monitor(resume).await;
                    }
                }
            }
        }
    }

    fn config(&self) -> Config {
        self.config_source.load()
    }

    fn publish(&self) {
        self.status_tx.send_replace(CoreStatus {
            mode: self.mode,
            tuning: self.tuning,
            running: self.monitor.is_some() || self.digital.is_some(),
            audio_active: self.audio.is_some(),
            digital: self.dab.clone(),
            last_error: self.last_error.clone(),
        });
    }

    fn fail(&mut self, error: ReceiverError) -> ReceiverError {
        warn!("[Controller] {}", error);
        self.last_error = Some(error.to_string());
        error
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn require_mode(&self, mode: ReceiverMode, operation: &'static str) -> Result<()> {
        let current = self.mode.target();
        if current != mode {
            return Err(ReceiverError::WrongMode {
                operation,
                mode: current,
            });
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.monitor.is_some() || self.search.is_some() || self.digital.is_some() || self.audio.is_some()
    }

    async fn start(&mut self) -> Result<()> {
        if self.is_busy() {
            return Ok(());
        }
        let config = self.config();
        let mode = self.mode.target();
        let result = match mode {
            ReceiverMode::Fm => self.start_monitor(&config).await,
            ReceiverMode::DigitalBroadcast => self.start_digital(&config).await.map(|_| ()),
        };
        match result {
            Ok(()) => {
                self.mode = ModeState::Active(mode);
                self.last_error = None;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn tune(&mut self, frequency_mhz: f64, gain: Option<Gain>) -> Result<Tuning> {
        self.require_mode(ReceiverMode::Fm, "tune")?;
        let config = self.config();
        let in_band = frequency_mhz >= config.band_start_mhz - 1e-6
            && frequency_mhz <= config.band_end_mhz + 1e-6;
        if !frequency_mhz.is_finite() || !in_band {
            return Err(ReceiverError::InvalidFrequency(frequency_mhz));
        }

        self.stop_search(config.stop_timeout).await;
        self.stop_audio(config.stop_timeout).await;
        self.stop_monitor(config.stop_timeout).await;

        self.tuning = Tuning::new(frequency_mhz, gain.unwrap_or(self.tuning.gain));
        info!("[Controller] Tuning to {:.1} MHz", frequency_mhz);
        self.publish();
        tokio::time::sleep(config.tune_settle).await;

        match self.start_monitor(&config).await {
            Ok(()) => {
                self.mode = ModeState::Active(ReceiverMode::Fm);
                self.last_error = None;
                Ok(self.tuning)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn seek_next(&mut self) -> Result<Tuning> {
        let config = self.config();
        let stepped = ((self.tuning.frequency_mhz + SEEK_STEP_MHZ) * 10.0).round() / 10.0;
        let next = if stepped > config.band_end_mhz + 1e-6 {
            config.band_start_mhz
        } else {
            stepped
        };
        self.tune(next, None).await
    }

    async fn toggle_search(&mut self) -> Result<SearchStatus> {
        let config = self.config();

        if self.search.is_some() {
            info!("[Controller] Stopping search");
            if let Some(resume) = self.stop_search(config.stop_timeout).await {
                self.resume_monitor(resume).await;
            }
            return Ok(self.progress.status());
        }

        self.require_mode(ReceiverMode::Fm, "search")?;
        let origin = self.tuning;
        self.stop_audio(config.stop_timeout).await;
        self.stop_monitor(config.stop_timeout).await;
        tokio::time::sleep(config.tune_settle).await;

        let token = match self.lock.acquire(DeviceOwner::Search) {
            Ok(token) => token,
            Err(e) => {
                let e = self.fail(e);
                self.resume_monitor(origin).await;
                return Err(e);
            }
        };

        self.progress.begin();
        let generation = self.generation();
        let cancel = CancellationToken::new();
        let ctx = SearchContext {
            provider: self.provider.clone(),
            config,
            sink: self.sink.clone(),
            stats: self.stats.clone(),
            progress: self.progress.clone(),
        };
        let events = self.events.clone();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = run_search(ctx, token, origin, task_cancel).await;
            let _ = events.send(WorkerEvent::SearchFinished { generation });
            outcome
        });

        self.search = Some(SearchWorker {
            worker: Worker {
                generation,
                cancel,
                join,
            },
            origin,
        });
        Ok(SearchStatus::Sweeping)
    }

    async fn switch_mode(&mut self, target: ReceiverMode) -> Result<()> {
        if self.mode == ModeState::Active(target) && self.is_busy() {
            return Ok(());
        }
        let config = self.config();
        info!("===========================================");
        info!("  Switching {} -> {}", self.mode.target(), target);
        info!("===========================================");

        self.mode = ModeState::Pending(target);
        self.publish();

        self.stop_all().await;

        self.provider
            .force_release(&config.receiver_tool_names())
            .await;
        self.lock.force_release();

        let settle = target.settle_delay(&config);
        debug!("[Controller] Settling {:?} before {}", settle, target);
        tokio::time::sleep(settle).await;

        let result = match target {
            ReceiverMode::Fm => self.start_monitor(&config).await,
            ReceiverMode::DigitalBroadcast => self.start_digital(&config).await.map(|_| ()),
        };
        match result {
            Ok(()) => {
                self.mode = ModeState::Active(target);
                self.last_error = None;
                info!("[Controller] {} mode active", target);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn tune_digital(&mut self, channel: &str) -> Result<DabStatus> {
        self.require_mode(ReceiverMode::DigitalBroadcast, "tune_digital")?;
        let (channel, _) = lookup_channel(channel)?;
        let config = self.config();

        self.stop_digital(config.stop_timeout).await;
        self.dab_channel = channel.to_string();
        self.publish();
        tokio::time::sleep(config.digital_settle).await;

        match self.start_digital(&config).await {
            Ok(status) => {
                self.mode = ModeState::Active(ReceiverMode::DigitalBroadcast);
                self.last_error = None;
                Ok(status)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn tune_service(&mut self, sid: &str) -> Result<DabStatus> {
        self.require_mode(ReceiverMode::DigitalBroadcast, "tune_service")?;
        let (Some(dab), Some(api)) = (self.dab.as_ref(), self.dab_api.clone()) else {
            return Err(ReceiverError::DigitalNotRunning);
        };

        // An empty list only means welle-cli has not reported yet
        let known = dab.find_service(sid).cloned();
        if known.is_none() && !dab.services.is_empty() {
            return Err(ReceiverError::UnknownService(sid.trim().to_string()));
        }
        let sid = known
            .as_ref()
            .map_or_else(|| sid.trim().to_string(), |s| s.sid.clone());

        if let Err(e) = api.select_service(&sid).await {
            return Err(self.fail(e));
        }
        let audio_url = known
            .and_then(|s| s.audio_path)
            .map(|path| format!("{}{}", api.base_url(), path));

        let Some(dab) = self.dab.as_mut() else {
            return Err(ReceiverError::DigitalNotRunning);
        };
        info!("[DAB] Service {} selected on {}", sid, dab.channel);
        dab.service = Some(sid);
        if let Some(url) = audio_url {
            dab.audio_url = url;
        }
        Ok(dab.clone())
    }

    async fn start_audio(&mut self) -> Result<AudioStream> {
        self.require_mode(ReceiverMode::Fm, "audio")?;
        let config = self.config();

        self.stop_search(config.stop_timeout).await;
        self.stop_audio(config.stop_timeout).await;
        self.stop_monitor(config.stop_timeout).await;
        tokio::time::sleep(config.tune_settle).await;

        match self.spawn_audio(&config).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                let e = self.fail(e);
                self.resume_monitor(self.tuning).await;
                Err(e)
            }
        }
    }

    async fn spawn_audio(&mut self, config: &Config) -> Result<AudioStream> {
        let token = self.lock.acquire(DeviceOwner::AudioPassthrough)?;
        let spec = audio_pipeline(config, &self.tuning);
        let cancel = CancellationToken::new();
        let mut handle = spawn_with_retry(
            self.provider.as_ref(),
            &spec,
            &SpawnOptions::chunks(config.startup_probe),
            config.spawn_attempts,
            config.spawn_backoff,
            &self.stats,
            &cancel,
        )
        .await?;

        let Some(output) = handle.take_output() else {
            return Err(ReceiverError::Spawn {
                command: spec.to_string(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "audio output unavailable"),
            });
        };

        let generation = self.generation();
        let task_cancel = cancel.clone();
        let (grace, kill_deadline) = (config.termination_grace, config.kill_deadline);
        let join = tokio::spawn(async move {
            task_cancel.cancelled().await;
            handle.terminate(grace, kill_deadline).await;
            drop(token);
        });

        info!("[Audio] Streaming {:.1} MHz", self.tuning.frequency_mhz);
        self.audio = Some(Worker {
            generation,
            cancel,
            join,
        });

        Ok(AudioStream {
            inner: output,
            generation,
            closer: self.commands.clone(),
        })
    }

    async fn finish_audio(&mut self) {
        let config = self.config();
        self.stop_audio(config.stop_timeout).await;
        info!("[Audio] Stopped, returning receiver to the monitor");
        self.resume_monitor(self.tuning).await;
    }

    async fn start_monitor(&mut self, config: &Config) -> Result<()> {
        if self.monitor.is_some() {
            return Ok(());
        }
        let token = self.lock.acquire(DeviceOwner::Monitor)?;
        let cancel = CancellationToken::new();
        let session = ListenSession::open(
            self.provider.as_ref(),
            config,
            self.tuning,
            self.sink.clone(),
            self.stats.clone(),
            &cancel,
        )
        .await?;

        let generation = self.generation();
        debug!(
            "[Controller] Monitor #{} on {:.1} MHz (pgid {:?})",
            generation,
            session.tuning().frequency_mhz,
            session.process_group()
        );
        let task_cancel = cancel.clone();
        let events = self.events.clone();
        let join = tokio::spawn(async move {
            let report = session.run_continuous(&task_cancel).await;
            drop(token);
            let _ = events.send(WorkerEvent::MonitorExited { generation, report });
            report
        });

        self.monitor = Some(Worker {
            generation,
            cancel,
            join,
        });
        Ok(())
    }

    async fn start_digital(&mut self, config: &Config) -> Result<DabStatus> {
        if self.digital.is_some() {
            if let Some(status) = &self.dab {
                return Ok(status.clone());
            }
        }

        let status = DabStatus::new(&self.dab_channel, &config.dab_web_host, config.dab_web_port)?;
        let api = MuxClient::new(&config.dab_web_host, config.dab_web_port, config.dab_api_timeout)?;
        let token = self.lock.acquire(DeviceOwner::Digital)?;
        let cancel = CancellationToken::new();
        let mut handle = spawn_with_retry(
            self.provider.as_ref(),
            &digital_pipeline(config, &status.channel),
            &SpawnOptions::lines(config.startup_probe),
            config.spawn_attempts,
            config.spawn_backoff,
            &self.stats,
            &cancel,
        )
        .await?;

        info!(
            "[DAB] Channel {} ({:.3} MHz), audio at {}",
            status.channel,
            status.frequency_khz as f64 / 1000.0,
            status.audio_url
        );

        let generation = self.generation();
        let task_cancel = cancel.clone();
        let events = self.events.clone();
        let poll = config.poll_interval;
        let mut services_tick = tokio::time::interval(config.dab_poll_interval);
        services_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let worker_api = api.clone();
        let (grace, kill_deadline) = (config.termination_grace, config.kill_deadline);
        let join = tokio::spawn(async move {
            let mut exited = false;
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = services_tick.tick() => {
                        let fetched = tokio::select! {
                            biased;
                            _ = task_cancel.cancelled() => break,
                            fetched = worker_api.services() => fetched,
                        };
                        match fetched {
                            Ok(services) => {
                                let _ = events.send(WorkerEvent::DigitalServices { generation, services });
                            }
                            // welle-cli needs a moment before its web server answers
                            Err(e) => debug!("[DAB] {}", e),
                        }
                    }
                    read = handle.read_line(poll) => match read {
                        ReadOutcome::Item(line) => debug!("[welle-cli] {}", line),
                        ReadOutcome::Timeout => {}
                        ReadOutcome::EndOfStream => {
                            warn!("[DAB] welle-cli exited");
                            exited = true;
                            break;
                        }
                    },
                }
            }
            handle.terminate(grace, kill_deadline).await;
            drop(token);
            if exited {
                let _ = events.send(WorkerEvent::DigitalExited { generation });
            }
        });

        self.digital = Some(Worker {
            generation,
            cancel,
            join,
        });
        self.dab = Some(status.clone());
        self.dab_api = Some(api);
        Ok(status)
    }

    /// Resume the FM monitor on `tuning` after the tune settle delay
    async fn resume_monitor(&mut self, tuning: Tuning) {
        self.tuning = tuning;
        if self.mode != ModeState::Active(ReceiverMode::Fm) {
            return;
        }
        let config = self.config();
        tokio::time::sleep(config.tune_settle).await;
        if let Err(e) = self.start_monitor(&config).await {
            self.fail(e);
        }
    }

    async fn stop_monitor(&mut self, limit: Duration) {
        if let Some(worker) = self.monitor.take() {
            worker.stop(limit).await;
        }
    }

    async fn stop_digital(&mut self, limit: Duration) {
        if let Some(worker) = self.digital.take() {
            worker.stop(limit).await;
        }
        self.dab = None;
        self.dab_api = None;
    }

    async fn stop_audio(&mut self, limit: Duration) {
        if let Some(worker) = self.audio.take() {
            worker.stop(limit).await;
        }
    }

    /// Stop the search and return where the monitor should resume
    async fn stop_search(&mut self, limit: Duration) -> Option<Tuning> {
        let search = self.search.take()?;
        match search.worker.stop(limit).await {
            Some(outcome) => Some(outcome.resume),
            None => {
                self.progress.finish(SearchStatus::Aborted, "Search aborted");
                Some(search.origin)
            }
        }
    }

    async fn stop_all(&mut self) {
        let limit = self.config().stop_timeout;
        self.stop_search(limit).await;
        self.stop_audio(limit).await;
        self.stop_monitor(limit).await;
        self.stop_digital(limit).await;
    }
}
