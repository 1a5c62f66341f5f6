//! Supervised process pipeline
//!
//! Every stage of a [`PipelineSpec`] is spawned into one new process group so
//! that a tuner feeding a decoder (and anything they fork) is stopped as a unit.
//! A reader task drains the last stage's stdout into a bounded queue; one
//! diagnostic task per stage logs stderr and watches it for busy-device markers.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use super::pipeline::PipelineSpec;
use crate::error::{ReceiverError, Result};

/// Early stderr text meaning another process still holds the dongle
const BUSY_MARKERS: &[&str] = &[
    "usb_claim_interface error",
    "Device or resource busy",
    "Failed to open rtlsdr device",
    "LIBUSB_ERROR_BUSY",
];

const CHUNK_SIZE: usize = 4096;
const TASK_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Return the busy-device marker contained in a diagnostic line
pub fn busy_marker(line: &str) -> Option<&'static str> {
    BUSY_MARKERS.iter().copied().find(|m| line.contains(m))
}

/// How the last stage's stdout is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Newline-delimited text (decoders, sweeps)
    Lines,
    /// Raw byte chunks (encoded audio)
    Chunks,
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub output: OutputMode,
    pub startup_probe: Duration,
    pub queue_capacity: usize,
}

impl SpawnOptions {
    pub fn lines(startup_probe: Duration) -> Self {
        Self {
            output: OutputMode::Lines,
            startup_probe,
            queue_capacity: 256,
        }
    }

    pub fn chunks(startup_probe: Duration) -> Self {
        Self {
            output: OutputMode::Chunks,
            startup_probe,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Result of a bounded read
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    Item(T),
    Timeout,
    EndOfStream,
}

/// How [`ProcessHandle::terminate`] finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    /// Exited on SIGTERM within the grace period
    Graceful,
    /// Needed SIGKILL
    Forced,
    /// Group members may still be alive (logged)
    Unverified,
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// One running pipeline, owned by whoever started it
pub struct ProcessHandle {
    label: String,
    group: Option<i32>,
    children: Vec<Child>,
    output: Option<mpsc::Receiver<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
    state: ProcessState,
}

impl ProcessHandle {
    /// Spawn the pipeline and run the startup probe.
    ///
    /// Fails with `Spawn` if any stage cannot be launched and with `DeviceBusy`
    /// if a stage reports a busy-device marker within the probe window.
    pub async fn start(spec: &PipelineSpec, options: &SpawnOptions) -> Result<Self> {
        let label = spec.to_string();
        if spec.stages().is_empty() {
            return Err(ReceiverError::Spawn {
                command: label,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty pipeline"),
            });
        }

        info!("[Process] Starting: {}", label);

        // Dropping a partially built handle kills whatever was already spawned
        let mut handle = Self {
            label: label.clone(),
            group: None,
            children: Vec::with_capacity(spec.stages().len()),
            output: None,
            tasks: Vec::new(),
            state: ProcessState::Starting,
        };

        let (busy_tx, mut busy_rx) = mpsc::channel::<String>(1);
        let mut upstream: Option<ChildStdout> = None;

        for stage in spec.stages() {
            let mut cmd = Command::new(&stage.program);
            cmd.args(&stage.args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            // First stage leads a new group, the rest join it
            #[cfg(unix)]
            cmd.process_group(handle.group.unwrap_or(0));

            match upstream.take() {
                Some(stdout) => {
                    let stdin: Stdio = stdout.try_into().map_err(|source| ReceiverError::Spawn {
                        command: stage.to_string(),
                        source,
                    })?;
                    cmd.stdin(stdin);
                }
                None => {
                    cmd.stdin(Stdio::null());
                }
            }

            let mut child = cmd.spawn().map_err(|source| ReceiverError::Spawn {
                command: stage.to_string(),
                source,
            })?;

            if handle.group.is_none() {
                handle.group = child.id().map(|pid| pid as i32);
            }

            if let Some(stderr) = child.stderr.take() {
                handle.tasks.push(tokio::spawn(watch_diagnostics(
                    stage.name().to_string(),
                    stderr,
                    busy_tx.clone(),
                )));
            }

            upstream = child.stdout.take();
            handle.children.push(child);
        }
        drop(busy_tx);

        let stdout = upstream.ok_or_else(|| ReceiverError::Spawn {
            command: label.clone(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "last stage has no stdout"),
        })?;

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        handle
            .tasks
            .push(tokio::spawn(read_output(label.clone(), stdout, options.output, tx)));
        handle.output = Some(rx);

        // Resolves early with None once every stage has closed stderr
        if let Ok(Some(marker)) = timeout(options.startup_probe, busy_rx.recv()).await {
            warn!("[Process] {} could not claim the device: {}", label, marker);
            handle
                .terminate(Duration::from_millis(250), Duration::from_secs(1))
                .await;
            return Err(ReceiverError::DeviceBusy {
                command: label,
                marker,
            });
        }

        handle.state = ProcessState::Running;
        debug!("[Process] Running (pgid {:?}): {}", handle.group, handle.label);
        Ok(handle)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    /// Process group id shared by every stage
    pub fn process_group(&self) -> Option<i32> {
        self.group
    }

    /// Next raw output item, waiting at most `wait`
    pub async fn read_chunk(&mut self, wait: Duration) -> ReadOutcome<Vec<u8>> {
        let Some(output) = self.output.as_mut() else {
            return ReadOutcome::EndOfStream;
        };

        match timeout(wait, output.recv()).await {
            Ok(Some(bytes)) => ReadOutcome::Item(bytes),
            Ok(None) => ReadOutcome::EndOfStream,
            Err(_) => ReadOutcome::Timeout,
        }
    }

    /// Next output line (lossy UTF-8), waiting at most `wait`
    pub async fn read_line(&mut self, wait: Duration) -> ReadOutcome<String> {
        match self.read_chunk(wait).await {
            ReadOutcome::Item(bytes) => {
                ReadOutcome::Item(String::from_utf8_lossy(&bytes).into_owned())
            }
            ReadOutcome::Timeout => ReadOutcome::Timeout,
            ReadOutcome::EndOfStream => ReadOutcome::EndOfStream,
        }
    }

    /// Hand the output queue to a consumer as a stream. The handle keeps
    /// ownership of the processes and must still be terminated.
    pub fn take_output(&mut self) -> Option<ReceiverStream<Vec<u8>>> {
        self.output.take().map(ReceiverStream::new)
    }

    /// SIGTERM the group, wait `grace`, then SIGKILL and wait `kill_deadline`.
    /// Idempotent. Never fails; leftovers are logged.
    pub async fn terminate(&mut self, grace: Duration, kill_deadline: Duration) -> StopOutcome {
        if self.state == ProcessState::Stopped {
            return StopOutcome::AlreadyStopped;
        }
        self.state = ProcessState::Stopping;
        debug!("[Process] Stopping: {}", self.label);

        self.signal_group(GroupSignal::Terminate);
        let mut outcome = if self.wait_children(grace).await {
            StopOutcome::Graceful
        } else {
            warn!(
                "[Process] {}",
                ReceiverError::TerminationTimeout {
                    command: self.label.clone(),
                    grace,
                }
            );
            self.signal_group(GroupSignal::Kill);
            if self.wait_children(kill_deadline).await {
                StopOutcome::Forced
            } else {
                error!(
                    "[Process] {} still running {:?} after SIGKILL",
                    self.label, kill_deadline
                );
                StopOutcome::Unverified
            }
        };

        // Forked descendants outlive the direct children if they ignore SIGTERM
        if outcome != StopOutcome::Unverified && !self.wait_group_gone(grace).await {
            self.signal_group(GroupSignal::Kill);
            if self.wait_group_gone(kill_deadline).await {
                outcome = StopOutcome::Forced;
            } else {
                warn!(
                    "[Process] process group {:?} of {} still has members",
                    self.group, self.label
                );
                outcome = StopOutcome::Unverified;
            }
        }

        self.output = None;
        for mut task in self.tasks.drain(..) {
            if timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.state = ProcessState::Stopped;
        info!("[Process] Stopped ({:?}): {}", outcome, self.label);
        outcome
    }

    async fn wait_children(&mut self, limit: Duration) -> bool {
        let children = &mut self.children;
        timeout(limit, async move {
            for child in children.iter_mut() {
                let _ = child.wait().await;
            }
        })
        .await
        .is_ok()
    }

    async fn wait_group_gone(&self, limit: Duration) -> bool {
        #[cfg(unix)]
        {
            let Some(pgid) = self.group else {
                return true;
            };
            let deadline = Instant::now() + limit;
            loop {
                if !group_alive(pgid) {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        #[cfg(not(unix))]
        {
            let _ = limit;
            true
        }
    }

    fn signal_group(&mut self, signal: GroupSignal) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.group {
                let sig = match signal {
                    GroupSignal::Terminate => libc::SIGTERM,
                    GroupSignal::Kill => libc::SIGKILL,
                };
                // SAFETY: killpg only delivers a signal to the group we created.
                let rc = unsafe { libc::killpg(pgid, sig) };
                if rc != 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        debug!("[Process] killpg({}, {}) failed: {}", pgid, sig, err);
                    }
                }
                return;
            }
        }

        let _ = signal;
        for child in &mut self.children {
            let _ = child.start_kill();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.state != ProcessState::Stopped {
            debug!(
                "[Process] Dropped while {:?}, killing group: {}",
                self.state, self.label
            );
            self.signal_group(GroupSignal::Kill);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Whether any process of the group still exists
#[cfg(unix)]
pub fn group_alive(pgid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::killpg(pgid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Read one newline-terminated record, tolerating invalid UTF-8
async fn next_record<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(buf))
}

async fn read_output(
    label: String,
    mut stdout: ChildStdout,
    mode: OutputMode,
    tx: mpsc::Sender<Vec<u8>>,
) {
    match mode {
        OutputMode::Lines => {
            let mut reader = BufReader::new(stdout);
            loop {
                match next_record(&mut reader).await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[Process] {}: error reading output: {}", label, e);
                        break;
                    }
                }
            }
        }
        OutputMode::Chunks => {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            loop {
                match stdout.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buffer[..n].to_vec()).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("[Process] {}: error reading output: {}", label, e);
                        break;
                    }
                }
            }
        }
    }
    debug!("[Process] {}: output closed", label);
}

async fn watch_diagnostics(name: String, stderr: ChildStderr, busy: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stderr);
    let mut reported = false;

    loop {
        match next_record(&mut reader).await {
            Ok(Some(raw)) => {
                let text = String::from_utf8_lossy(&raw);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                // Tools print their normal startup chatter on stderr
                debug!("[{}] {}", name, line);
                if !reported && busy_marker(line).is_some() {
                    reported = true;
                    let _ = busy.try_send(line.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("[{}] stderr read error: {}", name, e);
                break;
            }
        }
    }
}
