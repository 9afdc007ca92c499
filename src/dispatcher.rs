//! Job brokers. [`Dispatcher`] spreads jobs over a pool of worker
//! processes; [`RemoteDispatcher`] drives a `mutator dispatch` subprocess;
//! [`InlineExecutor`] runs jobs on the calling thread.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::wire::{self, ControlCommand, Inbound, TestDescription, WireError};
use crate::worker;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is stopping and accepts no new jobs")]
    Stopped,
    #[error("no job is in flight")]
    Idle,
    #[error("dispatcher channel closed")]
    Disconnected,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Anything that accepts jobs and hands back their verdicts.
pub trait TestExecutor {
    fn submit(&self, job: TestDescription) -> Result<(), DispatchError>;

    /// Block for the next finished job, in completion order.
    fn next_result(&self) -> Result<TestDescription, DispatchError>;
}

/// Kills the worker from another thread.
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

/// Transport to one worker.
pub trait WorkerChannel: Send {
    fn send(&mut self, job: &TestDescription) -> Result<(), WireError>;
    fn receive(&mut self) -> Result<TestDescription, WireError>;
    fn is_alive(&mut self) -> bool;
    fn kill(&mut self);
    fn terminator(&self) -> Terminator;
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> std::io::Result<Box<dyn WorkerChannel>>;
}

/// Starts `<program> worker - -` and talks to it over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ProcessLauncher {
            program: program.into(),
        }
    }

    pub fn current_exe() -> std::io::Result<Self> {
        Ok(ProcessLauncher::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> std::io::Result<Box<dyn WorkerChannel>> {
        let mut child = Command::new(&self.program)
            .args(["worker", "-", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(std::io::Error::other("worker started without piped stdio"));
        };
        log::debug!("started worker pid {}", child.id());
        Ok(Box::new(ProcessWorker {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
        }))
    }
}

pub struct ProcessWorker {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerChannel for ProcessWorker {
    fn send(&mut self, job: &TestDescription) -> Result<(), WireError> {
        wire::write_frame(&mut self.stdin, job)
    }

    fn receive(&mut self) -> Result<TestDescription, WireError> {
        wire::read_frame(&mut self.stdout)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }

    fn terminator(&self) -> Terminator {
        let child = Arc::clone(&self.child);
        Arc::new(move || {
            let _ = child.lock().kill();
        })
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub pool_size: usize,
    /// Cap on simultaneously busy workers, independent of pool size.
    pub max_busy: usize,
    /// Discard each worker after a single job.
    pub one_shot: bool,
    /// Added to a job's budget before the watchdog kills its worker.
    pub timeout_grace_ms: u64,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        DispatcherConfig {
            pool_size,
            max_busy: pool_size,
            one_shot: false,
            timeout_grace_ms: 2000,
            poll_interval: Duration::from_millis(10),
        }
    }
}

struct WorkerSlot {
    busy: AtomicBool,
    channel: Mutex<Option<Box<dyn WorkerChannel>>>,
}

/// Everything the dispatch loop and the watchers share.
struct DispatcherState {
    config: DispatcherConfig,
    launcher: Box<dyn WorkerLauncher>,
    slots: Vec<WorkerSlot>,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
    /// Submitted jobs whose result has not been delivered yet.
    pending: AtomicUsize,
    stopping: AtomicBool,
    results: Sender<TestDescription>,
}

impl DispatcherState {
    /// Wait for an idle slot under the busy cap and mark it busy. Slots
    /// other than `avoid` are preferred. Only the dispatch loop claims.
    fn claim(&self, avoid: Option<usize>) -> usize {
        let cap = self.config.max_busy.max(1);
        loop {
            if self.busy.load(Ordering::SeqCst) < cap {
                let preferred = (0..self.slots.len()).filter(|i| Some(*i) != avoid);
                for index in preferred.chain(avoid) {
                    let slot = &self.slots[index];
                    if slot
                        .busy
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let now = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
                        self.peak_busy.fetch_max(now, Ordering::SeqCst);
                        return index;
                    }
                }
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn release(&self, index: usize) {
        self.slots[index].busy.store(false, Ordering::SeqCst);
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    fn deliver(&self, result: TestDescription) {
        if self.results.send(result).is_err() {
            log::warn!("result receiver is gone, dropping verdict");
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn take_channel(&self, index: usize) -> std::io::Result<Box<dyn WorkerChannel>> {
        match self.slots[index].channel.lock().take() {
            Some(channel) => Ok(channel),
            None => self.launcher.launch(),
        }
    }

    /// Replace a dead worker with a fresh one. A failed launch leaves the
    /// slot empty so the next claim tries again.
    fn replace(&self, index: usize, mut dead: Box<dyn WorkerChannel>) {
        dead.kill();
        let fresh = match self.launcher.launch() {
            Ok(channel) => Some(channel),
            Err(e) => {
                log::error!("failed to restart worker {}: {}", index, e);
                None
            }
        };
        *self.slots[index].channel.lock() = fresh;
    }

    fn shutdown_workers(&self) {
        for slot in &self.slots {
            if let Some(mut channel) = slot.channel.lock().take() {
                channel.kill();
            }
        }
    }
}

fn dispatch_loop(state: Arc<DispatcherState>, jobs: Receiver<TestDescription>) {
    loop {
        match jobs.recv_timeout(state.config.poll_interval) {
            Ok(job) => assign(&state, job),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Stop was requested and the queue is drained; wait out in-flight jobs.
    while state.pending.load(Ordering::SeqCst) > 0 {
        thread::sleep(state.config.poll_interval);
    }
    log::debug!(
        "dispatch loop finished, peak busy {}",
        state.peak_busy.load(Ordering::SeqCst)
    );
}

fn assign(state: &Arc<DispatcherState>, job: TestDescription) {
    let mut avoid = None;
    // Every slot gets a chance, plus one retry on a fresh worker.
    let mut attempts_left = state.slots.len() + 1;
    loop {
        let index = state.claim(avoid);
        let mut channel = match state.take_channel(index) {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("failed to start worker {}: {}", index, e);
                state.release(index);
                state.deliver(job.failed(true, Some(format!("failed to start worker: {}", e))));
                return;
            }
        };
        match channel.send(&job) {
            Ok(()) => {
                let state = Arc::clone(state);
                thread::spawn(move || watch(state, index, channel, job));
                return;
            }
            Err(e) => {
                log::warn!("worker {} rejected job {}: {}; restarting it", index, job.uid, e);
                state.replace(index, channel);
                state.release(index);
                attempts_left -= 1;
                if attempts_left == 0 {
                    state.deliver(job.failed(true, Some(format!("could not deliver job: {}", e))));
                    return;
                }
                avoid = Some(index);
            }
        }
    }
}

/// Wait for the worker at `index` to answer `job`, then free the slot.
fn watch(
    state: Arc<DispatcherState>,
    index: usize,
    mut channel: Box<dyn WorkerChannel>,
    job: TestDescription,
) {
    let timed_out = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = channel::bounded::<()>(1);
    let watchdog = (job.time_budget_ms > 0).then(|| {
        let limit =
            Duration::from_millis(job.time_budget_ms.saturating_add(state.config.timeout_grace_ms));
        let terminate = channel.terminator();
        let timed_out = Arc::clone(&timed_out);
        let uid = job.uid.clone();
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(limit) {
                log::warn!("job {} exceeded {:?}, terminating worker {}", uid, limit, index);
                timed_out.store(true, Ordering::SeqCst);
                terminate();
            }
        })
    });

    let received = channel.receive();
    let _ = done_tx.send(());
    if let Some(watchdog) = watchdog {
        let _ = watchdog.join();
    }
    let timed_out = timed_out.load(Ordering::SeqCst);

    let (result, healthy) = match received {
        _ if timed_out => (job.failed(false, None), false),
        Ok(result) if result.uid == job.uid => (result, true),
        Ok(other) => {
            log::error!("worker {} answered job {} with job {}", index, job.uid, other.uid);
            (job.failed(true, None), false)
        }
        Err(e) => {
            log::warn!("worker {} failed on job {}: {}", index, job.uid, e);
            (job.failed(true, None), false)
        }
    };

    if !healthy || !channel.is_alive() {
        state.replace(index, channel);
    } else if state.config.one_shot {
        channel.kill();
    } else {
        *state.slots[index].channel.lock() = Some(channel);
    }
    state.release(index);
    state.deliver(result);
}

/// In-process broker over a fixed pool of workers.
pub struct Dispatcher {
    state: Arc<DispatcherState>,
    jobs: Mutex<Option<Sender<TestDescription>>>,
    results: Receiver<TestDescription>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Launch the whole pool and start the dispatch loop.
    pub fn start(
        config: DispatcherConfig,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Result<Dispatcher, DispatchError> {
        let mut slots = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            let channel = launcher.launch().map_err(DispatchError::Spawn)?;
            slots.push(WorkerSlot {
                busy: AtomicBool::new(false),
                channel: Mutex::new(Some(channel)),
            });
        }
        log::info!(
            "dispatcher started with {} workers, at most {} busy",
            slots.len(),
            config.max_busy
        );

        let (jobs_tx, jobs_rx) = channel::unbounded();
        let (results_tx, results_rx) = channel::unbounded();
        let state = Arc::new(DispatcherState {
            config,
            launcher,
            slots,
            busy: AtomicUsize::new(0),
            peak_busy: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            results: results_tx,
        });
        let dispatch_thread = {
            let state = Arc::clone(&state);
            thread::spawn(move || dispatch_loop(state, jobs_rx))
        };
        Ok(Dispatcher {
            state,
            jobs: Mutex::new(Some(jobs_tx)),
            results: results_rx,
            dispatch_thread: Mutex::new(Some(dispatch_thread)),
        })
    }

    pub fn with_process_workers(config: DispatcherConfig) -> Result<Dispatcher, DispatchError> {
        let launcher = ProcessLauncher::current_exe().map_err(DispatchError::Spawn)?;
        Dispatcher::start(config, Box::new(launcher))
    }

    pub fn busy(&self) -> usize {
        self.state.busy.load(Ordering::SeqCst)
    }

    /// Most workers that were ever busy at the same time.
    pub fn peak_busy(&self) -> usize {
        self.state.peak_busy.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stopping.load(Ordering::SeqCst)
    }

    /// Refuse new jobs, finish the queued and in-flight ones, then shut the
    /// pool down. Results stay readable through [`TestExecutor::next_result`].
    pub fn stop(&self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        drop(self.jobs.lock().take());
        if let Some(handle) = self.dispatch_thread.lock().take() {
            if handle.join().is_err() {
                log::error!("dispatch loop panicked");
            }
            self.state.shutdown_workers();
        }
    }
}

impl TestExecutor for Dispatcher {
    fn submit(&self, job: TestDescription) -> Result<(), DispatchError> {
        let jobs = self.jobs.lock();
        let Some(sender) = jobs.as_ref() else {
            return Err(DispatchError::Stopped);
        };
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(job).is_err() {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::Disconnected);
        }
        Ok(())
    }

    fn next_result(&self) -> Result<TestDescription, DispatchError> {
        loop {
            match self.results.recv_timeout(self.state.config.poll_interval) {
                Ok(result) => return Ok(result),
                Err(RecvTimeoutError::Timeout) => {
                    if self.pending() == 0 && self.results.is_empty() {
                        return Err(DispatchError::Idle);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DispatchError::Disconnected),
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A `mutator dispatch` subprocess fed over its stdin and read from its
/// stdout, with commands multiplexed onto stdin.
pub struct RemoteDispatcher {
    child: Mutex<Child>,
    inbound: Mutex<Option<ChildStdin>>,
    outbound: Mutex<BufReader<ChildStdout>>,
}

impl RemoteDispatcher {
    /// The `dispatch` invocation carrying `config` to the subprocess.
    pub fn command(program: &Path, config: &DispatcherConfig) -> Command {
        let mut command = Command::new(program);
        command
            .args(["dispatch", "-", "-", "-"])
            .arg(config.pool_size.to_string())
            .arg("--max-busy")
            .arg(config.max_busy.to_string())
            .arg("--timeout-grace-ms")
            .arg(config.timeout_grace_ms.to_string());
        if config.one_shot {
            command.arg("--one-shot");
        }
        command
    }

    pub fn spawn(
        program: &Path,
        config: &DispatcherConfig,
    ) -> Result<RemoteDispatcher, DispatchError> {
        let mut child = Self::command(program, config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(DispatchError::Spawn)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(DispatchError::Spawn(std::io::Error::other(
                "dispatcher started without piped stdio",
            )));
        };
        Ok(RemoteDispatcher {
            child: Mutex::new(child),
            inbound: Mutex::new(Some(stdin)),
            outbound: Mutex::new(BufReader::new(stdout)),
        })
    }

    /// Send the stop command and wait for the subprocess to drain and exit.
    /// Read every outstanding result first.
    pub fn stop(&self) -> Result<(), DispatchError> {
        if let Some(mut stdin) = self.inbound.lock().take() {
            wire::write_frame(&mut stdin, &Inbound::Command(ControlCommand::Stop))?;
        }
        let status = self.child.lock().wait().map_err(DispatchError::Spawn)?;
        if !status.success() {
            log::warn!("dispatcher subprocess exited with {}", status);
        }
        Ok(())
    }
}

impl TestExecutor for RemoteDispatcher {
    fn submit(&self, job: TestDescription) -> Result<(), DispatchError> {
        let mut inbound = self.inbound.lock();
        let stdin = inbound.as_mut().ok_or(DispatchError::Stopped)?;
        wire::write_frame(stdin, &Inbound::Job(job))?;
        Ok(())
    }

    fn next_result(&self) -> Result<TestDescription, DispatchError> {
        Ok(wire::read_frame(&mut *self.outbound.lock())?)
    }
}

impl Drop for RemoteDispatcher {
    fn drop(&mut self) {
        if self.inbound.lock().is_some() {
            let mut child = self.child.lock();
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Runs each job on the calling thread as it is submitted. No isolation.
#[derive(Default)]
pub struct InlineExecutor {
    results: Mutex<VecDeque<TestDescription>>,
}

impl InlineExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestExecutor for InlineExecutor {
    fn submit(&self, mut job: TestDescription) -> Result<(), DispatchError> {
        worker::run_job(&mut job);
        self.results.lock().push_back(job);
        Ok(())
    }

    fn next_result(&self) -> Result<TestDescription, DispatchError> {
        self.results.lock().pop_front().ok_or(DispatchError::Idle)
    }
}

enum Event {
    Job(TestDescription),
    Stop,
    Closed,
}

fn read_inbound(mut inbound: Box<dyn BufRead + Send>, events: Sender<Event>) {
    loop {
        let event = match wire::read_frame::<_, Inbound>(&mut *inbound) {
            Ok(Inbound::Job(job)) => Event::Job(job),
            Ok(Inbound::Command(ControlCommand::Stop)) => Event::Stop,
            Err(WireError::Closed) => Event::Closed,
            Err(e) => {
                log::error!("inbound channel failed: {}", e);
                Event::Closed
            }
        };
        let last = !matches!(event, Event::Job(_));
        if events.send(event).is_err() || last {
            return;
        }
    }
}

fn read_commands(mut commands: Box<dyn BufRead + Send>, events: Sender<Event>) {
    loop {
        match wire::read_frame::<_, ControlCommand>(&mut *commands) {
            Ok(ControlCommand::Stop) => {
                let _ = events.send(Event::Stop);
                return;
            }
            Err(WireError::Closed) => return,
            Err(e) => {
                log::error!("command channel failed: {}", e);
                return;
            }
        }
    }
}

/// The `dispatch` subcommand: read jobs from `inbound`, run them on the
/// pool and write verdicts to `outbound` until a stop command arrives or
/// the inbound stream closes. `commands` of `None` means commands arrive on
/// the inbound stream.
pub fn serve(
    dispatcher: Dispatcher,
    inbound: Box<dyn BufRead + Send>,
    mut outbound: Box<dyn Write + Send>,
    commands: Option<Box<dyn BufRead + Send>>,
) -> Result<(), DispatchError> {
    let dispatcher = Arc::new(dispatcher);
    let (events_tx, events_rx) = channel::unbounded();

    {
        let events = events_tx.clone();
        thread::spawn(move || read_inbound(inbound, events));
    }
    if let Some(commands) = commands {
        let events = events_tx.clone();
        thread::spawn(move || read_commands(commands, events));
    }
    drop(events_tx);

    let sender = {
        let dispatcher = Arc::clone(&dispatcher);
        thread::spawn(move || -> Result<(), DispatchError> {
            loop {
                match dispatcher.next_result() {
                    Ok(result) => wire::write_frame(&mut *outbound, &result)?,
                    Err(DispatchError::Idle) if dispatcher.is_stopping() => return Ok(()),
                    Err(DispatchError::Idle) => {}
                    Err(e) => return Err(e),
                }
            }
        })
    };

    for event in events_rx.iter() {
        match event {
            Event::Job(job) => {
                log::debug!("queued job {}", job.uid);
                if let Err(e) = dispatcher.submit(job) {
                    log::error!("could not queue job: {}", e);
                }
            }
            Event::Stop => {
                log::info!("stop requested");
                break;
            }
            Event::Closed => {
                log::info!("inbound channel closed");
                break;
            }
        }
    }

    dispatcher.stop();
    match sender.join() {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Disconnected),
    }
}
