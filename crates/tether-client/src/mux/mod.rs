//! Single-task I/O loop for all channels of one session.
//!
//! Every shell and exec channel of a session is serviced by one tokio task
//! that exclusively owns the channel handles. Callers talk to it through a
//! command queue, so no channel is ever touched from two places at once.
//! The task starts on demand and parks its receiver again once there is
//! nothing left to service.

mod batch;

pub use batch::{ReadBatcher, MAX_BATCH_BYTES};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::{maybe_done, MaybeDone};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tether_core::{
    ChannelId, ChannelIo, IoFuture, ReadOutcome, ReadyFuture, SessionBackend, TetherError,
    TetherResult,
};
use tokio::sync::{mpsc, oneshot};

/// Upper bound on how long an idle loop sleeps before polling every
/// channel again.
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Output of an interactive shell. Closes when the shell ends.
pub type ShellOutput = mpsc::UnboundedReceiver<Vec<u8>>;

type Reply<T> = oneshot::Sender<TetherResult<T>>;

enum Command {
    AddShell {
        id: ChannelId,
        io: Box<dyn ChannelIo>,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    },
    Write {
        id: ChannelId,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Resize {
        id: ChannelId,
        cols: u16,
        rows: u16,
    },
    Close {
        id: ChannelId,
    },
    Exec {
        command: String,
        reply: Reply<String>,
    },
    /// Wakes an idle loop so it notices the session went inactive.
    Wake,
}

struct Shared {
    tx: mpsc::UnboundedSender<Command>,
    /// Receiver of a loop that is not running.
    parked: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    backend: Arc<dyn SessionBackend>,
    active: Arc<AtomicBool>,
    /// Shells the loop tore down, not yet collected by the owner.
    ended: Mutex<Vec<ChannelId>>,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn parked(&self) -> MutexGuard<'_, Option<mpsc::UnboundedReceiver<Command>>> {
        lock(&self.parked)
    }

    fn ended(&self) -> MutexGuard<'_, Vec<ChannelId>> {
        lock(&self.ended)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to the I/O loop of one session.
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    pub fn new(backend: Arc<dyn SessionBackend>, active: Arc<AtomicBool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                tx,
                parked: Mutex::new(Some(rx)),
                backend,
                active,
                ended: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Hand an opened shell channel to the loop.
    pub fn add_shell(
        &self,
        id: ChannelId,
        io: Box<dyn ChannelIo>,
    ) -> TetherResult<ShellOutput> {
        let (sink, output) = mpsc::unbounded_channel();
        self.submit(Command::AddShell { id, io, sink })?;
        Ok(output)
    }

    /// Write to a shell. Completes once the bytes were handed to the channel.
    pub async fn write(&self, id: ChannelId, data: Vec<u8>) -> TetherResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Write { id, data, reply })?;
        rx.await.map_err(|_| TetherError::NotConnected)?
    }

    pub fn resize(&self, id: ChannelId, cols: u16, rows: u16) -> TetherResult<()> {
        self.submit(Command::Resize { id, cols, rows })
    }

    pub fn close(&self, id: ChannelId) -> TetherResult<()> {
        self.submit(Command::Close { id })
    }

    /// Queue a command for execution.
    ///
    /// Dropping the returned receiver cancels the request; the loop closes
    /// its channel and discards any late output.
    pub fn exec(
        &self,
        command: String,
    ) -> TetherResult<oneshot::Receiver<TetherResult<String>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Exec { command, reply })?;
        Ok(rx)
    }

    /// Shells that ended since the last call: remote EOF, read failure,
    /// local close, or session teardown.
    pub fn take_ended(&self) -> Vec<ChannelId> {
        std::mem::take(&mut *self.shared.ended())
    }

    /// Make a running loop observe that the session is gone.
    ///
    /// The loop tears down every channel and fails pending requests with
    /// `NotConnected`. Call after clearing the session's active flag.
    pub fn shutdown(&self) {
        if self.shared.tx.send(Command::Wake).is_ok() {
            self.ensure_running();
        }
    }

    fn submit(&self, command: Command) -> TetherResult<()> {
        if !self.shared.is_active() {
            return Err(TetherError::NotConnected);
        }
        self.shared
            .tx
            .send(command)
            .map_err(|_| TetherError::NotConnected)?;
        self.ensure_running();
        Ok(())
    }

    fn ensure_running(&self) {
        let mut slot = self.shared.parked();
        if slot.is_none() {
            return;
        }
        // `shutdown` may be reached from outside the runtime (abort from a
        // UI thread); queued work then waits for the next submit.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime available to start the channel loop");
            return;
        };
        if let Some(rx) = slot.take() {
            tracing::trace!("starting channel loop");
            runtime.spawn(Loop::new(self.shared.clone(), rx).run());
        }
    }
}

struct ShellChannel {
    io: Box<dyn ChannelIo>,
    sink: mpsc::UnboundedSender<Vec<u8>>,
    batch: ReadBatcher,
}

impl ShellChannel {
    fn deliver(&self, chunk: Option<Vec<u8>>) {
        if let Some(chunk) = chunk {
            // A closed receiver is noticed on the next pass.
            let _ = self.sink.send(chunk);
        }
    }

    /// Flush what is buffered and close the channel. Dropping the sink ends
    /// the consumer's stream.
    fn finish(mut self) {
        let rest = self.batch.take();
        self.deliver(rest);
        spawn_close(self.io);
    }
}

type OpenExec = MaybeDone<IoFuture<'static, Box<dyn ChannelIo>>>;

enum ExecPhase {
    Queued,
    Opening(OpenExec),
    Reading(Box<dyn ChannelIo>),
    Done,
}

enum Step {
    Idle,
    Progress,
    Finished,
}

/// One queued command and its output collected so far.
struct ExecRequest {
    command: String,
    phase: ExecPhase,
    output: Vec<u8>,
    /// Taken exactly once when the request resolves.
    reply: Option<Reply<String>>,
}

impl ExecRequest {
    fn new(command: String, reply: Reply<String>) -> Self {
        Self {
            command,
            phase: ExecPhase::Queued,
            output: Vec::new(),
            reply: Some(reply),
        }
    }

    fn is_abandoned(&self) -> bool {
        self.reply.as_ref().map_or(true, |r| r.is_closed())
    }

    fn step(&mut self, backend: &dyn SessionBackend) -> Step {
        if self.is_abandoned() {
            tracing::debug!("exec abandoned by caller: {}", self.command);
            self.release_channel();
            return Step::Finished;
        }

        match &mut self.phase {
            ExecPhase::Queued => {
                let opening = backend.open_exec(self.command.clone());
                self.phase = ExecPhase::Opening(maybe_done(opening));
                Step::Progress
            }
            ExecPhase::Opening(opening) => {
                if Pin::new(&mut *opening).now_or_never().is_none() {
                    return Step::Idle;
                }
                let opened = Pin::new(opening).take_output();
                match opened {
                    Some(Ok(io)) => {
                        self.phase = ExecPhase::Reading(io);
                        Step::Progress
                    }
                    Some(Err(e)) => {
                        self.phase = ExecPhase::Done;
                        self.resolve(Err(e));
                        Step::Finished
                    }
                    None => {
                        self.phase = ExecPhase::Done;
                        self.resolve(Err(TetherError::ChannelOpenFailed));
                        Step::Finished
                    }
                }
            }
            ExecPhase::Reading(io) => match io.try_read() {
                ReadOutcome::Data(bytes) => {
                    self.output.extend_from_slice(&bytes);
                    Step::Progress
                }
                ReadOutcome::WouldBlock => Step::Idle,
                ReadOutcome::Eof => {
                    self.release_channel();
                    let output = String::from_utf8_lossy(&self.output).into_owned();
                    self.resolve(Ok(output));
                    Step::Finished
                }
                ReadOutcome::Failed(reason) => {
                    self.release_channel();
                    self.resolve(Err(TetherError::Socket(reason)));
                    Step::Finished
                }
            },
            ExecPhase::Done => Step::Finished,
        }
    }

    fn resolve(&mut self, result: TetherResult<String>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }

    /// Close the request's channel, including one whose open is still in
    /// flight: that one is closed once the server grants it.
    fn release_channel(&mut self) {
        match std::mem::replace(&mut self.phase, ExecPhase::Done) {
            ExecPhase::Reading(io) => spawn_close(io),
            ExecPhase::Opening(mut opening) => {
                tokio::spawn(async move {
                    (&mut opening).await;
                    if let Some(Ok(io)) = Pin::new(&mut opening).take_output() {
                        tracing::debug!("closing exec channel granted after cancellation");
                        if let Err(e) = io.close().await {
                            tracing::debug!("channel close: {}", e);
                        }
                    }
                });
            }
            ExecPhase::Queued | ExecPhase::Done => {}
        }
    }

    /// Readiness of whatever the request is waiting on.
    fn ready(&mut self) -> Option<ReadyFuture<'_>> {
        match &mut self.phase {
            ExecPhase::Opening(opening) => Some(Box::pin(opening)),
            ExecPhase::Reading(io) => Some(io.readable()),
            ExecPhase::Queued | ExecPhase::Done => None,
        }
    }
}

fn spawn_close(io: Box<dyn ChannelIo>) {
    tokio::spawn(async move {
        if let Err(e) = io.close().await {
            tracing::debug!("channel close: {}", e);
        }
    });
}

struct Loop {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Command>,
    shells: HashMap<ChannelId, ShellChannel>,
    execs: Vec<ExecRequest>,
}

impl Loop {
    fn new(shared: Arc<Shared>, rx: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            shared,
            rx,
            shells: HashMap::new(),
            execs: Vec::new(),
        }
    }

    async fn run(mut self) {
        loop {
            self.service().await;

            // Nothing left to service. Park unless a command slipped in
            // after the last drain.
            let command = {
                let shared = self.shared.clone();
                let mut slot = shared.parked();
                match self.rx.try_recv() {
                    Ok(command) => command,
                    Err(_) => {
                        tracing::trace!("channel loop parked");
                        *slot = Some(self.rx);
                        return;
                    }
                }
            };
            self.handle(command).await;
        }
    }

    /// Run until no shell or exec remains.
    async fn service(&mut self) {
        loop {
            if !self.shared.is_active() {
                self.teardown();
                return;
            }

            let mut progressed = false;
            while let Ok(command) = self.rx.try_recv() {
                self.handle(command).await;
                progressed = true;
            }
            progressed |= self.service_shells();
            progressed |= self.service_execs();

            if self.shells.is_empty() && self.execs.is_empty() {
                return;
            }

            if progressed {
                tokio::task::yield_now().await;
            } else if let Some(command) = self.wait_for_activity().await {
                self.handle(command).await;
            }
        }
    }

    /// Sleep until a command arrives, any channel becomes readable, or
    /// `IDLE_WAIT` passes.
    async fn wait_for_activity(&mut self) -> Option<Command> {
        let Self {
            rx, shells, execs, ..
        } = self;
        let mut ready: FuturesUnordered<ReadyFuture<'_>> = shells
            .values_mut()
            .map(|shell| shell.io.readable())
            .chain(execs.iter_mut().filter_map(ExecRequest::ready))
            .collect();

        tokio::select! {
            command = rx.recv() => command,
            _ = ready.next(), if !ready.is_empty() => None,
            _ = tokio::time::sleep(IDLE_WAIT) => None,
        }
    }

    async fn handle(&mut self, command: Command) {
        if !self.shared.is_active() {
            reject(command);
            return;
        }

        match command {
            Command::AddShell { id, io, sink } => {
                tracing::debug!("shell {} attached to channel loop", id);
                let shell = ShellChannel {
                    io,
                    sink,
                    batch: ReadBatcher::new(Instant::now()),
                };
                if let Some(previous) = self.shells.insert(id, shell) {
                    tracing::warn!("shell {} replaced an existing channel", id);
                    previous.finish();
                }
            }
            Command::Write { id, data, reply } => {
                let result = match self.shells.get_mut(&id) {
                    Some(shell) => shell.io.write_all(&data).await,
                    None => Err(TetherError::UnknownChannel(id)),
                };
                if let Err(e) = &result {
                    tracing::debug!("write to shell {} failed: {}", id, e);
                }
                let _ = reply.send(result);
            }
            Command::Resize { id, cols, rows } => match self.shells.get_mut(&id) {
                Some(shell) => match shell.io.resize(cols, rows).now_or_never() {
                    Some(Ok(())) => {
                        tracing::trace!("shell {} resized to {}x{}", id, cols, rows)
                    }
                    Some(Err(e)) => tracing::warn!("resize of shell {} failed: {}", id, e),
                    None => tracing::trace!("resize of shell {} still in flight", id),
                },
                None => tracing::debug!("resize for unknown shell {}", id),
            },
            Command::Close { id } => match self.shells.remove(&id) {
                Some(shell) => {
                    tracing::debug!("closing shell {}", id);
                    self.end_shell(id, shell);
                }
                None => tracing::debug!("close for unknown shell {}", id),
            },
            Command::Exec { command, reply } => {
                tracing::debug!("queued exec: {}", command);
                self.execs.push(ExecRequest::new(command, reply));
            }
            Command::Wake => {}
        }
    }

    fn service_shells(&mut self) -> bool {
        let now = Instant::now();
        let mut progressed = false;
        let mut ended = Vec::new();

        for (&id, shell) in self.shells.iter_mut() {
            if shell.sink.is_closed() {
                tracing::debug!("output of shell {} dropped by consumer", id);
                ended.push(id);
                continue;
            }
            match shell.io.try_read() {
                ReadOutcome::Data(bytes) => {
                    progressed = true;
                    let chunk = shell.batch.push(&bytes, now);
                    shell.deliver(chunk);
                }
                ReadOutcome::WouldBlock => {
                    let chunk = shell.batch.idle(now);
                    shell.deliver(chunk);
                }
                ReadOutcome::Eof => {
                    tracing::debug!("shell {} reached end of stream", id);
                    ended.push(id);
                }
                ReadOutcome::Failed(reason) => {
                    tracing::warn!("shell {} read failed: {}", id, reason);
                    ended.push(id);
                }
            }
        }

        for id in ended {
            if let Some(shell) = self.shells.remove(&id) {
                self.end_shell(id, shell);
                progressed = true;
            }
        }
        progressed
    }

    /// Record the shell as ended before its reader sees end of stream.
    fn end_shell(&self, id: ChannelId, shell: ShellChannel) {
        self.shared.ended().push(id);
        shell.finish();
    }

    fn service_execs(&mut self) -> bool {
        let backend = self.shared.backend.clone();
        let mut progressed = false;
        self.execs.retain_mut(|request| match request.step(backend.as_ref()) {
            Step::Idle => true,
            Step::Progress => {
                progressed = true;
                true
            }
            Step::Finished => {
                progressed = true;
                false
            }
        });
        progressed
    }

    fn teardown(&mut self) {
        if !self.shells.is_empty() || !self.execs.is_empty() {
            tracing::debug!(
                "tearing down {} shell(s) and {} exec(s)",
                self.shells.len(),
                self.execs.len()
            );
        }
        let shells: Vec<_> = self.shells.drain().collect();
        for (id, shell) in shells {
            self.end_shell(id, shell);
        }
        for mut request in self.execs.drain(..) {
            request.release_channel();
            request.resolve(Err(TetherError::NotConnected));
        }
        while let Ok(command) = self.rx.try_recv() {
            reject(command);
        }
    }
}

/// Fail a command that arrived after the session went away.
fn reject(command: Command) {
    match command {
        Command::Write { reply, .. } => {
            let _ = reply.send(Err(TetherError::NotConnected));
        }
        Command::Exec { reply, .. } => {
            let _ = reply.send(Err(TetherError::NotConnected));
        }
        Command::AddShell { io, .. } => spawn_close(io),
        Command::Resize { .. } | Command::Close { .. } | Command::Wake => {}
    }
}
