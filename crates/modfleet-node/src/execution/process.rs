//! Process Engine
//!
//! Runs each module as a child process. Store-hosted binaries are launched
//! through the configured runner (`<runner> <binary> <args...>`); anything
//! else is executed directly. Child stdin/stdout are pumped to and from the
//! module's rings. A quit or kill signal terminates the child; processes
//! cannot hand back a snapshot, so `Finished` never carries memory.

use super::{ExecutionContext, ExecutionEngine, ExecutionEvent, StartInstruction};
use modfleet_core::{ModuleEndpoint, RingReader, RingWriter, Signal};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PUMP_BUFFER: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct ProcessEngine {
    runner: Option<String>,
}

impl ProcessEngine {
    pub fn new(runner: Option<String>) -> Self {
        Self { runner }
    }

    fn command(&self, start: &StartInstruction) -> Command {
        let mut command = match &self.runner {
            Some(runner) => {
                let mut c = Command::new(runner);
                c.arg(&start.binary_ref);
                c
            }
            None => Command::new(&start.binary_ref),
        };
        if let Some(args) = &start.args {
            command.args(args.split_whitespace());
        }
        if let Some(env) = &start.env {
            command.envs(env.split_whitespace().filter_map(|pair| pair.split_once('=')));
        }
        command
            .env("MODFLEET_MODULE_ID", start.uuid.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl ExecutionEngine for ProcessEngine {
    fn spawn(
        &self,
        start: StartInstruction,
        endpoint: ModuleEndpoint,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Box<dyn ExecutionContext> {
        let command = self.command(&start);
        let task = tokio::spawn(supervise(command, start, endpoint, events));
        Box::new(ProcessContext { task })
    }
}

struct ProcessContext {
    task: JoinHandle<()>,
}

impl ExecutionContext for ProcessContext {
    fn stop(&mut self) {
        self.task.abort();
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn supervise(
    mut command: Command,
    start: StartInstruction,
    endpoint: ModuleEndpoint,
    events: mpsc::UnboundedSender<ExecutionEvent>,
) {
    let uuid = start.uuid;
    let ModuleEndpoint { io, port } = endpoint;
    let mut signals = io.signals;

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(module_id = %uuid, binary = %start.binary_ref, error = %e, "Failed to spawn module process");
            let _ = events.send(ExecutionEvent::finished(uuid, None, None));
            return;
        }
    };
    if start.injected_memory.is_some() {
        debug!(module_id = %uuid, "Process modules cannot resume from a snapshot, starting fresh");
    }
    let _ = events.send(ExecutionEvent::started(uuid));

    let stdin_pump = child.stdin.take().map(|stdin| tokio::spawn(pump_stdin(io.stdin, stdin)));
    let stdout_pump = child.stdout.take().map(|stdout| tokio::spawn(pump_stdout(stdout, io.stdout)));

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv() => match signal {
                Signal::Quit | Signal::Kill => {
                    debug!(module_id = %uuid, ?signal, "Terminating module process");
                    if let Err(e) = child.start_kill() {
                        warn!(module_id = %uuid, error = %e, "Failed to kill module process");
                    }
                }
                Signal::Interrupt => debug!(module_id = %uuid, "Interrupt ignored by process engine"),
            },
        }
    };

    if let Some(pump) = stdin_pump {
        pump.abort();
    }
    if let Some(pump) = stdout_pump {
        let _ = pump.await;
    }
    drop(port);

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(module_id = %uuid, error = %e, "Failed to wait for module process");
            None
        }
    };
    let _ = events.send(ExecutionEvent::finished(uuid, None, exit_code));
}

async fn pump_stdin(mut ring: RingReader, mut stdin: ChildStdin) {
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        match ring.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn pump_stdout(mut stdout: ChildStdout, mut ring: RingWriter) {
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if ring.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}
