//! Interactive stdin simulation.
//!
//! Some client commands (`attach -i`, `run -i`, `exec -i`) take a different
//! path when stdin is a live stream than when it is already complete. An
//! in-memory buffer reaches EOF at once and exercises the batch path, so the
//! child is given the read end of a real OS pipe instead. The harness keeps
//! the write end: the child sees the prefilled bytes, then blocks until
//! [`BlockingInput::close`] is called (or the handle is dropped).

use std::io::{PipeReader, PipeWriter, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::exec::{ClientCommand, CommandResult};

/// Largest prefill accepted by [`blocking_input`]. Writes up to `PIPE_BUF`
/// fit in an empty pipe, so the prefill can never block with no reader.
pub const MAX_PREFILL_BYTES: usize = 4096;

/// Write end of an interactive stdin pipe.
#[derive(Debug)]
pub struct BlockingInput {
    writer: Option<PipeWriter>,
}

/// Create a pipe and prefill it with `initial`.
///
/// Returns the read end for the child and the still-open write end. The
/// reader sees exactly `initial` and then blocks until the writer closes.
pub fn blocking_input(initial: &[u8]) -> HarnessResult<(PipeReader, BlockingInput)> {
    if initial.len() > MAX_PREFILL_BYTES {
        return Err(HarnessError::Setup(format!(
            "interactive prefill of {} bytes exceeds the {MAX_PREFILL_BYTES}-byte pipe limit",
            initial.len()
        )));
    }

    let (reader, mut writer) = std::io::pipe()
        .map_err(|e| HarnessError::Setup(format!("cannot create stdin pipe: {e}")))?;
    writer.write_all(initial)?;
    debug!(bytes = initial.len(), "Prefilled interactive stdin");

    Ok((
        reader,
        BlockingInput {
            writer: Some(writer),
        },
    ))
}

impl BlockingInput {
    /// Send more input. Blocks if the pipe is full and the child isn't reading.
    pub fn write_more(&mut self, data: &[u8]) -> HarnessResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| HarnessError::Setup("interactive stdin already closed".to_string()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Close the write end; the child sees end-of-input. Idempotent.
    pub fn close(&mut self) {
        if self.writer.take().is_some() {
            debug!("Closed interactive stdin");
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for BlockingInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run `command` with a prefilled interactive stdin that stays open for the
/// whole run, bounded by `timeout`.
///
/// The write end goes with the command, so the pipe is closed the moment the
/// child exits or is killed. A child waiting for EOF is killed at the
/// deadline, along with anything it forked, and reported with `timed_out`.
pub fn run_interactive(
    command: ClientCommand,
    initial: &[u8],
    timeout: Duration,
) -> HarnessResult<CommandResult> {
    let (reader, input) = blocking_input(initial)?;
    command
        .interactive_stdin(reader, input)
        .timeout(timeout)
        .exec()
}

/// A client running in the background with an interactive stdin the caller
/// can keep feeding.
pub struct InteractiveSession {
    input: BlockingInput,
    handle: Option<JoinHandle<HarnessResult<CommandResult>>>,
}

impl InteractiveSession {
    /// Start `command` on a helper thread with `initial` already in its stdin.
    /// The command's own timeout still bounds the run.
    pub fn start(command: ClientCommand, initial: &[u8]) -> HarnessResult<Self> {
        let (reader, input) = blocking_input(initial)?;
        let command = command.stdin_reader(reader);
        let handle = thread::Builder::new()
            .name("ctlcheck-interactive".to_string())
            .spawn(move || command.exec())?;
        Ok(Self {
            input,
            handle: Some(handle),
        })
    }

    pub fn input(&mut self) -> &mut BlockingInput {
        &mut self.input
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Close stdin and wait for the command to exit.
    pub fn finish(mut self) -> HarnessResult<CommandResult> {
        self.input.close();
        self.join()
    }

    /// Wait for the command without closing stdin first.
    pub fn wait(mut self) -> HarnessResult<CommandResult> {
        let result = self.join();
        self.input.close();
        result
    }

    fn join(&mut self) -> HarnessResult<CommandResult> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| HarnessError::Setup("interactive session already joined".to_string()))?;
        handle.join().unwrap_or_else(|_| {
            warn!("Interactive command thread panicked");
            Err(HarnessError::Setup(
                "interactive command thread panicked".to_string(),
            ))
        })
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        // Closing stdin lets a well-behaved child exit; the command's own
        // timeout reaps one that doesn't.
        self.input.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
