//! The worker loop, run inside the worker process.

use std::io::{self, BufRead, Write};

use crate::wire::{self, Reply, Request};

/// Serve the allocation requests read from the `input`, writing the replies
/// to the `output`, until the `input` is exhausted.
///
/// Requests are processed one at a time, in the order they arrive.
/// Lines that can't be interpreted as requests are skipped.
/// Fails only when reading the `input` or writing the `output` fails.
pub fn serve(mut input: impl BufRead, mut output: impl Write) -> io::Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let request: Request = match serde_json::from_slice(&line) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(message = "skipping malformed request", error = %err);
                continue;
            }
        };

        let reply = process(request);
        output.write_all(&wire::encode(&reply)?)?;
        output.flush()?;
    }
}

/// Execute a single request and produce the reply.
pub fn process(request: Request) -> Reply {
    let Request {
        job,
        method,
        path,
        offset,
        length,
        mode,
    } = request;
    tracing::debug!(message = "processing", %job, ?method, path = %path.display());

    match method.invoke(&path, offset, length, mode) {
        Ok(()) => Reply::success(job, path),
        Err(err) => {
            tracing::debug!(message = "allocation failed", %job, error = %err);
            Reply::failure(job, path, &err)
        }
    }
}
