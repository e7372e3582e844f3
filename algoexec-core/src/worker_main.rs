//! Worker-process entrypoint.
//!
//! Re-exec'd as `algoexecd --worker` by [`crate::pool::worker::WorkerHandle`].
//! Speaks the newline-delimited JSON protocol defined in
//! [`crate::pool`] over stdin/stdout: one [`crate::pool::WireRequest`] in,
//! one [`crate::pool::WireResponse`] out, in order. A worker process runs
//! algorithms in-process via the same [`crate::runner::InProcessRunner`]
//! the parent uses for `in_process`-hinted specs - isolation here comes
//! from the OS process boundary, not from a different invocation path.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::context::ExecutionContext;
use crate::envelope::ErrorKind;
use crate::pool::{WireRequest, WireResponse};
use crate::registry::AlgorithmRegistry;
use crate::runner::InProcessRunner;

fn error_kind_wire(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::Timeout => "timeout",
        ErrorKind::Rejected => "rejected",
        ErrorKind::Runtime => "runtime",
        ErrorKind::System => "system",
    }
}

/// Drives the worker's request/response loop until stdin closes (the
/// parent dropped our stdin, or was killed).
pub async fn run(registry: AlgorithmRegistry) -> std::io::Result<()> {
    let runner = InProcessRunner::new();
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: WireRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(error = %e, "worker received an unparsable request line");
                continue;
            }
        };

        let response = handle_one(&registry, &runner, request).await;
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    runner.shutdown();
    Ok(())
}

/// Handles one task: establishes a fresh ambient [`ExecutionContext`] for
/// the duration of the invocation (mirroring what the in-process runner's
/// caller does), invokes the algorithm, and carries the ambient's final
/// `response_meta` snapshot back in the reply regardless of outcome - an
/// algorithm can set response-meta overrides before failing, same as in
/// the in-process path (`spec.md` §4.3 scenario S6).
async fn handle_one(registry: &AlgorithmRegistry, runner: &InProcessRunner, request: WireRequest) -> WireResponse {
    let task_id = request.task_id;
    let ctx = ExecutionContext::with_hyperparams(
        request.request_id.clone(),
        request.trace_id.clone(),
        request.hyperparams.clone(),
    );

    let spec = match registry.get(&request.name, &request.version) {
        Ok(spec) => spec,
        Err(e) => {
            return WireResponse {
                task_id,
                ok: false,
                result: None,
                error_kind: Some(error_kind_wire(ErrorKind::System).to_string()),
                error_message: Some(e.to_string()),
                response_meta: None,
            }
        }
    };

    let input = request.input;
    let outcome = ctx
        .clone()
        .scope(async move { runner.invoke(&spec, input) })
        .await;
    let meta = ctx.snapshot_meta();
    let response_meta = if meta.is_empty() { None } else { Some(meta) };

    match outcome {
        Ok(result) => WireResponse {
            task_id,
            ok: true,
            result: Some(result),
            error_kind: None,
            error_message: None,
            response_meta,
        },
        Err(err) => WireResponse {
            task_id,
            ok: false,
            result: None,
            error_kind: Some(error_kind_wire(err.kind).to_string()),
            error_message: Some(err.message),
            response_meta,
        },
    }
}
