//! Decoder hand-off
//!
//! Runs the external decoder on a downloaded encrypted file. The decoder
//! reports its progress by POSTing `key=value` lines to a loopback HTTP
//! endpoint; `total_size=N` lines are relayed to the progress callback.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Router;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::activation::ActivationKey;
use crate::app::transfer::{partial_path, swap_extension, ProgressFn};
use crate::constants::decoder;
use crate::errors::{DecodeError, DecodeResult};

/// Parses a `total_size=N` progress line
pub fn parse_total_size(line: &str) -> Option<u64> {
    line.trim()
        .strip_prefix(decoder::TOTAL_SIZE_PREFIX)
        .and_then(|value| value.trim().parse().ok())
}

#[derive(Clone)]
struct EndpointState {
    input_size: u64,
    progress: Option<ProgressFn>,
}

impl EndpointState {
    fn handle_line(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if !line.starts_with(decoder::TOTAL_SIZE_PREFIX) {
            return;
        }
        match parse_total_size(&line) {
            Some(size) => {
                if let Some(progress) = &self.progress {
                    progress(self.input_size, size.min(self.input_size));
                }
            }
            None => debug!("Unparseable decoder progress line: {}", line.trim()),
        }
    }
}

async fn receive_progress(State(state): State<EndpointState>, body: Body) -> StatusCode {
    let mut stream = body.into_data_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            break;
        };
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            state.handle_line(&line);
        }
    }
    if !buffer.is_empty() {
        state.handle_line(&buffer);
    }

    StatusCode::OK
}

/// Short-lived loopback endpoint receiving decoder progress
///
/// The server task stops when the endpoint is dropped.
pub struct ProgressEndpoint {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ProgressEndpoint {
    /// Binds to an ephemeral loopback port and starts serving
    pub async fn start(input_size: u64, progress: Option<ProgressFn>) -> DecodeResult<Self> {
        let listener = TcpListener::bind(decoder::PROGRESS_BIND_ADDR)
            .await
            .map_err(DecodeError::Endpoint)?;
        let addr = listener.local_addr().map_err(DecodeError::Endpoint)?;

        let app = Router::new()
            .fallback(receive_progress)
            .with_state(EndpointState {
                input_size,
                progress,
            });

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Decoder progress endpoint stopped: {}", e);
            }
        });

        debug!("Decoder progress endpoint listening on {}", addr);
        Ok(Self { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL handed to the decoder's `-progress` option
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for ProgressEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of decoding one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub output: PathBuf,
    /// Output already existed and the decoder was not run
    pub skipped: bool,
}

/// Invokes the external decoder for downloaded encrypted files
#[derive(Debug, Clone)]
pub struct DecodeStage {
    program: String,
    decoded_ext: String,
    cancel: CancellationToken,
}

impl DecodeStage {
    pub fn new(program: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            program: program.into(),
            decoded_ext: decoder::DECODED_EXTENSION.to_string(),
            cancel,
        }
    }

    pub fn with_decoded_ext(mut self, ext: impl Into<String>) -> Self {
        self.decoded_ext = ext.into();
        self
    }

    /// Where the decoded output of `input` is written
    pub fn output_path(&self, input: &Path) -> PathBuf {
        swap_extension(input, &self.decoded_ext)
    }

    /// Output format passed to the decoder, from the decoded extension
    fn output_format(&self) -> &str {
        match self.decoded_ext.trim_start_matches('.') {
            "m4a" | "m4b" => "ipod",
            "mka" => "matroska",
            ext => ext,
        }
    }

    /// Decodes `input` next to itself and removes it on success
    ///
    /// The decoder writes to `<output>.part`, which is renamed into place only
    /// after a successful exit. An existing output is treated as already
    /// decoded. On failure the encrypted input is left in place and the
    /// partial output is removed.
    pub async fn decode(
        &self,
        input: &Path,
        key: &ActivationKey,
        progress: Option<ProgressFn>,
    ) -> DecodeResult<DecodeOutcome> {
        let output = self.output_path(input);

        if output.exists() {
            debug!("Already decoded: {}", output.display());
            remove_if_present(input).await?;
            return Ok(DecodeOutcome {
                output,
                skipped: true,
            });
        }

        let input_size = match tokio::fs::metadata(input).await {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                return Err(DecodeError::MissingInput {
                    path: input.to_path_buf(),
                })
            }
        };

        if let Some(progress) = &progress {
            progress(input_size, 0);
        }

        let partial = partial_path(&output);
        remove_if_present(&partial).await?;

        let endpoint = ProgressEndpoint::start(input_size, progress.clone()).await?;
        let result = self.run_decoder(input, &partial, key, &endpoint).await;
        drop(endpoint);
        if let Err(e) = result {
            if let Err(cleanup) = remove_if_present(&partial).await {
                warn!("Could not remove {}: {}", partial.display(), cleanup);
            }
            return Err(e);
        }
        tokio::fs::rename(&partial, &output).await?;

        // Output is smaller than the input; report completion explicitly
        if let Some(progress) = &progress {
            progress(input_size, input_size);
        }

        tokio::fs::remove_file(input).await?;
        info!("Decoded {}", output.display());

        Ok(DecodeOutcome {
            output,
            skipped: false,
        })
    }

    async fn run_decoder(
        &self,
        input: &Path,
        output: &Path,
        key: &ActivationKey,
        endpoint: &ProgressEndpoint,
    ) -> DecodeResult<()> {
        let dir = input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let input_name = input.file_name().unwrap_or(input.as_os_str());
        let output_name = output.file_name().unwrap_or(output.as_os_str());

        let mut command = Command::new(&self.program);
        command
            .arg("-y")
            .arg("-activation_bytes")
            .arg(key.as_str())
            .arg("-progress")
            .arg(endpoint.url())
            .arg("-i")
            .arg(input_name)
            .args(["-vn", "-c:a", "copy", "-f"])
            .arg(self.output_format())
            .arg(output_name)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if self.cancel.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }

        debug!("Running {} on {}", self.program, input.display());
        let child = command.spawn().map_err(|source| DecodeError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DecodeError::Cancelled),
            result = child.wait_with_output() => result?,
        };

        if result.status.success() {
            return Ok(());
        }

        Err(DecodeError::Failed {
            status: result.status.to_string(),
            stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        })
    }
}

async fn remove_if_present(path: &Path) -> DecodeResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
