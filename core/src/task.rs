use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use coersion_common::config::FfmpegConfig;
use coersion_common::frame::FrameRequest;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes of producer stderr kept for error messages.
const STDERR_TAIL: usize = 4096;

/// Image encoding requested from the producer for a scaled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Uncompressed bitmap in the configured pixel format.
    Bmp,
    Png,
}

impl OutputFormat {
    fn codec(self) -> &'static str {
        match self {
            OutputFormat::Bmp => "bmp",
            OutputFormat::Png => "png",
        }
    }
}

/// What a producer invocation should emit on stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameJob {
    /// The first key frame of the source, as JPEG, unscaled.
    Still { source: String },
    /// One frame at the request's offset, scaled to its dimensions.
    Scaled {
        request: FrameRequest,
        format: OutputFormat,
    },
}

impl FrameJob {
    pub fn bitmap(request: FrameRequest) -> Self {
        FrameJob::Scaled {
            request,
            format: OutputFormat::Bmp,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            FrameJob::Still { source } => source,
            FrameJob::Scaled { request, .. } => request.source(),
        }
    }

    /// Full argument list for the producer binary.
    pub fn arguments(&self, config: &FfmpegConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            config.loglevel.clone(),
            "-nostdin".into(),
        ];
        match self {
            FrameJob::Still { source } => {
                args.extend(
                    [
                        "-ss",
                        "0",
                        "-i",
                        source.as_str(),
                        "-vframes",
                        "1",
                        "-q:v",
                        "2",
                        "-vf",
                        r"select=eq(pict_type\,PICT_TYPE_I)",
                        "-vsync",
                        "0",
                        "-f",
                        "image2pipe",
                        "-vcodec",
                        "mjpeg",
                    ]
                    .map(String::from),
                );
            }
            FrameJob::Scaled { request, format } => {
                args.extend([
                    "-ss".into(),
                    request.seek_position(),
                    "-i".into(),
                    request.source().to_string(),
                    "-vframes".into(),
                    "1".into(),
                    "-vf".into(),
                    request.scale_filter(),
                ]);
                if *format == OutputFormat::Bmp {
                    args.extend(["-pix_fmt".into(), config.pixel_format.clone()]);
                }
                args.extend(
                    ["-f", "image2pipe", "-vcodec", format.codec(), "-q:v", "2"].map(String::from),
                );
            }
        }
        args.push("-".into());
        args
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to launch frame producer {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("producer output stream already taken")]
    OutputTaken,
    #[error("failed to read producer output: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to wait for producer: {0}")]
    Wait(#[source] std::io::Error),
    #[error("producer exited with {}: {}", describe_exit(*.code), .stderr)]
    Exited { code: Option<i32>, stderr: String },
    #[error("producer exited successfully but wrote no output")]
    EmptyOutput,
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".into(),
    }
}

/// A producer invocation that has been assembled but not launched.
///
/// Starting consumes the task, so a task can never be started twice.
#[derive(Debug, Clone)]
pub struct FrameTask {
    job: FrameJob,
    binary: String,
    args: Vec<String>,
    detach_grace: Duration,
}

impl FrameTask {
    pub fn new(job: FrameJob, config: &FfmpegConfig) -> Self {
        let args = job.arguments(config);
        Self {
            job,
            binary: config.binary.clone(),
            args,
            detach_grace: config.detach_grace(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Launch the producer. Its stdout is piped from the moment of spawn and
    /// fills concurrently with whatever the caller does next.
    pub fn start(self) -> Result<FrameProcess, TaskError> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::Launch {
                binary: self.binary.clone(),
                source: e,
            })?;

        let stdout = child.stdout.take();
        let stderr_tail = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

        debug!(
            pid = child.id(),
            binary = self.binary,
            source = self.job.source(),
            args = ?self.args,
            "frame producer started"
        );

        Ok(FrameProcess {
            child,
            stdout,
            stderr_tail,
            source: self.job.source().to_string(),
            detach_grace: self.detach_grace,
        })
    }
}

/// A running producer. Dropping it without `wait` or `detach` kills the
/// process.
pub struct FrameProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_tail: Option<JoinHandle<String>>,
    source: String,
    detach_grace: Duration,
}

impl FrameProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hand out the stdout stream. Only one caller ever gets it.
    pub fn take_output(&mut self) -> Result<ChildStdout, TaskError> {
        self.stdout.take().ok_or(TaskError::OutputTaken)
    }

    /// Close any unread output and wait for exit. A non-zero exit becomes
    /// `TaskError::Exited` with the tail of the producer's stderr.
    pub async fn wait(mut self) -> Result<ExitStatus, TaskError> {
        drop(self.stdout.take());
        let status = self.child.wait().await.map_err(TaskError::Wait)?;
        let stderr = match self.stderr_tail.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            warn!(source = self.source, %status, stderr = %stderr, "frame producer failed");
            return Err(TaskError::Exited {
                code: status.code(),
                stderr,
            });
        }
        debug!(source = self.source, "frame producer exited");
        Ok(status)
    }

    /// Read the whole output, then wait. A failed exit wins over a read error.
    pub async fn output(mut self) -> Result<Vec<u8>, TaskError> {
        let mut stdout = self.take_output()?;
        let mut buf = Vec::new();
        let read = stdout.read_to_end(&mut buf).await;
        drop(stdout);

        self.wait().await?;
        read.map_err(TaskError::Read)?;
        if buf.is_empty() {
            return Err(TaskError::EmptyOutput);
        }
        Ok(buf)
    }

    /// Let the producer finish in the background: its output is drained and
    /// discarded and the process is reaped. If it has not exited within the
    /// configured grace period it is killed. Outside a runtime the process
    /// is simply dropped, which kills it.
    pub fn detach(mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let grace = self.detach_grace;
        runtime.spawn(async move {
            let stdout = self.stdout.take();
            let child = &mut self.child;
            let drained = async move {
                if let Some(mut stdout) = stdout {
                    let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
                }
                child.wait().await
            };
            let outcome = tokio::time::timeout(grace, drained).await;
            match outcome {
                Ok(Ok(status)) => {
                    debug!(source = self.source, %status, "detached frame producer exited");
                }
                Ok(Err(e)) => {
                    warn!(source = self.source, error = %e, "failed to reap detached frame producer");
                }
                Err(_) => {
                    warn!(
                        source = self.source,
                        grace_secs = grace.as_secs(),
                        "detached frame producer still running, killing"
                    );
                    if let Err(e) = self.child.kill().await {
                        warn!(source = self.source, error = %e, "failed to kill frame producer");
                    }
                }
            }
        });
    }
}

async fn read_tail(mut stderr: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL {
                    let excess = tail.len() - STDERR_TAIL;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}

/// Check whether the producer binary runs. Logs a warning if not.
pub async fn check_producer_available(config: &FfmpegConfig) -> bool {
    match Command::new(&config.binary).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!(binary = config.binary, "frame producer is available");
            true
        }
        Ok(_) => {
            warn!(
                binary = config.binary,
                "frame producer returned non-zero for -version; extraction may fail"
            );
            false
        }
        Err(e) => {
            warn!(
                binary = config.binary,
                error = %e,
                "frame producer not found; every extraction and match request will fail"
            );
            false
        }
    }
}
