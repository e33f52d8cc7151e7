use crate::core::workflow::model::Step;
use crate::core::workflow::vars::as_number;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

const TRUNCATION_MARKER: &str = "...(truncated)";

/// Receives process output as it is produced.
pub trait OutputSink: Send + Sync {
    fn write(&self, chunk: &[u8]);
}

/// In-memory sink that keeps at most `limit` bytes; later bytes are dropped.
#[derive(Debug)]
pub struct BoundedBuffer {
    limit: usize,
    inner: Mutex<Vec<u8>>,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Current contents as lossy UTF-8.
    pub fn snapshot(&self) -> String {
        match self.inner.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl OutputSink for BoundedBuffer {
    fn write(&self, chunk: &[u8]) {
        let mut buf = match self.inner.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        let room = self.limit.saturating_sub(buf.len());
        let take = room.min(chunk.len());
        buf.extend_from_slice(&chunk[..take]);
    }
}

/// `args.max_output_bytes` as a positive byte count.
pub fn output_limit(step: &Step) -> Option<usize> {
    let raw = step.args.get("max_output_bytes")?;
    let limit = match raw {
        Value::Null => return None,
        other => as_number(other)?,
    };
    (limit >= 1.0).then_some(limit as usize)
}

/// Truncate captured output to `args.max_output_bytes` and, when `args.output_path` is set,
/// also write both streams to timestamped log files under that directory.
pub fn apply_output_limits(step: &Step, stdout: String, stderr: String) -> (String, String) {
    let (stdout, stderr) = match output_limit(step) {
        Some(limit) => (truncate(stdout, limit), truncate(stderr, limit)),
        None => (stdout, stderr),
    };

    if let Some(dir) = step
        .args
        .get("output_path")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        if let Err(err) = write_output_logs(Path::new(dir), step, &stdout, &stderr) {
            tracing::warn!(step = %step.name, path = %dir, error = %err, "failed to write output logs");
        }
    }
    (stdout, stderr)
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    text
}

fn write_output_logs(dir: &Path, step: &Step, stdout: &str, stderr: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let ts = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let name = match step.name.trim() {
        "" => "step".to_string(),
        name => name.replace(' ', "_"),
    };
    std::fs::write(dir.join(format!("{name}-{ts}-stdout.log")), stdout)?;
    std::fs::write(dir.join(format!("{name}-{ts}-stderr.log")), stderr)?;
    Ok(())
}
