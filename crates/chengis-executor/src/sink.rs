//! Output line collection and secret masking.
//!
//! Step output is streamed line by line to the context's sink as it is
//! produced, buffered up to 4 KiB and flushed on newline or after 200 ms
//! of idleness. Known secret values are replaced with `***` before a
//! line reaches the sink or storage.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::sleep;

use chengis_core::executor::{LineSink, LogSource};

/// Flush a partial line once the buffer reaches this size.
pub const LINE_BUFFER_BYTES: usize = 4096;
/// Flush a partial line after this long without new output.
pub const IDLE_FLUSH: Duration = Duration::from_millis(200);

/// Replace every exact occurrence of a known secret value with `***`.
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    let mut masked = text.to_string();
    for value in secrets {
        if value.is_empty() {
            continue;
        }
        masked = masked.replace(value.as_str(), "***");
    }
    masked
}

/// Drain a child stream to the sink, returning the full masked output.
pub async fn collect_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    source: LogSource,
    sink: Arc<dyn LineSink>,
    secrets: Arc<Vec<String>>,
) -> String {
    let mut output = String::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = sleep(IDLE_FLUSH), if !pending.is_empty() => {
                emit(&mut output, &mut pending, source, &sink, &secrets);
                continue;
            }
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte == b'\n' {
                        emit(&mut output, &mut pending, source, &sink, &secrets);
                    } else {
                        pending.push(byte);
                        if pending.len() >= LINE_BUFFER_BYTES {
                            emit(&mut output, &mut pending, source, &sink, &secrets);
                        }
                    }
                }
            }
            Err(_) => break,
        }
    }
    if !pending.is_empty() {
        emit(&mut output, &mut pending, source, &sink, &secrets);
    }
    output
}

fn emit(
    output: &mut String,
    pending: &mut Vec<u8>,
    source: LogSource,
    sink: &Arc<dyn LineSink>,
    secrets: &[String],
) {
    let line = String::from_utf8_lossy(pending);
    let masked = mask_secrets(&line, secrets);
    sink.line(source, &masked);
    output.push_str(&masked);
    output.push('\n');
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        lines: Mutex<Vec<(LogSource, String)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lines: Mutex::new(Vec::new()),
            })
        }

        fn lines(&self) -> Vec<(LogSource, String)> {
            self.lines.lock().unwrap().clone()
        }
    }

    impl LineSink for RecordingSink {
        fn line(&self, source: LogSource, line: &str) {
            self.lines.lock().unwrap().push((source, line.to_string()));
        }
    }

    #[test]
    fn masks_every_occurrence() {
        let secrets = vec!["hunter2".to_string()];
        assert_eq!(
            mask_secrets("token=hunter2 again hunter2", &secrets),
            "token=*** again ***"
        );
    }

    #[test]
    fn empty_secret_never_matches() {
        let secrets = vec![String::new()];
        assert_eq!(mask_secrets("plain", &secrets), "plain");
    }

    #[tokio::test]
    async fn splits_lines_and_masks() {
        let sink = RecordingSink::new();
        let secrets = Arc::new(vec!["s3cret".to_string()]);
        let input: &[u8] = b"hello\npassword is s3cret\n";
        let output = collect_stream(
            input,
            LogSource::Stdout,
            sink.clone() as Arc<dyn LineSink>,
            secrets,
        )
        .await;

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1, "hello");
        assert_eq!(lines[1].1, "password is ***");
        assert_eq!(output, "hello\npassword is ***\n");
    }

    #[tokio::test]
    async fn oversized_line_flushes_at_buffer_limit() {
        let sink = RecordingSink::new();
        let long = vec![b'x'; LINE_BUFFER_BYTES + 100];
        let output = collect_stream(
            long.as_slice(),
            LogSource::Stderr,
            sink.clone() as Arc<dyn LineSink>,
            Arc::new(vec![]),
        )
        .await;

        let lines = sink.lines();
        // One full buffer plus the 100-byte tail.
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1.len(), LINE_BUFFER_BYTES);
        assert_eq!(lines[1].1.len(), 100);
        assert_eq!(output.len(), LINE_BUFFER_BYTES + 100 + 2);
    }

    #[tokio::test]
    async fn trailing_partial_line_is_flushed() {
        let sink = RecordingSink::new();
        let input: &[u8] = b"no newline at end";
        collect_stream(
            input,
            LogSource::Stdout,
            sink.clone() as Arc<dyn LineSink>,
            Arc::new(vec![]),
        )
        .await;
        assert_eq!(sink.lines()[0].1, "no newline at end");
    }
}
