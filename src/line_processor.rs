use std::io;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::sink::{ResultSink, RunContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// The line exceeded the ceiling and was skipped up to its newline.
    Oversized { discarded: usize },
}

/// Line reader that never buffers more than `max_size` bytes of one line.
pub struct BoundedLineReader<R> {
    reader: R,
    max_size: usize,
}

impl<R: AsyncBufRead + Unpin> BoundedLineReader<R> {
    pub fn new(reader: R, max_size: usize) -> Self {
        Self {
            reader,
            max_size: max_size.max(1),
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<LineRead>> {
        let mut line = Vec::new();
        let mut oversized = false;
        let mut discarded = 0_usize;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(if oversized {
                    Some(LineRead::Oversized { discarded })
                } else if line.is_empty() {
                    None
                } else {
                    Some(LineRead::Line(finish_line(line)))
                });
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk_len = newline.map(|idx| idx + 1).unwrap_or(available.len());
            if oversized {
                discarded += chunk_len;
            } else {
                let content_len = newline.unwrap_or(chunk_len);
                if line.len() + content_len > self.max_size {
                    oversized = true;
                    discarded = line.len() + chunk_len;
                    line = Vec::new();
                } else {
                    line.extend_from_slice(&available[..chunk_len]);
                }
            }
            self.reader.consume(chunk_len);

            if newline.is_some() {
                return Ok(Some(if oversized {
                    LineRead::Oversized { discarded }
                } else {
                    LineRead::Line(finish_line(line))
                }));
            }
        }
    }
}

fn finish_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Forward(Value),
    /// Several JSON values shared one line; only the first is kept.
    ForwardFirst { value: Value, extra: String },
    Invalid(String),
    MissingHosts,
    Blank,
}

pub fn classify_line(line: &str) -> LineOutcome {
    let mut stream = serde_json::Deserializer::from_str(line).into_iter::<Value>();
    let value = match stream.next() {
        None => return LineOutcome::Blank,
        Some(Err(err)) => return LineOutcome::Invalid(err.to_string()),
        Some(Ok(value)) => value,
    };
    if value.get("hosts").is_none() {
        return LineOutcome::MissingHosts;
    }
    let extra = line[stream.byte_offset()..].trim();
    if extra.is_empty() {
        LineOutcome::Forward(value)
    } else {
        LineOutcome::ForwardFirst {
            value,
            extra: extra.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub lines: usize,
    pub forwarded: usize,
    pub dropped: usize,
    pub oversized: usize,
    pub read_error: Option<String>,
}

/// Hands parsed stdout results to the sink with the run's metadata.
#[derive(Clone)]
pub struct ResultForwarder {
    sink: Arc<dyn ResultSink>,
    context: RunContext,
}

impl ResultForwarder {
    pub fn new(sink: Arc<dyn ResultSink>, context: RunContext) -> Self {
        Self { sink, context }
    }

    async fn forward(&self, value: Value) -> bool {
        match self.sink.forward(&self.context, value).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "result forward failed executor={} error={err:#}",
                    self.context.executor_name
                );
                false
            }
        }
    }
}

pub async fn process_stdout<R>(
    reader: R,
    max_size: usize,
    forwarder: &ResultForwarder,
) -> StreamSummary
where
    R: AsyncBufRead + Unpin,
{
    let executor = forwarder.context.executor_name.clone();
    let mut lines = BoundedLineReader::new(reader, max_size);
    let mut summary = StreamSummary::default();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(LineRead::Line(line))) => line,
            Ok(Some(LineRead::Oversized { discarded })) => {
                summary.oversized += 1;
                warn!(
                    "stdout line dropped executor={executor} bytes={discarded} max_size={max_size}; raise max_size for this executor"
                );
                continue;
            }
            Ok(None) => break,
            Err(err) => {
                warn!("stdout read failed executor={executor} error={err}");
                summary.read_error = Some(err.to_string());
                break;
            }
        };
        summary.lines += 1;
        debug!("stdout executor={executor} line={line}");
        match classify_line(&line) {
            LineOutcome::Forward(value) => {
                if forwarder.forward(value).await {
                    summary.forwarded += 1;
                }
            }
            LineOutcome::ForwardFirst { value, extra } => {
                warn!(
                    "stdout line carried extra data executor={executor} extra_bytes={}; only the first object is sent",
                    extra.len()
                );
                if forwarder.forward(value).await {
                    summary.forwarded += 1;
                }
            }
            LineOutcome::Invalid(err) => {
                summary.dropped += 1;
                warn!("stdout line is not json executor={executor} error={err}");
            }
            LineOutcome::MissingHosts => {
                summary.dropped += 1;
                warn!("stdout json lacks hosts key executor={executor}");
            }
            LineOutcome::Blank => {}
        }
    }
    summary
}

pub async fn process_stderr<R>(reader: R, max_size: usize, executor: &str) -> StreamSummary
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = BoundedLineReader::new(reader, max_size);
    let mut summary = StreamSummary::default();
    loop {
        match lines.next_line().await {
            Ok(Some(LineRead::Line(line))) => {
                summary.lines += 1;
                info!("stderr executor={executor} line={line}");
            }
            Ok(Some(LineRead::Oversized { discarded })) => {
                summary.oversized += 1;
                warn!("stderr line dropped executor={executor} bytes={discarded} max_size={max_size}");
            }
            Ok(None) => break,
            Err(err) => {
                warn!("stderr read failed executor={executor} error={err}");
                summary.read_error = Some(err.to_string());
                break;
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::Mutex;
    use tokio::io::BufReader;

    #[derive(Default)]
    struct CapturingSink {
        forwarded: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ResultSink for CapturingSink {
        async fn forward(&self, _ctx: &RunContext, payload: Value) -> Result<()> {
            self.forwarded.lock().expect("lock sink").push(payload);
            Ok(())
        }
    }

    fn context() -> RunContext {
        RunContext {
            executor_name: "nmap".to_owned(),
            command: "nmap".to_owned(),
            execution_ids: vec![json!(1)],
            workspaces: vec!["w".to_owned()],
            args: Map::new(),
            started_at_ms: 0,
        }
    }

    async fn read_all(input: &'static [u8], max_size: usize, capacity: usize) -> Vec<LineRead> {
        let mut reader =
            BoundedLineReader::new(BufReader::with_capacity(capacity, input), max_size);
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().await.expect("read line") {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn reader_strips_newlines_and_keeps_last_unterminated_line() {
        let lines = read_all(b"one\r\ntwo\n\nthree", 16, 4).await;
        assert_eq!(
            lines,
            vec![
                LineRead::Line("one".to_owned()),
                LineRead::Line("two".to_owned()),
                LineRead::Line(String::new()),
                LineRead::Line("three".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn reader_discards_oversized_line_up_to_newline() {
        let lines = read_all(b"short\n0123456789abcdef\nnext\n", 8, 4).await;
        assert_eq!(
            lines,
            vec![
                LineRead::Line("short".to_owned()),
                LineRead::Oversized { discarded: 17 },
                LineRead::Line("next".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn reader_accepts_line_exactly_at_limit() {
        let lines = read_all(b"12345678\n", 8, 3).await;
        assert_eq!(lines, vec![LineRead::Line("12345678".to_owned())]);
    }

    #[tokio::test]
    async fn reader_decodes_invalid_utf8_lossily() {
        let lines = read_all(b"a\xffb\n", 16, 16).await;
        assert_eq!(lines, vec![LineRead::Line("a\u{fffd}b".to_owned())]);
    }

    #[test]
    fn classify_line_covers_each_outcome() {
        assert_eq!(
            classify_line(r#"{"hosts":[]}"#),
            LineOutcome::Forward(json!({"hosts": []}))
        );
        assert_eq!(
            classify_line(r#"{"hosts":[1]}{"hosts":[2]}"#),
            LineOutcome::ForwardFirst {
                value: json!({"hosts": [1]}),
                extra: r#"{"hosts":[2]}"#.to_owned(),
            }
        );
        assert_eq!(classify_line(r#"{"out":"bad_json"}"#), LineOutcome::MissingHosts);
        assert!(matches!(classify_line("Starting scan"), LineOutcome::Invalid(_)));
        assert_eq!(classify_line("   "), LineOutcome::Blank);
    }

    #[tokio::test]
    async fn stdout_forwards_only_valid_results() {
        let sink = Arc::new(CapturingSink::default());
        let forwarder = ResultForwarder::new(sink.clone(), context());
        let input: &[u8] = b"progress 10%\n{\"out\":\"bad_json\"}\n{\"hosts\":[{\"ip\":\"a\"}]}{\"hosts\":[]}\nxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\n";
        let summary = process_stdout(BufReader::new(input), 48, &forwarder).await;

        assert_eq!(summary.lines, 3);
        assert_eq!(summary.forwarded, 1);
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.oversized, 1);
        let forwarded = sink.forwarded.lock().expect("lock sink");
        assert_eq!(*forwarded, vec![json!({"hosts": [{"ip": "a"}]})]);
    }

    #[tokio::test]
    async fn stderr_counts_lines() {
        let input: &[u8] = b"warning: slow\nwarning: slower\n";
        let summary = process_stderr(BufReader::new(input), 64, "nmap").await;
        assert_eq!(summary.lines, 2);
        assert_eq!(summary.forwarded, 0);
    }
}
