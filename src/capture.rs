//! Sequenced, typed output buffer for one execution.
//!
//! Raw process output interleaves non-deterministically across stdout, stderr
//! and structured markers; the capture buffer stamps every chunk with a
//! strictly monotonic `sequence` so the total order is always reconstructible.
//! The buffer is bounded: once it exceeds its configured maximum the oldest
//! chunks are dropped. Callers that need guaranteed retention subscribe with
//! [`OutputCapture::stream_to`] instead of reading only at the end.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Minimum retained chunks, regardless of configuration.
pub const MIN_BUFFER_SIZE: usize = 100;
/// Default retained chunks.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Discriminant for chunk filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Stdout,
    Stderr,
    Plot,
    Variable,
    Error,
}

/// A captured plot image emitted by the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotData {
    pub id: String,
    pub format: PlotFormat,
    /// Encoded payload (base64 for png, raw text for svg/html)
    pub data: String,
    #[serde(default)]
    pub metadata: PlotMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotFormat {
    Png,
    Svg,
    Html,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotMetadata {
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xlabel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ylabel: Option<String>,
}

/// Snapshot of a named value at the moment of capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableData {
    pub name: String,
    /// Free-form type descriptor, e.g. "pandas.DataFrame"
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    /// Truncated textual representation for values too large to serialize
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A captured error (harness exception, timeout notice, crash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Tagged union over everything one execution can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkData {
    Stdout { text: String },
    Stderr { text: String },
    Plot(PlotData),
    Variable(VariableData),
    Error(ErrorData),
}

impl ChunkData {
    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkData::Stdout { .. } => ChunkKind::Stdout,
            ChunkData::Stderr { .. } => ChunkKind::Stderr,
            ChunkData::Plot(_) => ChunkKind::Plot,
            ChunkData::Variable(_) => ChunkKind::Variable,
            ChunkData::Error(_) => ChunkKind::Error,
        }
    }
}

/// One captured unit of output, totally ordered by `sequence` within an
/// execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: ChunkData,
}

/// Which raw stream a line arrived on, for unclassified fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

pub type ChunkFilter = Box<dyn Fn(&OutputChunk) -> bool + Send>;

struct Subscriber {
    sink: mpsc::UnboundedSender<OutputChunk>,
    filter: Option<ChunkFilter>,
}

impl Subscriber {
    fn wants(&self, chunk: &OutputChunk) -> bool {
        self.filter.as_ref().map(|f| f(chunk)).unwrap_or(true)
    }
}

/// Stateful capture buffer, one instance per execution.
pub struct OutputCapture {
    buffer: VecDeque<OutputChunk>,
    next_sequence: u64,
    max_buffer_size: usize,
    subscribers: Vec<Subscriber>,
}

// matplotlib prints this repr when a figure is the value of an expression
// statement; treat it as a plot placeholder rather than plain text.
static FIGURE_REPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<Figure size (\d+)x(\d+) with \d+ Axes>$").unwrap()
});

impl OutputCapture {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            next_sequence: 0,
            max_buffer_size: max_buffer_size.max(MIN_BUFFER_SIZE),
            subscribers: Vec::new(),
        }
    }

    /// Append one chunk: assigns the next sequence value, stamps the current
    /// time, notifies live subscribers, and evicts oldest-first past the
    /// buffer cap. Returns the assigned sequence.
    pub fn add_chunk(&mut self, data: ChunkData) -> u64 {
        let chunk = OutputChunk {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            data,
        };
        self.next_sequence += 1;

        // Forward to subscribers before eviction so streamed readers see
        // every chunk even when the buffer is full. Closed sinks detach.
        self.subscribers
            .retain(|sub| !sub.wants(&chunk) || sub.sink.send(chunk.clone()).is_ok());

        self.buffer.push_back(chunk);
        while self.buffer.len() > self.max_buffer_size {
            // Silent oldest-first drop; sequence values are never reused.
            self.buffer.pop_front();
        }

        self.next_sequence - 1
    }

    pub fn add_stdout(&mut self, text: impl Into<String>) -> u64 {
        self.add_chunk(ChunkData::Stdout { text: text.into() })
    }

    pub fn add_stderr(&mut self, text: impl Into<String>) -> u64 {
        self.add_chunk(ChunkData::Stderr { text: text.into() })
    }

    pub fn add_plot(&mut self, plot: PlotData) -> u64 {
        self.add_chunk(ChunkData::Plot(plot))
    }

    pub fn add_variable(&mut self, variable: VariableData) -> u64 {
        self.add_chunk(ChunkData::Variable(variable))
    }

    pub fn add_error(&mut self, error: ErrorData) -> u64 {
        self.add_chunk(ChunkData::Error(error))
    }

    /// Snapshot of retained chunks in sequence order, optionally filtered by
    /// kind.
    pub fn get_output(&self, kind: Option<ChunkKind>) -> Vec<OutputChunk> {
        self.buffer
            .iter()
            .filter(|c| kind.map(|k| c.data.kind() == k).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Concatenate the text of all retained chunks of a text kind. The
    /// canonical way to reconstruct the stdout or stderr transcript.
    pub fn get_output_as_string(&self, kind: ChunkKind) -> String {
        let mut out = String::new();
        for chunk in &self.buffer {
            match (&chunk.data, kind) {
                (ChunkData::Stdout { text }, ChunkKind::Stdout) => out.push_str(text),
                (ChunkData::Stderr { text }, ChunkKind::Stderr) => out.push_str(text),
                _ => {}
            }
        }
        out
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Replay every buffered chunk to `sink`, then keep forwarding new chunks
    /// matching `filter` until the sink is dropped or the capture ends.
    pub fn stream_to(
        &mut self,
        sink: mpsc::UnboundedSender<OutputChunk>,
        filter: Option<ChunkFilter>,
    ) {
        let subscriber = Subscriber { sink, filter };
        for chunk in &self.buffer {
            if subscriber.wants(chunk) && subscriber.sink.send(chunk.clone()).is_err() {
                return;
            }
        }
        self.subscribers.push(subscriber);
    }

    /// Interpret one raw line as a structured marker if possible, otherwise
    /// retain it as plain text on its origin stream. Never fails: malformed
    /// markers fall through to text.
    pub fn process_special_output(&mut self, line: &str, origin: StreamOrigin) {
        let trimmed = line.trim();

        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if self.route_marker(&value) {
                    return;
                }
                debug!("unrecognized structured line kept as text");
            }
        }

        if let Some(plot) = figure_repr_to_plot(trimmed) {
            self.add_plot(plot);
            return;
        }

        match origin {
            StreamOrigin::Stdout => self.add_stdout(format!("{line}\n")),
            StreamOrigin::Stderr => self.add_stderr(format!("{line}\n")),
        };
    }

    /// Route a parsed marker object by its `type` discriminator. Returns false
    /// when the object is not a recognized marker.
    fn route_marker(&mut self, value: &serde_json::Value) -> bool {
        let Some(marker_type) = value.get("type").and_then(|t| t.as_str()) else {
            return false;
        };
        let data = value.get("data");

        match marker_type {
            "plot" => {
                if let Some(plot) = data.and_then(|d| serde_json::from_value(d.clone()).ok()) {
                    self.add_plot(plot);
                    return true;
                }
                false
            }
            "variable" => {
                if let Some(variable) = data.and_then(|d| serde_json::from_value(d.clone()).ok()) {
                    self.add_variable(variable);
                    return true;
                }
                false
            }
            "variables" => {
                let Some(map) = data.and_then(|d| d.as_object()) else {
                    return false;
                };
                for (name, payload) in map {
                    let variable = match serde_json::from_value::<VariableData>(payload.clone()) {
                        Ok(mut v) => {
                            v.name = name.clone();
                            v
                        }
                        // Bare value without metadata: wrap it.
                        Err(_) => VariableData {
                            name: name.clone(),
                            type_name: json_type_name(payload).to_string(),
                            value: payload.clone(),
                            shape: None,
                            dtype: None,
                            preview: None,
                            size: None,
                        },
                    };
                    self.add_variable(variable);
                }
                true
            }
            _ => false,
        }
    }
}

fn figure_repr_to_plot(line: &str) -> Option<PlotData> {
    let caps = FIGURE_REPR.captures(line)?;
    let width: f64 = caps[1].parse().ok()?;
    let height: f64 = caps[2].parse().ok()?;
    Some(PlotData {
        id: uuid::Uuid::new_v4().to_string(),
        format: PlotFormat::Png,
        data: String::new(),
        metadata: PlotMetadata {
            width,
            height,
            title: None,
            xlabel: None,
            ylabel: None,
        },
    })
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "NoneType",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        serde_json::Value::Number(_) => "float",
        serde_json::Value::String(_) => "str",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "dict",
    }
}
