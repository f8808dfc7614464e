//! Stdio tool server in front of one [`Infinity`] engine.
//!
//! Requests arrive as JSON-RPC 2.0 bodies behind `Content-Length` headers.
//! Each tool maps onto one engine call; engine failures come back as tool
//! results flagged `isError` so the client sees the message.

use anyhow::{bail, Context, Result};
use infinity::{Config, Infinity, Notice};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::io::{self, BufRead, BufReader, Read, Write};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_FRAME_BYTES: usize = 1 << 20;
const MAX_QUERY_BYTES: usize = 8 << 10;
const MAX_KEYS: usize = 1_000;
const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 1_000;

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;

fn main() -> Result<()> {
    // stdout carries frames, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = Config::from_env().context("INFINITY_DIR must name the data directory")?;
    let infinity = Infinity::open(config).context("failed to open infinity")?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut frames = Frames::new(BufReader::new(stdin.lock()), stdout.lock());
    serve(&infinity, &mut frames)?;

    info!("stdin closed, shutting down");
    infinity.close().context("failed to close infinity")?;
    Ok(())
}

/// Answers requests until the input ends.
fn serve<R: BufRead, W: Write>(infinity: &Infinity, frames: &mut Frames<R, W>) -> Result<()> {
    loop {
        let request = match frames.read() {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "unreadable frame");
                frames.send(&Response::failure(
                    JsonValue::Null,
                    PARSE_ERROR,
                    format!("parse error: {e:#}"),
                ))?;
                continue;
            }
        };
        if let Some(response) = dispatch(infinity, request) {
            frames.send(&response)?;
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// `Content-Length` framed JSON over a reader and a writer.
struct Frames<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Frames<R, W> {
    fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Next request, or `None` at end of input.
    ///
    /// A body that isn't a request is still consumed whole, so the frame
    /// after it lines up.
    fn read(&mut self) -> Result<Option<Request>> {
        let Some(length) = self.header()? else {
            return Ok(None);
        };
        let mut body = vec![0_u8; length];
        self.input.read_exact(&mut body)?;
        let request = serde_json::from_slice(&body).context("body is not a JSON-RPC request")?;
        Ok(Some(request))
    }

    /// Reads header lines up to the blank separator and returns the body
    /// length.
    fn header(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut line = String::new();
        loop {
            line.clear();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                length = Some(value.trim().parse::<usize>().context("bad Content-Length")?);
            }
        }
        match length {
            None => bail!("frame has no Content-Length"),
            Some(n) if n > MAX_FRAME_BYTES => {
                bail!("frame of {n} bytes is over the {MAX_FRAME_BYTES} byte cap")
            }
            Some(n) => Ok(Some(n)),
        }
    }

    fn send(&mut self, response: &Response) -> Result<()> {
        let body = serde_json::to_vec(response)?;
        write!(self.output, "Content-Length: {}\r\n\r\n", body.len())?;
        self.output.write_all(&body)?;
        self.output.flush()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    /// Absent for notifications, which get no response.
    #[serde(default)]
    id: Option<JsonValue>,
    method: String,
    #[serde(default)]
    params: JsonValue,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl Response {
    fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: JsonValue, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

fn dispatch(infinity: &Infinity, request: Request) -> Option<Response> {
    let Request { id, method, params } = request;
    debug!(method = %method, "request");
    let id = id?;
    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "infinity-server", "version": env!("CARGO_PKG_VERSION") }
        }),
        "tools/list" => json!({ "tools": Tool::catalog() }),
        "tools/call" => match Tool::from_params(params).and_then(|tool| tool.run(infinity)) {
            Ok(reply) => reply.into_json(false),
            Err(e) => Reply::text(format!("tool error: {e:#}")).into_json(true),
        },
        "ping" => json!({}),
        other => {
            return Some(Response::failure(
                id,
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ))
        }
    };
    Some(Response::success(id, result))
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Call {
    name: String,
    #[serde(default)]
    arguments: JsonValue,
}

#[derive(Debug, Deserialize)]
struct Search {
    query: String,
    #[serde(default = "default_limit")]
    limit: u64,
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

impl Search {
    fn checked(self) -> Result<(String, usize)> {
        if self.query.len() > MAX_QUERY_BYTES {
            bail!("query is over the {MAX_QUERY_BYTES} byte cap");
        }
        if !(1..=MAX_LIMIT).contains(&self.limit) {
            bail!("limit must be between 1 and {MAX_LIMIT}");
        }
        Ok((self.query, self.limit as usize))
    }
}

#[derive(Debug, Deserialize)]
struct SeeArgs {
    notice: Notice,
}

#[derive(Debug, Deserialize)]
struct EtaArgs {
    keys: Vec<String>,
}

/// One engine operation, decoded from a `tools/call`.
#[derive(Debug)]
enum Tool {
    See(Notice),
    Messages(Search),
    Bouts(Search),
    Eta(Vec<String>),
    Flush,
    Audit,
}

impl Tool {
    fn from_params(params: JsonValue) -> Result<Self> {
        let Call { name, arguments } =
            serde_json::from_value(params).context("tools/call needs a tool name")?;
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        Ok(match name.as_str() {
            "see" => {
                let SeeArgs { notice } =
                    serde_json::from_value(arguments).context("notice is not valid")?;
                Tool::See(notice)
            }
            "messages" => {
                Tool::Messages(serde_json::from_value(arguments).context("query is required")?)
            }
            "bouts" => Tool::Bouts(serde_json::from_value(arguments).context("query is required")?),
            "eta" => {
                let EtaArgs { keys } = serde_json::from_value(arguments)
                    .context("keys must be an array of strings")?;
                if keys.len() > MAX_KEYS {
                    bail!("at most {MAX_KEYS} keys are allowed");
                }
                Tool::Eta(keys)
            }
            "flush" => Tool::Flush,
            "audit" => Tool::Audit,
            other => bail!("unknown tool: {other}"),
        })
    }

    fn run(self, infinity: &Infinity) -> Result<Reply> {
        Ok(match self {
            Tool::See(notice) => {
                let kind = notice.kind();
                let keys = infinity.see(notice)?;
                Reply::text(format!("accepted {kind}, {} key(s) to poll", keys.len()))
                    .with(json!({ "keys": keys }))
            }
            Tool::Messages(search) => {
                let (query, limit) = search.checked()?;
                let found: Vec<u64> = infinity.messages(&query)?.take(limit).collect();
                Reply::text(format!("found {} message(s)", found.len()))
                    .with(json!({ "messages": found }))
            }
            Tool::Bouts(search) => {
                let (query, limit) = search.checked()?;
                let found: Vec<u64> = infinity.bouts(&query)?.take(limit).collect();
                Reply::text(format!("found {} bout(s)", found.len()))
                    .with(json!({ "bouts": found }))
            }
            Tool::Eta(keys) => {
                let eta = infinity.eta(&keys);
                Reply::text(format!("eta {eta} ms")).with(json!({ "eta": eta }))
            }
            Tool::Flush => {
                infinity.flush()?;
                Reply::text("flushed".into())
            }
            Tool::Audit => {
                let report = infinity.audit();
                Reply::text(format!("{} problem(s)", report.count())).with(json!({
                    "problems": report.problems,
                    "clean": report.is_clean()
                }))
            }
        })
    }

    /// Names, descriptions and argument schemas for `tools/list`.
    fn catalog() -> Vec<JsonValue> {
        let search = json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": MAX_LIMIT }
            },
            "required": ["query"]
        });
        let empty = json!({ "type": "object", "properties": {} });
        [
            (
                "see",
                "Submit a notice (message-posted, message-seen, bout-renamed, joined, kicked-off, alias-added) for indexing. Returns the keys to poll eta with.",
                json!({
                    "type": "object",
                    "properties": { "notice": { "type": "object" } },
                    "required": ["notice"]
                }),
            ),
            (
                "messages",
                "Message numbers matching a query, newest first.",
                search.clone(),
            ),
            (
                "bouts",
                "Distinct bout numbers of the messages matching a query.",
                search,
            ),
            (
                "eta",
                "Milliseconds until every notice touching the keys is indexed; 0 when caught up.",
                json!({
                    "type": "object",
                    "properties": { "keys": { "type": "array", "items": { "type": "string" } } },
                    "required": ["keys"]
                }),
            ),
            (
                "flush",
                "Persist the index and purge applied notices.",
                empty.clone(),
            ),
            ("audit", "Check the on-disk index for inconsistencies.", empty),
        ]
        .into_iter()
        .map(|(name, description, schema)| {
            json!({ "name": name, "description": description, "inputSchema": schema })
        })
        .collect()
    }
}

/// Text for people plus structured data for programs.
struct Reply {
    text: String,
    data: JsonValue,
}

impl Reply {
    fn text(text: String) -> Self {
        Self {
            text,
            data: json!({}),
        }
    }

    fn with(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    fn into_json(self, is_error: bool) -> JsonValue {
        let mut out = json!({ "content": [{ "type": "text", "text": self.text }] });
        if is_error {
            out["isError"] = json!(true);
        } else {
            out["structuredContent"] = self.data;
        }
        out
    }
}
