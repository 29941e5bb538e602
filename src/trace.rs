//! Step trace: the precomputed event log the simulator replays.
//!
//! One record per (token, layer, sub-stage) step. A record names the tokens
//! whose KV cache is not read during that step (the skip set) and whether the
//! whole step is skipped. Steps absent from the file use the default record.
//!
//! File format (first line is a header and is ignored):
//!
//! ```text
//! n,l,s,skip_token_kv,skip_layer
//! 2048,0,0,[3,17,42],False
//! 2048,0,1,[],False
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token index within the sequence.
pub type TokenId = u64;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("I/O error reading trace: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed trace line {line} ({reason}): {content:?}")]
    Malformed {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("Trace line {line} references layer {layer}, but the model has {n_layers} layers")]
    LayerOutOfRange {
        line: usize,
        layer: usize,
        n_layers: usize,
    },
}

/// Transformer sub-stage of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    /// Multi-head attention: reads the KV cache, writes one KV entry.
    Attention,
    /// Feed-forward block: weight traffic only.
    FeedForward,
}

impl Stage {
    /// Both stages in execution order.
    pub const ALL: [Stage; 2] = [Stage::Attention, Stage::FeedForward];

    /// Numeric code used in trace files.
    pub fn code(&self) -> u8 {
        match self {
            Stage::Attention => 0,
            Stage::FeedForward => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Stage> {
        match code {
            0 => Some(Stage::Attention),
            1 => Some(Stage::FeedForward),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Attention => write!(f, "attention"),
            Stage::FeedForward => write!(f, "feed-forward"),
        }
    }
}

/// Identifies one simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub token: TokenId,
    pub layer: usize,
    pub stage: Stage,
}

impl StepKey {
    pub fn new(token: TokenId, layer: usize, stage: Stage) -> Self {
        Self {
            token,
            layer,
            stage,
        }
    }

    /// The same (layer, stage) step `ahead` tokens later.
    pub fn ahead(&self, ahead: u64) -> Self {
        Self {
            token: self.token + ahead,
            ..*self
        }
    }

    /// The same (layer, stage) step one token later.
    pub fn next_token(&self) -> Self {
        self.ahead(1)
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.token, self.layer, self.stage)
    }
}

/// The trace payload for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Tokens whose KV cache is excluded from this step, sorted and deduplicated.
    skip_tokens: Vec<TokenId>,

    /// The whole step computation is skipped.
    pub skip_layer: bool,
}

impl StepRecord {
    pub fn new(mut skip_tokens: Vec<TokenId>, skip_layer: bool) -> Self {
        skip_tokens.sort_unstable();
        skip_tokens.dedup();
        Self {
            skip_tokens,
            skip_layer,
        }
    }

    /// Skipped tokens in ascending order.
    pub fn skip_tokens(&self) -> &[TokenId] {
        &self.skip_tokens
    }

    /// Whether `token` is in the skip set.
    pub fn skips(&self, token: TokenId) -> bool {
        self.skip_tokens.binary_search(&token).is_ok()
    }
}

static DEFAULT_RECORD: StepRecord = StepRecord {
    skip_tokens: Vec::new(),
    skip_layer: false,
};

/// The full step trace, indexed by step key.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    steps: HashMap<StepKey, StepRecord>,

    /// Source line of each record, for error reporting.
    lines: HashMap<StepKey, usize>,
}

impl Trace {
    /// Create an empty trace; every step uses the default record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a trace file.
    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Parse a trace from a string (header line included).
    pub fn parse_str(text: &str) -> Result<Self, TraceError> {
        Self::from_reader(text.as_bytes())
    }

    /// Parse a trace from any buffered reader. The first line is a header.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, TraceError> {
        let mut trace = Trace::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            if idx == 0 || line.trim().is_empty() {
                continue;
            }
            let (key, record) = parse_line(&line).map_err(|reason| TraceError::Malformed {
                line: line_no,
                content: line.clone(),
                reason,
            })?;
            trace.lines.insert(key, line_no);
            trace.steps.insert(key, record);
        }
        Ok(trace)
    }

    /// Insert or replace the record for a step.
    pub fn insert(&mut self, key: StepKey, record: StepRecord) {
        self.steps.insert(key, record);
    }

    /// The record for a step; absent steps yield an empty, non-skipped record.
    pub fn get(&self, key: StepKey) -> &StepRecord {
        self.steps.get(&key).unwrap_or(&DEFAULT_RECORD)
    }

    /// Whether the step has an explicit record.
    pub fn contains(&self, key: StepKey) -> bool {
        self.steps.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Reject records whose layer index does not exist in a model of `n_layers` layers.
    pub fn check_layers(&self, n_layers: usize) -> Result<(), TraceError> {
        let worst = self
            .steps
            .keys()
            .filter(|key| key.layer >= n_layers)
            .min_by_key(|key| self.lines.get(key).copied().unwrap_or(0));
        match worst {
            Some(key) => Err(TraceError::LayerOutOfRange {
                line: self.lines.get(key).copied().unwrap_or(0),
                layer: key.layer,
                n_layers,
            }),
            None => Ok(()),
        }
    }
}

/// Parse `n,l,s,[t1,t2,...],skip_layer`.
fn parse_line(line: &str) -> Result<(StepKey, StepRecord), String> {
    let line = line.trim();
    let open = line.find('[').ok_or("missing '['")?;
    let close = line.rfind(']').ok_or("missing ']'")?;
    if close < open {
        return Err("']' before '['".to_string());
    }

    let head = line[..open]
        .strip_suffix(',')
        .ok_or("expected ',' before skip list")?;
    let fields: Vec<&str> = head.split(',').map(str::trim).collect();
    let [n, l, s] = fields.as_slice() else {
        return Err(format!("expected 3 leading fields, found {}", fields.len()));
    };
    let token: TokenId = n.parse().map_err(|_| format!("bad token index {n:?}"))?;
    let layer: usize = l.parse().map_err(|_| format!("bad layer index {l:?}"))?;
    let stage_code: u8 = s.parse().map_err(|_| format!("bad sub-stage {s:?}"))?;
    let stage = Stage::from_code(stage_code).ok_or(format!("unknown sub-stage {stage_code}"))?;

    let list = line[open + 1..close].trim();
    let skip_tokens = if list.is_empty() {
        Vec::new()
    } else {
        list.split(',')
            .map(|t| {
                let t = t.trim();
                t.parse::<TokenId>()
                    .map_err(|_| format!("bad skipped token {t:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let tail = line[close + 1..]
        .trim_start()
        .strip_prefix(',')
        .ok_or("expected ',' after skip list")?
        .trim();
    let skip_layer = if tail.eq_ignore_ascii_case("true") {
        true
    } else if tail.eq_ignore_ascii_case("false") {
        false
    } else {
        return Err(format!("bad skip_layer flag {tail:?}"));
    };

    if stage == Stage::FeedForward && !skip_tokens.is_empty() {
        return Err("feed-forward record with a non-empty skip set".to_string());
    }

    Ok((
        StepKey::new(token, layer, stage),
        StepRecord::new(skip_tokens, skip_layer),
    ))
}
