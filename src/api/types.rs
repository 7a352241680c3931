use std::{fmt, ops::Add, ops::AddAssign, str::FromStr};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
pub use uuid::Uuid;

use crate::ordering::DottedOrder;

/// The JSON object shape used for run inputs, outputs and extra metadata.
pub type JsonMap = Map<String, Value>;

///////////
// RunId //
///////////

/// Runs are identified by a UUID. A fresh id is minted on every span entry, so a retried
/// operation gets a new run rather than reusing the old one.
#[derive(
    Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash, Debug, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn nil() -> Self {
        RunId(Uuid::nil())
    }

    pub fn allocate() -> Self {
        RunId(Uuid::new_v4())
    }

    pub fn get_raw(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        RunId(uuid)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RunId)
    }
}

/////////////
// RunKind //
/////////////

/// The closed set of run types a sink understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Chain,
    Llm,
    Tool,
    Root,
    SubAgent,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Chain => "chain",
            RunKind::Llm => "llm",
            RunKind::Tool => "tool",
            RunKind::Root => "root",
            RunKind::SubAgent => "sub_agent",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Unknown run kind '{0}', expected one of chain, llm, tool, root, sub_agent")]
pub struct ParseRunKindError(String);

impl FromStr for RunKind {
    type Err = ParseRunKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "chain" => RunKind::Chain,
            "llm" => RunKind::Llm,
            "tool" => RunKind::Tool,
            "root" => RunKind::Root,
            "sub_agent" => RunKind::SubAgent,
            other => return Err(ParseRunKindError(other.to_owned())),
        })
    }
}

////////////////
// TokenUsage //
////////////////

/// Token accounting reported by model-call spans. Sums saturate at `u64::MAX`.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(rhs.total_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/////////
// Run //
/////////

/// The record a sink stores for one span.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Run {
    pub id: RunId,
    pub trace_id: RunId,
    pub name: String,
    pub run_type: RunKind,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    pub dotted_order: DottedOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_example_id: Option<String>,
}

//////////////
// RunPatch //
//////////////

/// The update sent once when a span ends.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub prompt_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub completion_tokens: u64,
}

impl RunPatch {
    pub fn ended_at(end_time: DateTime<Utc>) -> Self {
        RunPatch {
            end_time: Some(end_time),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.prompt_tokens = usage.prompt_tokens;
        self.completion_tokens = usage.completion_tokens;
        self.total_tokens = usage.total_tokens;
        self
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/////////////
// RunInfo //
/////////////

/// Describes a traced operation, as handed over by the host framework.
///
/// Passing `None` instead of a descriptor, or a descriptor marked untraced, turns every tracer
/// call into a no-op.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunInfo {
    pub name: String,
    pub kind: RunKind,
    pub component: Option<String>,
    pub untraced: bool,
}

impl RunInfo {
    pub fn new<S: Into<String>>(name: S, kind: RunKind) -> Self {
        RunInfo {
            name: name.into(),
            kind,
            component: None,
            untraced: false,
        }
    }

    /// A chainable way to label the component type (e.g. "ChatModel", "Lambda").
    pub fn with_component<S: Into<String>>(mut self, component: S) -> Self {
        self.component = Some(component.into());
        self
    }

    /// A chainable way to mark the operation as not traced.
    pub fn with_untraced(mut self, untraced: bool) -> Self {
        self.untraced = untraced;
        self
    }

    /// The name a run gets: the explicit name, else the component label, else the kind.
    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else if let Some(component) = self.component.as_deref().filter(|c| !c.is_empty()) {
            component
        } else {
            self.kind.as_str()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_kind_strings() {
        for kind in [
            RunKind::Chain,
            RunKind::Llm,
            RunKind::Tool,
            RunKind::Root,
            RunKind::SubAgent,
        ] {
            assert_eq!(Ok(kind), kind.as_str().parse());
            assert_eq!(
                Value::String(kind.as_str().to_owned()),
                serde_json::to_value(kind).unwrap()
            );
        }

        assert!("agent".parse::<RunKind>().is_err());
        assert!("".parse::<RunKind>().is_err());
        assert!(serde_json::from_str::<RunKind>("\"retriever\"").is_err());
    }

    #[test]
    fn display_name_fallbacks() {
        let info = RunInfo::new("node1", RunKind::Chain).with_component("Lambda");
        assert_eq!("node1", info.display_name());

        let info = RunInfo::new("", RunKind::Llm).with_component("ChatModel");
        assert_eq!("ChatModel", info.display_name());

        let info = RunInfo::new("", RunKind::Tool);
        assert_eq!("tool", info.display_name());
    }

    #[test]
    fn patch_omits_empty_fields() {
        let patch = RunPatch::default();
        assert_eq!("{}", serde_json::to_string(&patch).unwrap());

        let patch = RunPatch::default().with_usage(TokenUsage::new(3, 4));
        let v = serde_json::to_value(&patch).unwrap();
        assert_eq!(Some(&Value::from(7u64)), v.get("total_tokens"));
        assert_eq!(TokenUsage::new(3, 4), patch.usage());
    }

    #[test]
    fn usage_sums() {
        let mut usage = TokenUsage::new(1, 2);
        usage += TokenUsage::new(10, 20);
        assert_eq!(TokenUsage::new(11, 22), usage);
        assert_eq!(33, usage.total_tokens);
    }

    #[test]
    fn usage_saturates() {
        let huge = TokenUsage::new(u64::MAX, 1);
        assert_eq!(u64::MAX, huge.total_tokens);

        let mut usage = TokenUsage::new(u64::MAX - 1, 0);
        usage += TokenUsage::new(5, u64::MAX);
        assert_eq!(TokenUsage::new(u64::MAX, u64::MAX), usage);
        assert_eq!(u64::MAX, usage.total_tokens);
    }
}
