//! Folding a drained stream of chunks into one payload.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::api::{JsonMap, TokenUsage};

/// The result of folding a stream: the payload stored as the run's stream inputs or outputs,
/// additional extra metadata, and the token usage to report.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregated {
    pub payload: Value,
    pub extra: JsonMap,
    pub usage: Option<TokenUsage>,
}

impl Aggregated {
    pub fn new(payload: Value) -> Self {
        Aggregated {
            payload,
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Failed to encode aggregated chunks")]
    Encode(#[from] serde_json::Error),

    #[error("Chunks could not be aggregated: {0}")]
    Invalid(String),
}

/// Folds every chunk of a fully drained stream.
///
/// Aggregators run on a background task after the stream has ended and are consumed by the fold.
pub trait Aggregate<T>: Send + 'static {
    fn aggregate(self, chunks: Vec<T>) -> Result<Aggregated, AggregateError>;
}

/// Store the chunks as a JSON array, in arrival order.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectChunks;

impl<T: Serialize> Aggregate<T> for CollectChunks {
    fn aggregate(self, chunks: Vec<T>) -> Result<Aggregated, AggregateError> {
        Ok(Aggregated::new(serde_json::to_value(chunks)?))
    }
}

/// An aggregator backed by a closure.
pub fn from_fn<F>(f: F) -> FromFn<F> {
    FromFn(f)
}

/// See [`from_fn`].
#[derive(Clone, Copy, Debug)]
pub struct FromFn<F>(F);

impl<T, F> Aggregate<T> for FromFn<F>
where
    F: FnOnce(Vec<T>) -> Result<Aggregated, AggregateError> + Send + 'static,
{
    fn aggregate(self, chunks: Vec<T>) -> Result<Aggregated, AggregateError> {
        (self.0)(chunks)
    }
}

//////////////////
// MessageChunk //
//////////////////

/// One increment of a streamed chat model message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct MessageChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Model configuration (temperature, max tokens, ...) attached to the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl MessageChunk {
    pub fn content<S: Into<String>>(content: S) -> Self {
        MessageChunk {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_role<S: Into<String>>(mut self, role: S) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

/// Concatenates streamed message chunks into a single message.
///
/// The last role and model seen win, usage is summed, and the last model configuration seen is
/// reported under `model_conf` in the run's extra along with the summed usage under
/// `model_usage`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageAggregator;

impl Aggregate<MessageChunk> for MessageAggregator {
    fn aggregate(self, chunks: Vec<MessageChunk>) -> Result<Aggregated, AggregateError> {
        let mut message = MessageChunk::default();
        for chunk in chunks {
            message.content.push_str(&chunk.content);
            if chunk.role.is_some() {
                message.role = chunk.role;
            }
            if chunk.model.is_some() {
                message.model = chunk.model;
            }
            if let Some(usage) = chunk.usage {
                *message.usage.get_or_insert_with(TokenUsage::default) += usage;
            }
            if chunk.config.is_some() {
                message.config = chunk.config;
            }
        }

        let mut extra = JsonMap::new();
        if let Some(config) = message.config.take() {
            extra.insert("model_conf".to_owned(), config);
        }
        if let Some(usage) = message.usage {
            extra.insert("model_usage".to_owned(), serde_json::to_value(usage)?);
        }

        Ok(Aggregated {
            usage: message.usage,
            payload: serde_json::to_value(&message)?,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collect_keeps_arrival_order() {
        let agg = CollectChunks.aggregate(vec!["a", "b", "c"]).unwrap();
        assert_eq!(json!(["a", "b", "c"]), agg.payload);
        assert!(agg.extra.is_empty());
        assert_eq!(None, agg.usage);
    }

    #[test]
    fn closures_aggregate() {
        let agg = from_fn(|chunks: Vec<u32>| {
            Ok(Aggregated::new(Value::from(chunks.iter().sum::<u32>())))
        })
        .aggregate(vec![1, 2, 3])
        .unwrap();
        assert_eq!(Value::from(6), agg.payload);

        let err = from_fn(|_: Vec<u32>| Err(AggregateError::Invalid("empty".to_owned())))
            .aggregate(vec![]);
        assert!(matches!(err, Err(AggregateError::Invalid(_))));
    }

    #[test]
    fn messages_concatenate() {
        let chunks = vec![
            MessageChunk::content("Hel")
                .with_role("assistant")
                .with_config(json!({"temperature": 0.2})),
            MessageChunk::content("lo").with_usage(TokenUsage::new(5, 1)),
            MessageChunk::content("!")
                .with_model("m-1")
                .with_usage(TokenUsage::new(0, 1)),
        ];
        let agg = MessageAggregator.aggregate(chunks).unwrap();

        assert_eq!(
            json!({"role": "assistant", "content": "Hello!", "model": "m-1",
                   "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}}),
            agg.payload
        );
        assert_eq!(Some(TokenUsage::new(5, 2)), agg.usage);
        assert_eq!(Some(&json!({"temperature": 0.2})), agg.extra.get("model_conf"));
        assert_eq!(
            Some(&json!({"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7})),
            agg.extra.get("model_usage")
        );
    }

    #[test]
    fn empty_message_stream() {
        let agg = MessageAggregator.aggregate(vec![]).unwrap();
        assert_eq!(json!({"content": ""}), agg.payload);
        assert!(agg.extra.is_empty());
    }
}
