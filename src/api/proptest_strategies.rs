use crate::api::types::{RunId, RunKind};
use crate::context::TraceState;
use crate::ordering::{compose_dotted_order, DottedOrder};
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use uuid::Uuid;

/// Microseconds from the unix epoch to the last instant of the year 9999.
const MAX_FORMATTABLE_MICROS: i64 = 253_402_300_799_999_999;

pub fn run_id() -> impl Strategy<Value = RunId> {
    any::<[u8; 16]>().prop_map(|arr| Uuid::from_bytes(arr).into())
}

pub fn run_kind() -> impl Strategy<Value = RunKind> {
    prop_oneof![
        Just(RunKind::Chain),
        Just(RunKind::Llm),
        Just(RunKind::Tool),
        Just(RunKind::Root),
        Just(RunKind::SubAgent),
    ]
}

pub fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0..=MAX_FORMATTABLE_MICROS)
        .prop_map(|micros| DateTime::from_timestamp_micros(micros).unwrap_or_default())
}

pub fn dotted_order() -> impl Strategy<Value = DottedOrder> {
    prop::collection::vec((timestamp(), run_id()), 1..5).prop_map(|segments| {
        let mut order: Option<DottedOrder> = None;
        for (t, id) in segments {
            order = Some(compose_dotted_order(order.as_ref(), t, id));
        }
        order.unwrap_or_else(|| compose_dotted_order(None, DateTime::default(), RunId::nil()))
    })
}

pub fn trace_state() -> impl Strategy<Value = TraceState> {
    (
        proptest::option::of(run_id()),
        proptest::option::of(run_id()),
        proptest::option::of(dotted_order()),
    )
        .prop_map(|(trace_id, parent_run_id, parent_dotted_order)| TraceState {
            trace_id,
            parent_run_id,
            parent_dotted_order,
        })
}
