// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use serde_json::json;
use yare::parameterized;

#[test]
fn token_is_independent_of_key_order() {
    let a: Value = serde_json::from_str(r#"{"room":"lobby","limit":10}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"limit":10,"room":"lobby"}"#).unwrap();
    assert_eq!(
        QueryToken::new("presence:list", &a),
        QueryToken::new("presence:list", &b)
    );
}

#[test]
fn token_distinguishes_path_and_args() {
    let args = json!({ "room": "lobby" });
    let base = QueryToken::new("presence:list", &args);
    assert_ne!(base, QueryToken::new("presence:count", &args));
    assert_ne!(base, QueryToken::new("presence:list", &json!({ "room": "attic" })));
}

#[test]
fn token_text() {
    let token = QueryToken::new("messages:list", &json!({}));
    assert_eq!(token.as_str(), r#"{"args":{},"udfPath":"messages:list"}"#);
}

#[test]
fn null_args_become_empty_object() {
    assert_eq!(validate_args(Value::Null).unwrap(), json!({}));
}

#[parameterized(
    array = { json!([1, 2]), "array" },
    string = { json!("x"), "string" },
    number = { json!(3), "number" },
)]
fn non_object_args_rejected(args: Value, kind: &str) {
    let err = validate_args(args).unwrap_err();
    assert!(err.to_string().contains(kind));
}

#[test]
fn error_result_keeps_structured_data() {
    let plain = FunctionResult::error("boom", None);
    let structured = FunctionResult::error("boom", Some(json!({ "code": 7 })));
    assert_eq!(plain, FunctionResult::ErrorMessage("boom".into()));
    assert!(matches!(structured, FunctionResult::ErrorData { ref data, .. } if data["code"] == 7));
    assert!(structured.value().is_none());
    assert!(FunctionResult::Value(json!(1)).value().is_some());
}
