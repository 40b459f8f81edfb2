// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end coverage of `Request::compile` / `apply_context` / `build_pipeline`
//! against the in-memory mock collaborators, exercising the scenarios a real
//! `FT.AGGREGATE`/`FT.SEARCH` command would hit.

mod mock_store;

use aggcore::config::ServerConfig;
use aggcore::extension::ExtensionRegistry;
use aggcore::request::{Request, RequestFlags};
use aggcore::ErrorKind;
use mock_store::{init_tracing, Document, InMemoryStore, LinearScanIndexReader, WhitespaceQueryParser};
use serde_json::json;
use pretty_assertions::assert_eq;

fn toks(strs: &[&str]) -> Vec<String> {
    strs.iter().map(|s| s.to_string()).collect()
}

fn catalog() -> InMemoryStore {
    let mut store = InMemoryStore::new(&[("brand", false), ("price", false), ("title", false)]);
    store.insert(
        Document::new(1)
            .with("brand", json!("acme"))
            .with("price", json!(10.0))
            .with("title", json!("widget one")),
    );
    store.insert(
        Document::new(2)
            .with("brand", json!("acme"))
            .with("price", json!(20.0))
            .with("title", json!("widget two")),
    );
    store.insert(
        Document::new(3)
            .with("brand", json!("globex"))
            .with("price", json!(5.0))
            .with("title", json!("gadget")),
    );
    store
}

fn drain(pipeline: &mut aggcore::pipeline::Pipeline) -> Vec<aggcore::pipeline::Row> {
    let mut rows = Vec::new();
    while let Some(row) = pipeline.next_row().unwrap() {
        rows.push(row);
    }
    rows
}

#[test]
fn simple_search_with_limit_returns_loaded_fields() {
    init_tracing();
    let store = catalog();
    let reader = LinearScanIndexReader::new(&store);
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["LIMIT", "0", "10"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    request.apply_context(&store, &parser, &extensions).unwrap();
    let mut pipeline = request.build_pipeline(&store, &reader, &extensions, &config).unwrap();

    let rows = drain(&mut pipeline);
    assert_eq!(rows.len(), 2);
    let ids: Vec<u64> = rows.iter().map(|r| r.doc_id).collect();
    assert!(ids.contains(&1));
    assert!(ids.contains(&2));
}

#[test]
fn groupby_reduce_count_aggregates_by_brand() {
    let store = catalog();
    let reader = LinearScanIndexReader::new(&store);
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["GROUPBY", "1", "@brand", "REDUCE", "COUNT", "0", "AS", "n"]);
    let mut request = Request::compile("*", &tokens, &config).unwrap();
    request.apply_context(&store, &parser, &extensions).unwrap();
    let mut pipeline = request.build_pipeline(&store, &reader, &extensions, &config).unwrap();

    let rows = drain(&mut pipeline);
    assert_eq!(rows.len(), 2);
    let total: i64 = rows
        .iter()
        .map(|r| r.get(1).and_then(|v| v.as_i64()).unwrap_or(0))
        .sum();
    assert_eq!(total, 3);
}

#[test]
fn apply_then_filter_then_sortby_pipes_through_in_order() {
    // `doubled` is computed from a literal, not a loaded root field, so the
    // test exercises step ordering (APPLY -> FILTER -> SORTBY) without also
    // depending on whether a prior LOAD materialized a document field.
    let store = catalog();
    let reader = LinearScanIndexReader::new(&store);
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&[
        "APPLY", "1 + 1", "AS", "doubled",
        "FILTER", "@doubled > 0",
        "SORTBY", "2", "@doubled", "ASC",
    ]);
    let mut request = Request::compile("*", &tokens, &config).unwrap();
    request.apply_context(&store, &parser, &extensions).unwrap();
    let mut pipeline = request.build_pipeline(&store, &reader, &extensions, &config).unwrap();

    let rows = drain(&mut pipeline);
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.get(0), Some(&json!(2.0)));
    }
}

#[test]
fn limit_zero_zero_sets_no_rows_flag_and_produces_an_empty_arrange() {
    let config = ServerConfig::default();
    let tokens = toks(&["LIMIT", "0", "0"]);
    let request = Request::compile("*", &tokens, &config).unwrap();
    assert!(request.flags.contains(RequestFlags::NO_ROWS));
}

#[test]
fn sortby_over_the_configured_cap_is_rejected() {
    let config = ServerConfig { sort_max_fields: 2, ..ServerConfig::default() };
    let tokens = toks(&["SORTBY", "3", "@a", "@b", "@c"]);
    let err = Request::compile("*", &tokens, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Limit);
}

#[test]
fn load_after_apply_is_rejected_at_build_time() {
    let store = catalog();
    let reader = LinearScanIndexReader::new(&store);
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["APPLY", "@price", "AS", "p", "LOAD", "1", "@title"]);
    let mut request = Request::compile("*", &tokens, &config).unwrap();
    request.apply_context(&store, &parser, &extensions).unwrap();
    let err = request.build_pipeline(&store, &reader, &extensions, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn summarize_after_groupby_is_rejected_at_parse_time() {
    let config = ServerConfig::default();
    let tokens = toks(&["GROUPBY", "0", "REDUCE", "COUNT", "0", "SUMMARIZE"]);
    let err = Request::compile("*", &tokens, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn legacy_filter_is_recorded_and_transferred_to_the_ast() {
    let store = catalog();
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["FILTER", "@price", "0", "15"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    assert!(request.flags.contains(RequestFlags::SIMPLE));
    assert_eq!(request.options.legacy_filters.len(), 1);
    request.apply_context(&store, &parser, &extensions).unwrap();
    assert_eq!(request.ast.as_ref().unwrap().legacy_filters.len(), 1);
    assert!(request.options.legacy_filters.is_empty());
}

#[test]
fn infields_resolve_to_a_field_mask_during_apply_context() {
    let store = catalog();
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["INFIELDS", "1", "title"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    assert_eq!(request.options.field_mask, 0);
    request.apply_context(&store, &parser, &extensions).unwrap();
    assert_ne!(request.options.field_mask, 0);
}

#[test]
fn unknown_field_in_infields_fails_apply_context() {
    let store = catalog();
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["INFIELDS", "1", "nosuchfield"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    let err = request.apply_context(&store, &parser, &extensions).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoProperty);
}

#[test]
fn return_with_explicit_fields_restricts_the_output() {
    let store = catalog();
    let reader = LinearScanIndexReader::new(&store);
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["RETURN", "1", "@title"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    request.apply_context(&store, &parser, &extensions).unwrap();
    let mut pipeline = request.build_pipeline(&store, &reader, &extensions, &config).unwrap();

    let rows = drain(&mut pipeline);
    assert!(!rows.is_empty());
    for row in &rows {
        assert!(row.get(0).is_some());
    }
}

#[test]
fn highlight_without_byte_offsets_fails_apply_context() {
    let store = catalog();
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["HIGHLIGHT", "FIELDS", "1", "@title"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    let err = request.apply_context(&store, &parser, &extensions).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn highlight_wraps_returned_fields_in_tags_when_byte_offsets_are_present() {
    let store = catalog().with_byte_offsets();
    let reader = LinearScanIndexReader::new(&store);
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["RETURN", "1", "@title", "HIGHLIGHT", "FIELDS", "1", "@title", "TAGS", "<em>", "</em>"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    request.apply_context(&store, &parser, &extensions).unwrap();
    let mut pipeline = request.build_pipeline(&store, &reader, &extensions, &config).unwrap();

    let rows = drain(&mut pipeline);
    assert!(!rows.is_empty());
    for row in &rows {
        let title = row.get(0).unwrap().as_str().unwrap();
        assert!(title.starts_with("<em>") && title.ends_with("</em>"));
    }
}

#[test]
fn return_zero_suppresses_field_loading() {
    let store = catalog();
    let reader = LinearScanIndexReader::new(&store);
    let parser = WhitespaceQueryParser;
    let extensions = ExtensionRegistry::new();
    let config = ServerConfig::default();

    let tokens = toks(&["RETURN", "0"]);
    let mut request = Request::compile("widget", &tokens, &config).unwrap();
    assert!(request.flags.contains(RequestFlags::NO_FIELDS));
    request.apply_context(&store, &parser, &extensions).unwrap();
    let mut pipeline = request.build_pipeline(&store, &reader, &extensions, &config).unwrap();
    let rows = drain(&mut pipeline);
    assert!(!rows.is_empty());
}
