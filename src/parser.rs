// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns a flat token stream (as an `FT.AGGREGATE`/`FT.SEARCH`-shaped command would
//! hand us) into a compiled [`Request`]. Pure syntax and mode-exclusivity checks
//! only; nothing here touches an index. That happens in `Request::apply_context`.

use std::collections::HashMap;
use std::time::Duration;

use crate::args::{parse_arg_spec, ArgCursor, ArgSpec, ArgSpecKind, ArgSpecOutcome, ArgValue};
use crate::collaborators::LegacyFilter;
use crate::config::ServerConfig;
use crate::lookup::Lookup;
use crate::plan::{GroupStep, LoadStep, MapFilterStep, ReducerSpec, Step};
use crate::request::{HighlightSettings, Request, RequestFlags, SummarizeSettings, TimeoutPolicy};
use crate::{expr, ErrorKind, Result};

/// Parses `tokens` (everything after the query string) into `request`, mutating
/// its plan, options and returned-field list in place.
pub fn parse(request: &mut Request, tokens: &[String], config: &ServerConfig) -> Result<()> {
    let mut cursor = ArgCursor::new(tokens);
    while !cursor.is_empty() {
        let keyword = cursor.peek().expect("checked non-empty above").to_string();
        match_keyword(request, &mut cursor, &keyword, config)?;
    }
    request.returned_fields.restrict_return();
    Ok(())
}

fn match_keyword(request: &mut Request, cursor: &mut ArgCursor, keyword: &str, config: &ServerConfig) -> Result<()> {
    if cursor.advance_if_match("GROUPBY") {
        return parse_groupby(request, cursor);
    }
    if cursor.advance_if_match("SORTBY") {
        return parse_sortby(request, cursor, config);
    }
    if cursor.advance_if_match("APPLY") {
        return parse_apply(request, cursor);
    }
    if cursor.advance_if_match("GEOFILTER") {
        return parse_geofilter(request, cursor);
    }
    if cursor.advance_if_match("FILTER") {
        // `FILTER` is ambiguous between the aggregate expression step and the
        // legacy numeric filter; once extended mode is active (GROUPBY/APPLY/a
        // prior FILTER step) it can only mean the former. Otherwise treat it as
        // the legacy search-mode form, which forces simple mode.
        if request.flags.contains(RequestFlags::EXTENDED) {
            return parse_filter(request, cursor);
        }
        return parse_legacy_numeric_filter(request, cursor);
    }
    if cursor.advance_if_match("LOAD") {
        return parse_load(request, cursor);
    }
    if cursor.advance_if_match("LIMIT") {
        return parse_limit(request, cursor, config);
    }
    if cursor.advance_if_match("WITHCURSOR") {
        return parse_withcursor(request, cursor, config);
    }
    if cursor.advance_if_match("PARAMS") {
        // consumed, but parameter substitution is out of scope here; skip the var-args group.
        cursor.get_var_args()?;
        return Ok(());
    }
    if cursor.advance_if_match("VERBATIM") {
        request.flags.insert(crate::request::RequestFlags::VERBATIM);
        return Ok(());
    }
    if cursor.advance_if_match("NOCONTENT") {
        request.ensure_simple_mode("NOCONTENT")?;
        request.flags.insert(crate::request::RequestFlags::NO_CONTENT);
        return Ok(());
    }
    if cursor.advance_if_match("WITHSCORES") {
        request.flags.insert(crate::request::RequestFlags::SEND_SCORES);
        return Ok(());
    }
    if cursor.advance_if_match("WITHSORTKEYS") {
        request.flags.insert(crate::request::RequestFlags::SEND_SORTKEYS);
        return Ok(());
    }
    if cursor.advance_if_match("WITHPAYLOADS") {
        request.flags.insert(crate::request::RequestFlags::SEND_PAYLOADS);
        return Ok(());
    }
    if cursor.advance_if_match("EXPLAINSCORE") {
        request.flags.insert(crate::request::RequestFlags::EXPLAIN_SCORE);
        return Ok(());
    }
    if cursor.advance_if_match("INORDER") {
        request.flags.insert(crate::request::RequestFlags::INORDER);
        return Ok(());
    }
    if cursor.advance_if_match("NOSTOPWORDS") {
        request.flags.insert(crate::request::RequestFlags::NO_STOPWORDS);
        return Ok(());
    }
    if cursor.advance_if_match("SCORER") {
        request.options.scorer = Some(cursor.get_string()?.to_string());
        return Ok(());
    }
    if cursor.advance_if_match("EXPANDER") {
        request.options.expander = Some(cursor.get_string()?.to_string());
        return Ok(());
    }
    if cursor.advance_if_match("LANGUAGE") {
        request.options.language = Some(cursor.get_string()?.to_string());
        return Ok(());
    }
    if cursor.advance_if_match("SLOP") {
        request.options.slop = Some(cursor.get_i64()?);
        return Ok(());
    }
    if cursor.advance_if_match("TIMEOUT") {
        let ms = cursor.get_u64()?;
        request.options.max_idle = Some(Duration::from_millis(ms));
        return Ok(());
    }
    if cursor.advance_if_match("ON_TIMEOUT") {
        let policy = cursor.get_string()?;
        request.options.timeout_policy = Some(if policy.eq_ignore_ascii_case("FAIL") {
            TimeoutPolicy::Fail
        } else {
            TimeoutPolicy::Return
        });
        return Ok(());
    }
    if cursor.advance_if_match("INKEYS") {
        let mut group = cursor.get_var_args()?;
        while !group.is_empty() {
            request.options.in_keys.push(group.get_string()?.to_string());
        }
        return Ok(());
    }
    if cursor.advance_if_match("INFIELDS") {
        let mut group = cursor.get_var_args()?;
        while !group.is_empty() {
            request.options.in_fields.push(group.get_string()?.to_string());
        }
        return Ok(());
    }
    if cursor.advance_if_match("PAYLOAD") {
        request.options.payload = Some(cursor.get_string()?.as_bytes().to_vec());
        return Ok(());
    }
    if cursor.advance_if_match("WITHRAWIDS") {
        request.flags.insert(RequestFlags::RAW_IDS);
        return Ok(());
    }
    if cursor.advance_if_match("_NUM_SSTRING") {
        request.flags.insert(RequestFlags::TYPED);
        return Ok(());
    }
    if cursor.advance_if_match("RETURN") {
        return parse_return(request, cursor);
    }
    if cursor.advance_if_match("SUMMARIZE") {
        return parse_summarize(request, cursor);
    }
    if cursor.advance_if_match("HIGHLIGHT") {
        return parse_highlight(request, cursor);
    }

    Err(ErrorKind::ParseArgs.with_message(format!("unknown argument '{keyword}'")))
}

fn parse_groupby(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_extended_mode("GROUPBY")?;
    let mut keys = cursor.get_var_args()?;
    let mut group_keys = Vec::new();
    while !keys.is_empty() {
        group_keys.push(strip_at(keys.get_string()?));
    }

    let mut reducers = Vec::new();
    while cursor.advance_if_match("REDUCE") {
        let name = cursor.get_string()?.to_string();
        let mut arg_group = cursor.get_var_args()?;
        let mut args = Vec::new();
        while !arg_group.is_empty() {
            args.push(arg_group.get_string()?.to_string());
        }
        let alias = if cursor.advance_if_match("AS") {
            cursor.get_string()?.to_string()
        } else {
            generated_alias(&name, &args)
        };
        reducers.push(ReducerSpec { name, args, alias });
    }

    request
        .plan
        .push(Step::Group(GroupStep { group_keys, reducers, lookup: Lookup::new() }));
    Ok(())
}

/// Mirrors the original's `__generated_aliasFNarg1arg2` naming: lowercase function
/// name immediately followed by the lowercased, `@`-stripped, comma-joined args.
fn generated_alias(name: &str, args: &[String]) -> String {
    let stripped: Vec<String> = args.iter().map(|a| strip_at(a).to_lowercase()).collect();
    format!("__generated_alias{}{}", name.to_lowercase(), stripped.join(","))
}

fn strip_at(field: &str) -> String {
    field.strip_prefix('@').unwrap_or(field).to_string()
}

fn parse_sortby(request: &mut Request, cursor: &mut ArgCursor, config: &ServerConfig) -> Result<()> {
    // The new, count-prefixed form (`SORTBY n @f1 [ASC|DESC] ...`) is distinguished
    // from the legacy single-field form (`SORTBY @field [ASC|DESC]`) by whether the
    // next token parses as a key count at all; the legacy form is search-mode only.
    let is_counted_form = cursor.peek().is_some_and(|t| t.parse::<u64>().is_ok());

    let mut sort_keys = Vec::new();
    let mut asc_bitmap = 0u64;

    if is_counted_form {
        let mut keys = cursor.get_var_args()?;
        let mut idx = 0u32;
        while !keys.is_empty() {
            let field = keys.get_string()?;
            let mut ascending = true;
            if let Some(next) = keys.peek() {
                if next.eq_ignore_ascii_case("ASC") {
                    keys.advance_if_match("ASC");
                } else if next.eq_ignore_ascii_case("DESC") {
                    keys.advance_if_match("DESC");
                    ascending = false;
                }
            }
            if ascending {
                asc_bitmap |= 1 << idx;
            }
            sort_keys.push(strip_at(field));
            idx += 1;
        }
    } else {
        request.ensure_simple_mode("legacy SORTBY @field form")?;
        let field = cursor.get_string()?;
        let mut ascending = true;
        if let Some(next) = cursor.peek() {
            if next.eq_ignore_ascii_case("ASC") {
                cursor.advance_if_match("ASC");
            } else if next.eq_ignore_ascii_case("DESC") {
                cursor.advance_if_match("DESC");
                ascending = false;
            }
        }
        if ascending {
            asc_bitmap |= 1;
        }
        sort_keys.push(strip_at(field));
    }

    if sort_keys.len() > config.sort_max_fields {
        return Err(ErrorKind::Limit
            .with_message(format!("SORTBY supports at most {} keys", config.sort_max_fields)));
    }

    let step = request.plan.get_or_create_arrange_step();
    step.sort_keys = sort_keys;
    step.asc_bitmap = asc_bitmap;
    if cursor.advance_if_match("MAX") {
        step.limit = cursor.get_u64()?;
    }
    Ok(())
}

fn parse_apply(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_extended_mode("APPLY")?;
    let expr_text = cursor.get_string()?.to_string();
    if !cursor.advance_if_match("AS") {
        return Err(ErrorKind::ParseArgs.with_message("APPLY requires an AS alias"));
    }
    let alias = cursor.get_string()?.to_string();
    let parsed = expr::parse(&expr_text)?;
    request.plan.push(Step::Apply(MapFilterStep {
        expr_text,
        expr: Some(parsed),
        alias: Some(alias),
        lookup: Lookup::new(),
    }));
    Ok(())
}

fn parse_filter(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_extended_mode("FILTER")?;
    let expr_text = cursor.get_string()?.to_string();
    let parsed = expr::parse(&expr_text)?;
    request.plan.push(Step::Filter(MapFilterStep {
        expr_text,
        expr: Some(parsed),
        alias: None,
        lookup: Lookup::new(),
    }));
    Ok(())
}

/// Legacy `FILTER field min max`: a numeric range clause parsed positionally,
/// not as query-string syntax. Forces simple mode.
fn parse_legacy_numeric_filter(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_simple_mode("legacy FILTER")?;
    let field = strip_at(cursor.get_string()?);
    let min = cursor.get_f64()?;
    let max = cursor.get_f64()?;
    request
        .options
        .legacy_filters
        .push(LegacyFilter::Numeric { field, min, max });
    Ok(())
}

/// `GEOFILTER field lon lat radius unit`: always a legacy, positional clause.
fn parse_geofilter(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_simple_mode("GEOFILTER")?;
    let field = strip_at(cursor.get_string()?);
    let lon = cursor.get_f64()?;
    let lat = cursor.get_f64()?;
    let radius = cursor.get_f64()?;
    let unit = cursor.get_string()?.to_string();
    request
        .options
        .legacy_filters
        .push(LegacyFilter::Geo { field, lon, lat, radius, unit });
    Ok(())
}

fn parse_load(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    if cursor.advance_if_match("*") {
        request.plan.push(Step::Load(LoadStep { fields: Vec::new(), lookup: Lookup::new() }));
        return Ok(());
    }
    let mut group = cursor.get_var_args()?;
    let mut fields = Vec::new();
    while !group.is_empty() {
        fields.push(strip_at(group.get_string()?));
    }
    request.plan.push(Step::Load(LoadStep { fields, lookup: Lookup::new() }));
    Ok(())
}

fn parse_limit(request: &mut Request, cursor: &mut ArgCursor, config: &ServerConfig) -> Result<()> {
    let offset = cursor.get_u64()?;
    let num = cursor.get_u64()?;
    if offset == 0 && num == 0 {
        request.flags.insert(RequestFlags::NO_ROWS);
    } else if !request.flags.contains(RequestFlags::EXTENDED)
        && offset.saturating_add(num) > config.search_max_results
    {
        return Err(ErrorKind::Limit.with_message(format!(
            "LIMIT offset + num exceeds the maximum of {} results",
            config.search_max_results
        )));
    }
    let step = request.plan.get_or_create_arrange_step();
    step.offset = offset;
    step.limit = num;
    Ok(())
}

fn parse_withcursor(request: &mut Request, cursor: &mut ArgCursor, config: &ServerConfig) -> Result<()> {
    request.flags.insert(RequestFlags::CURSOR);
    let specs = [
        ArgSpec::new("COUNT", ArgSpecKind::U64),
        ArgSpec::new("MAXIDLE", ArgSpecKind::U64),
    ];
    let mut out: HashMap<&'static str, ArgValue> = HashMap::new();
    loop {
        match parse_arg_spec(cursor, &specs, &mut out)? {
            ArgSpecOutcome::Handled => continue,
            ArgSpecOutcome::NotFound => break,
        }
    }
    if let Some(count) = out.get("COUNT").and_then(ArgValue::as_u64) {
        request.options.cursor_count = Some(count);
    }
    let idle = match out.get("MAXIDLE").and_then(ArgValue::as_u64) {
        Some(idle_ms) => Duration::from_millis(idle_ms).min(config.cursor_max_idle),
        None => config.cursor_max_idle,
    };
    request.options.max_idle = Some(idle);
    Ok(())
}

fn parse_return(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_simple_mode("RETURN")?;
    request.returned_fields.set_explicit_return();
    let mut group = cursor.get_var_args()?;
    if group.is_empty() {
        // `RETURN 0`: still runs RestrictReturn (no fields survive), but also
        // suppresses the field section of the reply entirely.
        request.flags.insert(RequestFlags::NO_FIELDS);
        return Ok(());
    }
    while !group.is_empty() {
        let name = strip_at(group.get_string()?);
        let display_as = if group.advance_if_match("AS") {
            group.get_string()?.to_string()
        } else {
            name.clone()
        };
        let field = request.returned_fields.get_create_field(&display_as);
        field.explicit_return = true;
        field.name = display_as;
        let _ = name;
    }
    Ok(())
}

fn parse_summarize(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_simple_mode("SUMMARIZE")?;
    let mut field_names = Vec::new();
    if cursor.advance_if_match("FIELDS") {
        let mut group = cursor.get_var_args()?;
        while !group.is_empty() {
            field_names.push(strip_at(group.get_string()?));
        }
    }

    let mut fragment_count = 3u32;
    let mut fragment_len = 20u32;
    let mut separator = "...".to_string();
    if cursor.advance_if_match("FRAGS") {
        fragment_count = cursor.get_u64()? as u32;
    }
    if cursor.advance_if_match("LEN") {
        fragment_len = cursor.get_u64()? as u32;
    }
    if cursor.advance_if_match("SEPARATOR") {
        separator = cursor.get_string()?.to_string();
    }

    let settings = SummarizeSettings { separator, fragment_count, fragment_len };
    if field_names.is_empty() {
        // No FIELDS clause: applies to every field named in RETURN so far, or all fields.
        for field in request.returned_fields.fields_mut() {
            field.summarize = Some(settings.clone());
        }
    } else {
        for name in &field_names {
            request.returned_fields.get_create_field(name).summarize = Some(settings.clone());
        }
    }
    Ok(())
}

fn parse_highlight(request: &mut Request, cursor: &mut ArgCursor) -> Result<()> {
    request.ensure_simple_mode("HIGHLIGHT")?;
    request.flags.insert(RequestFlags::SEND_HIGHLIGHT);
    let mut field_names = Vec::new();
    if cursor.advance_if_match("FIELDS") {
        let mut group = cursor.get_var_args()?;
        while !group.is_empty() {
            field_names.push(strip_at(group.get_string()?));
        }
    }

    let mut open_tag = "<b>".to_string();
    let mut close_tag = "</b>".to_string();
    if cursor.advance_if_match("TAGS") {
        open_tag = cursor.get_string()?.to_string();
        close_tag = cursor.get_string()?.to_string();
    }

    let settings = HighlightSettings { open_tag, close_tag };
    if field_names.is_empty() {
        for field in request.returned_fields.fields_mut() {
            field.highlight = Some(settings.clone());
        }
    } else {
        for name in &field_names {
            request.returned_fields.get_create_field(name).highlight = Some(settings.clone());
        }
    }
    Ok(())
}
