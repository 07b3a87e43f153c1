//! Loop constructs built as statement extensions.
//!
//! Each engine binds a page-state variable, runs the block once, then re-reads
//! the same variable to decide whether another iteration is needed.

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::comparison::{equalish, is_valid, to_text};
use crate::errors::{IslError, Result};
use crate::functions::{FunctionCall, StatementBlock};

const DEFAULT_PAGE_SIZE: i64 = 100;

fn page_variable(call: &FunctionCall) -> Result<String> {
    call.variable_name(0).ok_or_else(|| {
        IslError::transform(
            format!("Unknown format for variable for {}", call.name),
            call.position.clone(),
        )
    })
}

fn options(call: &FunctionCall) -> Option<&Map<String, Value>> {
    call.second().as_object()
}

fn option_i64(options: Option<&Map<String, Value>>, key: &str) -> Option<i64> {
    match options?.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `@.Pagination.Page($page, {startIndex, pageSize})`: continues while the block
/// leaves `$page.hasMorePages` set to `true`.
pub async fn page(call: FunctionCall, block: StatementBlock) -> Result<Value> {
    let name = page_variable(&call)?;
    let options = options(&call);
    let start_index = option_i64(options, "startIndex").unwrap_or(0);
    let page_size = match option_i64(options, "pageSize") {
        Some(size) if size > 0 => size,
        _ => DEFAULT_PAGE_SIZE,
    };

    let out_of_range = |page: i64| {
        IslError::transform(
            format!("{} page {page} with pageSize {page_size} is out of range", call.name),
            call.position.clone(),
        )
    };

    let mut page = start_index;
    loop {
        let from_offset = page.checked_mul(page_size).ok_or_else(|| out_of_range(page))?;
        let to_offset = from_offset
            .checked_add(page_size)
            .ok_or_else(|| out_of_range(page))?;
        call.context.set_variable(
            &name,
            json!({
                "name": name,
                "startIndex": start_index,
                "pageSize": page_size,
                "page": page,
                "fromOffset": from_offset,
                "toOffset": to_offset,
                "hasMorePages": false,
            }),
        )?;
        block().await?;

        let more = call
            .context
            .variable(&name)
            .and_then(|state| state.get("hasMorePages").and_then(Value::as_bool))
            .unwrap_or(false);
        if !more {
            debug!(variable = %name, page, "page pagination finished");
            break;
        }
        page = page.checked_add(1).ok_or_else(|| out_of_range(page))?;
    }
    Ok(Value::Null)
}

/// `@.Pagination.Cursor($cursor)`: continues while the block sets a valid
/// `$cursor.next` that differs from the current cursor.
pub async fn cursor(call: FunctionCall, block: StatementBlock) -> Result<Value> {
    let name = page_variable(&call)?;

    let mut current = Value::Null;
    let mut iterations = 0usize;
    loop {
        call.context
            .set_variable(&name, json!({ "current": current, "next": null }))?;
        block().await?;
        iterations += 1;

        let next = call
            .context
            .variable(&name)
            .and_then(|state| state.get("next").cloned())
            .unwrap_or(Value::Null);
        // A cursor that does not move would loop forever.
        if !is_valid(&next) || equalish(&next, &current) {
            debug!(variable = %name, iterations, "cursor pagination finished");
            break;
        }
        current = next;
    }
    Ok(Value::Null)
}

static DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^([-+]?)P(?:([-+]?[0-9]+)D)?(?:T(?:([-+]?[0-9]+)H)?(?:([-+]?[0-9]+)M)?(?:([-+]?[0-9]+)(?:[.,]([0-9]{0,9}))?S)?)?$",
    )
    .expect("duration pattern is valid")
});

/// Parses an ISO-8601 duration of the form `PnDTnHnMn.nS`, optionally signed.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let caps = DURATION.captures(text.trim())?;
    if caps.iter().skip(2).all(|c| c.is_none()) || text.trim().to_uppercase().ends_with('T') {
        return None;
    }
    let number = |i: usize| -> Option<i64> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse::<i64>().ok())
    };
    let seconds = number(5)?;
    let nanos = match caps.get(6) {
        Some(m) if !m.as_str().is_empty() => {
            let digits = format!("{:0<9}", m.as_str());
            let n = digits.parse::<i64>().ok()?;
            if caps.get(5).is_some_and(|s| s.as_str().starts_with('-')) {
                -n
            } else {
                n
            }
        }
        _ => 0,
    };
    let total = Duration::try_days(number(2)?)?
        .checked_add(&Duration::try_hours(number(3)?)?)?
        .checked_add(&Duration::try_minutes(number(4)?)?)?
        .checked_add(&Duration::try_seconds(seconds)?)?
        .checked_add(&Duration::nanoseconds(nanos))?;
    Some(if &caps[1] == "-" { -total } else { total })
}

/// Accepts RFC-3339 instants or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let text = to_text(value)?;
    if let Ok(instant) = DateTime::parse_from_rfc3339(&text) {
        return Some(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// `@.Pagination.Date($window, {startDate, endDate, duration})`: walks from
/// `startDate` towards `endDate` in `duration` steps, clamping the final window.
pub async fn date(call: FunctionCall, block: StatementBlock) -> Result<Value> {
    let name = page_variable(&call)?;
    let options = options(&call);
    let option = |key: &str| options.and_then(|o| o.get(key)).unwrap_or(&Value::Null);

    let start = parse_date(option("startDate")).ok_or_else(|| {
        IslError::transform(
            format!("{} requires a valid startDate", call.name),
            call.position.clone(),
        )
    })?;
    let end = parse_date(option("endDate")).unwrap_or_else(Utc::now);
    let text = to_text(option("duration")).unwrap_or_else(|| "P1D".to_string());
    let step = parse_duration(&text)
        .filter(|d| *d != Duration::zero())
        .ok_or_else(|| {
            IslError::transform(
                format!(
                    "Could not parse duration {text} as a valid Duration. Expected format is 'PnnDTnnHnnMnnS'."
                ),
                call.position.clone(),
            )
        })?;
    let backward = step < Duration::zero();

    let mut window_start = start;
    let mut page = 0usize;
    loop {
        let mut window_end = window_start.checked_add_signed(step).ok_or_else(|| {
            IslError::transform(
                format!(
                    "{} window starting {} moved by {text} is out of range",
                    call.name,
                    format_date(&window_start)
                ),
                call.position.clone(),
            )
        })?;
        if (!backward && window_end > end && end > window_start)
            || (backward && window_end < end && end < window_start)
        {
            window_end = end;
        }
        if (!backward && window_end > end) || (backward && window_end < end) {
            break;
        }

        call.context.set_variable(
            &name,
            json!({
                "startDate": format_date(&window_start),
                "endDate": format_date(&window_end),
                "page": page,
            }),
        )?;
        block().await?;

        window_start = window_end;
        page += 1;
    }
    debug!(variable = %name, pages = page, "date pagination finished");
    Ok(Value::Null)
}
