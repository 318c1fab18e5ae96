//! Built-in device policy functions.
//!
//! Each function is a pipeline step with `apply`/`get` semantics: `apply`
//! feeds one value in and reports whether a value is ready, `get` produces
//! it. State lives in a scratch map owned by the engine, keyed per
//! (device model, attribute, function id), so functions themselves stay
//! stateless.

use std::collections::HashMap;

use rand::Rng;
use serde_json::{json, Map, Value};

use super::FormulaEvaluator;

/// Key under which the engine tracks the start of the active window.
pub(crate) const WINDOW_START_KEY: &str = "windowStart";

pub(crate) struct FunctionContext<'a> {
    pub device_model_urn: &'a str,
    pub attribute: Option<&'a str>,
    /// Data items of the message being processed, with the pipeline's
    /// current value substituted for the attribute under processing.
    pub attributes: &'a Map<String, Value>,
    pub evaluator: &'a dyn FormulaEvaluator,
    pub now_ms: i64,
}

pub(crate) trait DeviceFunction: Send + Sync {
    fn id(&self) -> &'static str;

    /// Feeds `value` into the step. `true` means a value can be obtained
    /// through [`DeviceFunction::get`]; `false` holds the attribute back
    /// unless the step's window has expired.
    fn apply(
        &self,
        ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool;

    fn get(
        &self,
        ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value>;
}

/// Table of the built-in functions.
pub(crate) struct DeviceFunctionRegistry {
    functions: HashMap<&'static str, Box<dyn DeviceFunction>>,
}

impl DeviceFunctionRegistry {
    pub fn with_builtins() -> DeviceFunctionRegistry {
        let mut registry = DeviceFunctionRegistry {
            functions: HashMap::new(),
        };
        registry.register(Box::new(Filter));
        registry.register(Box::new(ComputedMetric));
        registry.register(Box::new(SampleQuality));
        registry.register(Box::new(WindowAggregate::mean()));
        registry.register(Box::new(WindowAggregate::min()));
        registry.register(Box::new(WindowAggregate::max()));
        registry.register(Box::new(BatchBy));
        registry.register(Box::new(Duplicates::detect()));
        registry.register(Box::new(Duplicates::eliminate()));
        registry.register(Box::new(AlertCondition));
        registry.register(Box::new(PrivacyPolicy));
        registry
    }

    fn register(&mut self, function: Box<dyn DeviceFunction>) {
        self.functions.insert(function.id(), function);
    }

    pub fn get(&self, id: &str) -> Option<&dyn DeviceFunction> {
        self.functions.get(id).map(Box::as_ref)
    }
}

/// Window length of a pipeline step, if it has one. `batchBy` spells it
/// `batchTime`, everything else `window`.
pub(crate) fn window_millis(params: &Map<String, Value>) -> Option<i64> {
    param_i64(params, "window").or_else(|| param_i64(params, "batchTime"))
}

pub(crate) fn param_i64(params: &Map<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

fn param_f64(params: &Map<String, Value>, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Condition parameter; some policies spell it `formula`.
fn condition<'a>(params: &'a Map<String, Value>) -> Option<&'a str> {
    param_str(params, "condition").or_else(|| param_str(params, "formula"))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

fn stash_value(scratch: &mut Map<String, Value>, value: &Value) {
    scratch.insert("value".into(), value.clone());
}

fn take_value(scratch: &mut Map<String, Value>) -> Option<Value> {
    scratch.remove("value")
}

// filter
// --------------------------------------------------------------------

struct Filter;

impl DeviceFunction for Filter {
    fn id(&self) -> &'static str {
        "filter"
    }

    fn apply(
        &self,
        ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        stash_value(scratch, value);
        let Some(condition) = condition(params) else {
            // No condition means nothing to filter on.
            return true;
        };
        ctx.evaluator
            .evaluate(condition, ctx.attributes)
            .map(|v| truthy(&v))
            .unwrap_or(false)
    }

    fn get(
        &self,
        _ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        take_value(scratch)
    }
}

// computedMetric
// --------------------------------------------------------------------

struct ComputedMetric;

impl DeviceFunction for ComputedMetric {
    fn id(&self) -> &'static str {
        "computedMetric"
    }

    fn apply(
        &self,
        _ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        stash_value(scratch, value);
        true
    }

    fn get(
        &self,
        ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        take_value(scratch);
        let formula = param_str(params, "formula")?;
        ctx.evaluator.evaluate(formula, ctx.attributes)
    }
}

// sampleQuality
// --------------------------------------------------------------------

struct SampleQuality;

impl DeviceFunction for SampleQuality {
    fn id(&self) -> &'static str {
        "sampleQuality"
    }

    fn apply(
        &self,
        _ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        let rate = param_f64(params, "rate").unwrap_or(1.0);
        if rand::rng().random::<f64>() < rate {
            stash_value(scratch, value);
            true
        } else {
            false
        }
    }

    fn get(
        &self,
        _ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        take_value(scratch)
    }
}

// mean / min / max
// --------------------------------------------------------------------

#[derive(Clone, Copy)]
enum AggregateKind {
    Mean,
    Min,
    Max,
}

struct WindowAggregate {
    kind: AggregateKind,
}

impl WindowAggregate {
    fn mean() -> Self {
        WindowAggregate {
            kind: AggregateKind::Mean,
        }
    }

    fn min() -> Self {
        WindowAggregate {
            kind: AggregateKind::Min,
        }
    }

    fn max() -> Self {
        WindowAggregate {
            kind: AggregateKind::Max,
        }
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

struct WindowShape {
    width: i64,
    bucket_count: usize,
    slide: i64,
}

fn window_shape(params: &Map<String, Value>) -> Option<WindowShape> {
    let window = param_i64(params, "window").filter(|w| *w > 0)?;
    let slide = param_i64(params, "slide")
        .filter(|s| *s > 0 && *s <= window)
        .unwrap_or(window);
    let width = gcd(window, slide);
    Some(WindowShape {
        width,
        bucket_count: (window / width) as usize,
        slide,
    })
}

impl DeviceFunction for WindowAggregate {
    fn id(&self) -> &'static str {
        match self.kind {
            AggregateKind::Mean => "mean",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
        }
    }

    fn apply(
        &self,
        ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        let Some(shape) = window_shape(params) else {
            // Without a window the aggregate degenerates to identity.
            stash_value(scratch, value);
            return true;
        };
        let Some(number) = value.as_f64() else {
            log::warn!(
                "Ignoring non-numeric value for {} aggregation of {}/{:?}",
                self.id(),
                ctx.device_model_urn,
                ctx.attribute
            );
            return false;
        };

        let window_start = scratch
            .get(WINDOW_START_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(ctx.now_ms);
        scratch
            .entry(WINDOW_START_KEY.to_owned())
            .or_insert_with(|| json!(window_start));

        let mut buckets = take_buckets(scratch, shape.bucket_count);
        let offset = (ctx.now_ms - window_start).max(0) / shape.width;
        let index = (offset as usize).min(shape.bucket_count - 1);

        let bucket = &mut buckets[index];
        bucket.count += 1;
        bucket.sum += number;
        bucket.min = Some(bucket.min.map_or(number, |m| m.min(number)));
        bucket.max = Some(bucket.max.map_or(number, |m| m.max(number)));
        store_buckets(scratch, &buckets);

        // The aggregate only materializes at window expiry.
        false
    }

    fn get(
        &self,
        ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        if let Some(value) = take_value(scratch) {
            return Some(value);
        }
        let shape = window_shape(params)?;
        let mut buckets = take_buckets(scratch, shape.bucket_count);

        let count: u64 = buckets.iter().map(|b| b.count).sum();
        let aggregate = if count == 0 {
            None
        } else {
            match self.kind {
                AggregateKind::Mean => {
                    let sum: f64 = buckets.iter().map(|b| b.sum).sum();
                    Some(sum / count as f64)
                }
                AggregateKind::Min => buckets.iter().filter_map(|b| b.min).reduce(f64::min),
                AggregateKind::Max => buckets.iter().filter_map(|b| b.max).reduce(f64::max),
            }
        };

        // Slide the window: buckets covering the first `slide` of the
        // expired window are not part of the next one.
        let shift = ((shape.slide / shape.width) as usize).min(shape.bucket_count);
        buckets.rotate_left(shift);
        for bucket in buckets.iter_mut().skip(shape.bucket_count - shift) {
            *bucket = Bucket::default();
        }
        store_buckets(scratch, &buckets);

        let window_start = scratch
            .get(WINDOW_START_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(ctx.now_ms);
        scratch.insert(
            WINDOW_START_KEY.to_owned(),
            json!(window_start + shape.slide),
        );

        aggregate.and_then(|a| serde_json::Number::from_f64(a).map(Value::Number))
    }
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

fn take_buckets(scratch: &mut Map<String, Value>, count: usize) -> Vec<Bucket> {
    let mut buckets = vec![Bucket::default(); count];
    if let Some(Value::Array(stored)) = scratch.get("buckets") {
        for (i, value) in stored.iter().take(count).enumerate() {
            buckets[i] = Bucket {
                count: value["count"].as_u64().unwrap_or(0),
                sum: value["sum"].as_f64().unwrap_or(0.0),
                min: value["min"].as_f64(),
                max: value["max"].as_f64(),
            };
        }
    }
    buckets
}

fn store_buckets(scratch: &mut Map<String, Value>, buckets: &[Bucket]) {
    let stored: Vec<Value> = buckets
        .iter()
        .map(|b| {
            json!({
                "count": b.count,
                "sum": b.sum,
                "min": b.min,
                "max": b.max,
            })
        })
        .collect();
    scratch.insert("buckets".into(), Value::Array(stored));
}

// batchBy
// --------------------------------------------------------------------

struct BatchBy;

impl DeviceFunction for BatchBy {
    fn id(&self) -> &'static str {
        "batchBy"
    }

    fn apply(
        &self,
        _ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        let buffered = scratch
            .entry("messages".to_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(buffered) = buffered else {
            return false;
        };
        buffered.push(value.clone());

        match param_i64(params, "batchCount") {
            Some(count) if count > 0 => buffered.len() as i64 >= count,
            _ => false,
        }
    }

    fn get(
        &self,
        _ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        match scratch.remove("messages") {
            Some(Value::Array(messages)) if !messages.is_empty() => {
                Some(Value::Array(messages))
            }
            _ => None,
        }
    }
}

// detectDuplicates / eliminateDuplicates
// --------------------------------------------------------------------

struct Duplicates {
    /// Eliminate mode keeps extending the window while duplicates keep
    /// arriving; detect mode lets the original window run out.
    extend_window: bool,
    id: &'static str,
}

impl Duplicates {
    fn detect() -> Self {
        Duplicates {
            extend_window: false,
            id: "detectDuplicates",
        }
    }

    fn eliminate() -> Self {
        Duplicates {
            extend_window: true,
            id: "eliminateDuplicates",
        }
    }
}

impl DeviceFunction for Duplicates {
    fn id(&self) -> &'static str {
        self.id
    }

    fn apply(
        &self,
        ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        let duplicate = scratch.get("lastValue") == Some(value);
        if duplicate {
            if self.extend_window {
                scratch.insert(WINDOW_START_KEY.to_owned(), json!(ctx.now_ms));
            }
            return false;
        }

        scratch.insert("lastValue".into(), value.clone());
        scratch.insert(WINDOW_START_KEY.to_owned(), json!(ctx.now_ms));
        stash_value(scratch, value);
        true
    }

    fn get(
        &self,
        _ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        take_value(scratch)
            .or_else(|| scratch.get("lastValue").cloned())
    }
}

// alertCondition
// --------------------------------------------------------------------

/// Marker left in scratch for the engine, which synthesizes the actual
/// alert message after the pipeline finishes.
pub(crate) const ALERT_TRIGGERED_KEY: &str = "alertTriggered";

struct AlertCondition;

impl DeviceFunction for AlertCondition {
    fn id(&self) -> &'static str {
        "alertCondition"
    }

    fn apply(
        &self,
        ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        stash_value(scratch, value);
        let Some(condition) = condition(params) else {
            return true;
        };
        let holds = ctx
            .evaluator
            .evaluate(condition, ctx.attributes)
            .map(|v| truthy(&v))
            .unwrap_or(false);
        if holds {
            scratch.insert(ALERT_TRIGGERED_KEY.to_owned(), Value::Bool(true));
        }
        holds
    }

    fn get(
        &self,
        _ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        take_value(scratch)
    }
}

// privacyPolicy
// --------------------------------------------------------------------

struct PrivacyPolicy;

impl DeviceFunction for PrivacyPolicy {
    fn id(&self) -> &'static str {
        "privacyPolicy"
    }

    fn apply(
        &self,
        _ctx: &FunctionContext,
        _params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
        value: &Value,
    ) -> bool {
        stash_value(scratch, value);
        true
    }

    fn get(
        &self,
        _ctx: &FunctionContext,
        params: &Map<String, Value>,
        scratch: &mut Map<String, Value>,
    ) -> Option<Value> {
        let value = take_value(scratch)?;
        let level = param_str(params, "level").unwrap_or("none");
        Some(match level {
            "mask" => Value::String("****".into()),
            "hash" => {
                let serialized = value.to_string();
                match openssl::hash::hash(
                    openssl::hash::MessageDigest::sha256(),
                    serialized.as_bytes(),
                ) {
                    Ok(digest) => Value::String(hex_string(&digest)),
                    Err(e) => {
                        log::warn!("Unable to hash a redacted value: {e}");
                        Value::Null
                    }
                }
            }
            _ => value,
        })
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::SimpleFormulaEvaluator;

    fn ctx<'a>(attributes: &'a Map<String, Value>, now_ms: i64) -> FunctionContext<'a> {
        FunctionContext {
            device_model_urn: "urn:test",
            attribute: Some("t"),
            attributes,
            evaluator: &SimpleFormulaEvaluator,
            now_ms,
        }
    }

    fn attrs(t: f64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("t".into(), json!(t));
        map
    }

    #[test]
    fn filter_passes_and_drops() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let filter = registry.get("filter").unwrap();
        let mut params = Map::new();
        params.insert("condition".into(), json!("t > 0"));
        let mut scratch = Map::new();

        let attributes = attrs(3.0);
        assert!(filter.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!(3.0)));
        assert_eq!(
            filter.get(&ctx(&attributes, 0), &params, &mut scratch),
            Some(json!(3.0))
        );

        let attributes = attrs(-1.0);
        assert!(!filter.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!(-1.0)));
    }

    #[test]
    fn computed_metric_evaluates_formula() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let function = registry.get("computedMetric").unwrap();
        let mut params = Map::new();
        params.insert("formula".into(), json!("2*t"));
        let mut scratch = Map::new();

        let attributes = attrs(3.0);
        assert!(function.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!(3.0)));
        assert_eq!(
            function.get(&ctx(&attributes, 0), &params, &mut scratch),
            Some(json!(6.0))
        );
    }

    #[test]
    fn mean_aggregates_over_buckets() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let mean = registry.get("mean").unwrap();
        let mut params = Map::new();
        params.insert("window".into(), json!(1000));
        params.insert("slide".into(), json!(1000));
        let mut scratch = Map::new();

        let attributes = attrs(0.0);
        for (at, value) in [(0, 10.0), (200, 20.0), (900, 30.0)] {
            assert!(!mean.apply(&ctx(&attributes, at), &params, &mut scratch, &json!(value)));
        }

        let aggregate = mean.get(&ctx(&attributes, 1000), &params, &mut scratch);
        assert_eq!(aggregate, Some(json!(20.0)));

        // The consumed window leaves no data behind.
        let empty = mean.get(&ctx(&attributes, 2000), &params, &mut scratch);
        assert_eq!(empty, None);
    }

    #[test]
    fn bucket_count_is_bounded_by_window_over_gcd() {
        let mut params = Map::new();
        params.insert("window".into(), json!(6000));
        params.insert("slide".into(), json!(4000));
        let shape = window_shape(&params).unwrap();
        assert_eq!(shape.width, 2000);
        assert_eq!(shape.bucket_count, 3);
    }

    #[test]
    fn min_max_track_extremes() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let mut params = Map::new();
        params.insert("window".into(), json!(1000));
        let attributes = attrs(0.0);

        for (id, expected) in [("min", 5.0), ("max", 25.0)] {
            let function = registry.get(id).unwrap();
            let mut scratch = Map::new();
            for value in [10.0, 5.0, 25.0] {
                function.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!(value));
            }
            assert_eq!(
                function.get(&ctx(&attributes, 1000), &params, &mut scratch),
                Some(json!(expected))
            );
        }
    }

    #[test]
    fn batch_by_count_flushes_at_threshold() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let batch = registry.get("batchBy").unwrap();
        let mut params = Map::new();
        params.insert("batchCount".into(), json!(3));
        let mut scratch = Map::new();
        let attributes = Map::new();

        assert!(!batch.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!({"n": 1})));
        assert!(!batch.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!({"n": 2})));
        assert!(batch.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!({"n": 3})));

        let flushed = batch.get(&ctx(&attributes, 0), &params, &mut scratch).unwrap();
        assert_eq!(flushed.as_array().unwrap().len(), 3);
        assert!(batch.get(&ctx(&attributes, 0), &params, &mut scratch).is_none());
    }

    #[test]
    fn duplicates_are_suppressed() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let eliminate = registry.get("eliminateDuplicates").unwrap();
        let params = Map::new();
        let mut scratch = Map::new();
        let attributes = attrs(1.0);

        assert!(eliminate.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!(1.0)));
        assert!(!eliminate.apply(&ctx(&attributes, 10), &params, &mut scratch, &json!(1.0)));
        assert!(eliminate.apply(&ctx(&attributes, 20), &params, &mut scratch, &json!(2.0)));
    }

    #[test]
    fn alert_condition_marks_trigger() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let alert = registry.get("alertCondition").unwrap();
        let mut params = Map::new();
        params.insert("condition".into(), json!("t > 90"));
        let mut scratch = Map::new();

        let attributes = attrs(50.0);
        assert!(!alert.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!(50.0)));
        assert!(scratch.get(ALERT_TRIGGERED_KEY).is_none());

        let attributes = attrs(99.0);
        assert!(alert.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!(99.0)));
        assert_eq!(scratch.get(ALERT_TRIGGERED_KEY), Some(&Value::Bool(true)));
    }

    #[test]
    fn privacy_levels() {
        let registry = DeviceFunctionRegistry::with_builtins();
        let privacy = registry.get("privacyPolicy").unwrap();
        let attributes = attrs(0.0);

        let mut params = Map::new();
        params.insert("level".into(), json!("mask"));
        let mut scratch = Map::new();
        privacy.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!("secret"));
        assert_eq!(
            privacy.get(&ctx(&attributes, 0), &params, &mut scratch),
            Some(json!("****"))
        );

        params.insert("level".into(), json!("hash"));
        privacy.apply(&ctx(&attributes, 0), &params, &mut scratch, &json!("secret"));
        let hashed = privacy.get(&ctx(&attributes, 0), &params, &mut scratch).unwrap();
        assert_eq!(hashed.as_str().unwrap().len(), 64);
    }
}
