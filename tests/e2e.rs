use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use isl_runtime as isl;
use isl::functions::sync_extension;
use isl::{BaseContext, ContextRef, FileInfo};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

async fn run(files: Vec<(&str, &str)>, entry: &str, input: Value) -> isl::Result<Value> {
    let package = isl::compile(
        files
            .into_iter()
            .map(|(name, source)| FileInfo::new(name, source))
            .collect(),
    )?;
    let ctx: ContextRef = BaseContext::new().into_ref();
    ctx.set_variable("$input", input)?;
    package.run_transform(entry, &ctx).await
}

#[tokio::test]
async fn test_order_summary() {
    let source = r#"
        import Format from 'format';

        fun run($input) {
            $summary.customer = $input.customer.name | default('anonymous') | upper;
            $summary.lines = foreach $line in $input.lines {
                if ($line.qty > 0 and $line.sku !startsWith 'TMP') {
                    @.Format.line($line)
                }
            }
            $summary.skus = $input.lines | length;
            return $summary;
        }
    "#;
    let format = "fun line($l) { return { sku: $l.sku | lower, qty: $l.qty }; }";
    let input = json!({
        "customer": {},
        "lines": [
            {"sku": "AB-1", "qty": 2},
            {"sku": "TMP-9", "qty": 1},
            {"sku": "CD-2", "qty": 0},
            {"sku": "EF-3", "qty": 5}
        ]
    });
    let result = run(vec![("main", source), ("format", format)], "main:run", input)
        .await
        .unwrap();
    assert_eq!(
        result,
        json!({
            "customer": "ANONYMOUS",
            "lines": [{"sku": "ab-1", "qty": 2}, {"sku": "ef-3", "qty": 5}],
            "skus": 4
        })
    );
}

#[tokio::test]
async fn test_parallel_foreach_keeps_input_order() {
    isl::settings::set_max_parallel_workers(8);
    let source = r#"
        fun run($input) {
            $labels = parallel { workers: 4 } foreach $order in $input {
                @.Run.Sleep($order.delay);
                $out.id = $order.id | upper;
                $out.index = $orderindex;
                $out
            }
            return $labels;
        }
    "#;
    let input = json!([
        {"id": "a", "delay": 30},
        {"id": "b", "delay": 0},
        {"id": "c", "delay": 10}
    ]);
    let result = run(vec![("main", source)], "main:run", input).await.unwrap();
    assert_eq!(
        result,
        json!([
            {"id": "A", "index": 0},
            {"id": "B", "index": 1},
            {"id": "C", "index": 2}
        ])
    );
}

#[tokio::test]
async fn test_parallel_bodies_cannot_write_outer_variables() {
    isl::settings::set_max_parallel_workers(8);
    let source = r#"
        fun run($input) {
            $total = 0;
            $ignored = parallel { workers: 2 } foreach $n in $input {
                $total = $n;
            }
            return $total;
        }
    "#;
    let err = run(vec![("main", source)], "main:run", json!([1, 2, 3]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("outside scope"), "{err}");
}

#[tokio::test]
async fn test_default_cache_memoises_by_arguments() {
    let package = isl::compile(vec![FileInfo::new(
        "e2e/cached",
        r#"
        @defaultCache
        fun price($sku) { return @.Counter.Next($sku); }

        fun run() {
            return [ @.This.price('a'), @.This.price('b'), @.This.price('a') ];
        }
        "#,
    )])
    .unwrap();
    let ctx: ContextRef = BaseContext::new().into_ref();
    let counter = Arc::new(AtomicU64::new(0));
    let next = counter.clone();
    ctx.register_extension(
        "Counter.Next",
        sync_extension(move |_| Ok(json!(next.fetch_add(1, Ordering::SeqCst) + 1))),
    )
    .unwrap();

    let result = package.run_transform("e2e/cached:run", &ctx).await.unwrap();
    assert_eq!(result, json!([1, 2, 1]));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failures_carry_the_call_site() {
    let source = "fun run() {\n  $x = 1;\n  return @.Missing.Thing();\n}";
    let err = run(vec![("main", source)], "main:run", Value::Null)
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.contains("Missing.Thing"), "{text}");
    assert!(text.contains("main:3:"), "{text}");
}
