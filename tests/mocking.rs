use std::path::PathBuf;
use std::sync::Arc;

use isl_runtime as isl;
use isl::{ContextRef, FileInfo, TestContext, TestPackage};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

async fn run_mocked(source: &str) -> isl::Result<Value> {
    let package = isl::compile(vec![FileInfo::new("main", source)])?;
    let ctx: ContextRef = TestContext::create(Arc::default(), None, None)?;
    package.run_transform("main:run", &ctx).await
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("isl-mocking-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn test_sequenced_mocks_answer_in_order() {
    let result = run_mocked(
        r#"
        fun run() {
            @.Mock.Func('Api.Next#1', 5);
            @.Mock.Func('Api.Next#2', 3);
            $first = @.Api.Next();
            $second = @.Api.Next();
            return [ $first, $second ];
        }
        "#,
    )
    .await
    .unwrap();
    assert_eq!(result, json!([5, 3]));
}

#[tokio::test]
async fn test_sequenced_mocks_run_out() {
    let err = run_mocked(
        r#"
        fun run() {
            @.Mock.Func('Api.Next#1', 5);
            @.Mock.Func('Api.Next#2', 3);
            $a = @.Api.Next();
            $b = @.Api.Next();
            $c = @.Api.Next();
            return $c;
        }
        "#,
    )
    .await
    .unwrap_err();
    assert!(
        err.to_string()
            .contains("Mock exhausted: expected at most 2 call(s), but got call #3"),
        "{err}"
    );
}

#[tokio::test]
async fn test_parameter_matchers_fall_back_to_the_default() {
    let result = run_mocked(
        r#"
        fun run() {
            @.Mock.Func('Api.Find', { status: 'found' }, { kind: 'user' });
            @.Mock.Func('Api.Find', 'fallback');
            $hits = [ @.Api.Find({ kind: 'user', id: 3 }), @.Api.Find({ kind: 'admin' }), @.Api.Find() ];
            return { hits: $hits, captures: @.Mock.GetFuncCaptures('Api.Find') };
        }
        "#,
    )
    .await
    .unwrap();
    assert_eq!(
        result,
        json!({
            "hits": [{"status": "found"}, "fallback", {"status": "found"}],
            "captures": [[{"kind": "user", "id": 3}], [], [{"kind": "admin"}]]
        })
    );
}

#[tokio::test]
async fn test_captures_by_instance_id() {
    let result = run_mocked(
        r#"
        fun run() {
            $user = @.Mock.Func('Api.Find', 'u', 'user');
            $admin = @.Mock.Func('Api.Find', 'a', 'admin');
            $x = @.Api.Find('admin');
            $y = @.Api.Find('user');
            $z = @.Api.Find('admin');
            return [ $user, $admin, @.Mock.GetFuncCaptures('Api.Find', $admin), @.Mock.GetFuncCaptures('Api.Find', 9) ];
        }
        "#,
    )
    .await
    .unwrap();
    assert_eq!(result, json!([1, 2, [["admin"], ["admin"]], null]));
}

#[tokio::test]
async fn test_invalid_mock_names_are_rejected() {
    let err = run_mocked("fun run() { @.Mock.Func('nodot', 1); }")
        .await
        .unwrap_err();
    assert!(
        matches!(err.root(), isl::IslError::InvalidMockName { .. }),
        "{err}"
    );

    let err = run_mocked("fun run() { return @.Mock.GetFuncCaptures('Api.Unknown'); }")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Mock function api.unknown is not registered."), "{err}");
}

#[tokio::test]
async fn test_statement_and_annotation_mocks() {
    let result = run_mocked(
        r#"
        @audit('orders')
        fun audited() { return 7; }

        fun run() {
            @.Mock.StatementFunc('Batch.Each');
            @.Mock.Annotation('audit');
            $count = 0;
            @.Batch.Each('chunk', 2) {
                $count = 1;
            }
            return {
                count: $count,
                audited: @.This.audited(),
                statementCalls: @.Mock.GetStatementFuncCaptures('Batch.Each'),
                annotationCalls: @.Mock.GetAnnotationCaptures('audit')
            };
        }
        "#,
    )
    .await
    .unwrap();
    assert_eq!(
        result,
        json!({
            "count": 1,
            "audited": 7,
            "statementCalls": [["chunk", 2]],
            "annotationCalls": [["orders"]]
        })
    );
}

#[tokio::test]
async fn test_script_suites_report_each_test() {
    let package = isl::compile(vec![FileInfo::new(
        "suite/orders",
        r#"
        @setup
        fun prepare() {
            @.Mock.Func('Orders.Total#1', 40);
            @.Mock.Func('Orders.Total#2', 2);
        }

        @test('sums totals', 'orders')
        fun sums() {
            @.Assert.Equal(40, @.Orders.Total());
            @.Assert.Equal(2, @.Orders.Total());
        }

        @test
        fun mismatch() {
            @.Assert.Equal('a', 'b', 'letters differ');
        }

        @test({ name: 'blows up' })
        fun explodes() {
            $a = @.Orders.Total();
            $b = @.Orders.Total();
            $c = @.Orders.Total();
        }
        "#,
    )])
    .unwrap();

    let tests = TestPackage::new(package).unwrap();
    let results = tests.run_all_tests().await;
    // functions run in name order
    let summary: Vec<(String, Option<String>, bool)> = results
        .iter()
        .map(|r| (r.test_name.clone(), r.test_group.clone(), r.success))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("blows up".to_string(), None, false),
            ("mismatch".to_string(), Some("orders".to_string()), false),
            ("sums totals".to_string(), Some("orders".to_string()), true),
        ]
    );

    let mismatch = results[1].message.clone().unwrap();
    assert!(mismatch.starts_with("Assert.Equal failed."), "{mismatch}");
    assert!(mismatch.ends_with("Additional message: letters differ"), "{mismatch}");
    let exhausted = results[0].message.clone().unwrap();
    assert!(exhausted.contains("Mock exhausted"), "{exhausted}");

    // each test starts from fresh mocks
    let rerun = tests.run_test("suite/orders", "sums").await;
    assert_eq!(rerun.len(), 1);
    assert!(rerun[0].success, "{:?}", rerun[0].message);
}

#[tokio::test]
async fn test_mock_files_load_relative_to_the_test() {
    let dir = scratch_dir();
    std::fs::create_dir_all(dir.join("suite")).unwrap();
    std::fs::write(
        dir.join("suite/mocks.json"),
        json!({
            "func": [
                {"name": "Rates.Get", "return": 1.5},
                {"name": "Rates.Get", "return": 2.0, "params": ["GBP"]}
            ]
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(dir.join("suite/input.json"), r#"{"currency": "GBP"}"#).unwrap();

    let package = isl::compile(vec![FileInfo::new(
        "suite/rates",
        r#"
        @test
        fun loads() {
            @.Mock.Load('mocks.json');
            $input = @.Load.From('input.json');
            @.Assert.Equal(2.0, @.Rates.Get($input.currency));
            @.Assert.Equal(1.5, @.Rates.Get('EUR'));
        }

        @test
        fun rejects_missing_files() {
            $data = @.Load.From('absent.yaml');
        }
        "#,
    )])
    .unwrap();
    let results = TestPackage::new(package)
        .unwrap()
        .with_base_path(&dir)
        .run_all_tests()
        .await;
    std::fs::remove_dir_all(&dir).ok();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].test_name, "loads");
    assert!(results[0].success, "{:?}", results[0].message);
    assert_eq!(results[1].test_name, "rejects_missing_files");
    assert!(!results[1].success);
    let message = results[1].message.clone().unwrap();
    assert!(message.contains("File not found"), "{message}");
}

#[tokio::test]
async fn test_yaml_and_csv_files_load() {
    let dir = scratch_dir();
    std::fs::write(
        dir.join("mocks.yml"),
        "func:\n  - name: Rates.Get\n    return: 3\n    params: [USD]\n  - name: Rates.Get#1\n    return: 0\n",
    )
    .unwrap();
    std::fs::write(dir.join("people.csv"), "name,team\nAnn,core\n\"Bo \\\"B\\\"\",ops,late\n").unwrap();
    std::fs::write(dir.join("settings.yaml"), "retries: 2\nhosts: [a, b]\n").unwrap();
    std::fs::write(dir.join("notes.txt"), "plain").unwrap();

    let package = isl::compile(vec![FileInfo::new(
        "loads",
        r#"
        @test
        fun yaml_mocks() {
            @.Mock.Load('mocks.yml');
            @.Assert.Equal(3, @.Rates.Get('USD'));
            @.Assert.Equal(0, @.Rates.Get('EUR'));
        }

        @test
        fun csv_rows() {
            $rows = @.Load.From('people.csv');
            @.Assert.Equal([ { name: 'Ann', team: 'core' }, { name: 'Bo "B"', team: 'ops', Col2: 'late' } ], $rows);
            @.Assert.Equal({ retries: 2, hosts: [ 'a', 'b' ] }, @.Load.From('settings.yaml'));
        }

        @test
        fun mocks_reject_csv() {
            @.Mock.Load('people.csv');
        }

        @test
        fun text_is_unsupported() {
            $notes = @.Load.From('notes.txt');
        }
        "#,
    )])
    .unwrap();
    let results = TestPackage::new(package)
        .unwrap()
        .with_base_path(&dir)
        .run_all_tests()
        .await;
    std::fs::remove_dir_all(&dir).ok();

    let outcome: Vec<(String, bool)> = results
        .iter()
        .map(|r| (r.test_name.clone(), r.success))
        .collect();
    assert_eq!(
        outcome,
        vec![
            ("csv_rows".to_string(), true),
            ("mocks_reject_csv".to_string(), false),
            ("text_is_unsupported".to_string(), false),
            ("yaml_mocks".to_string(), true),
        ],
        "{results:?}"
    );
    let message = results[1].message.clone().unwrap();
    assert!(message.contains("@.Mock.Load supports .json, .yaml, .yml; got: people.csv"), "{message}");
    let message = results[2].message.clone().unwrap();
    assert!(
        message.contains("@.Load.From supports .json, .yaml, .yml, .csv; got: notes.txt"),
        "{message}"
    );
}

#[tokio::test]
async fn test_oversized_sequence_positions_are_rejected() {
    let err = run_mocked("fun run() { @.Mock.Func('Api.Get#4000000000', 1); }")
        .await
        .unwrap_err();
    assert!(
        matches!(err.root(), isl::IslError::InvalidMockName { .. }),
        "{err}"
    );
}
