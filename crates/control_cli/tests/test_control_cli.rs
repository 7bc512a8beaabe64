use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn bin() -> Command {
    let mut cmd = Command::cargo_bin("sentinel-control").unwrap();
    // keep the test hermetic from a developer's .env
    cmd.env_remove("API_KEY")
        .env_remove("SIGNING_SECRET")
        .env_remove("AUDIT_SECRET")
        .env_remove("QUEUE_SIGNING_SECRET");
    cmd
}

#[test]
fn keygen_prints_a_full_identity() {
    bin()
        .arg("keygen")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("agent_")
                .and(predicate::str::contains("pub_b64"))
                .and(predicate::str::contains("priv_b64")),
        );
}

#[test]
fn audit_verify_on_an_empty_chain_reports_genesis() {
    let td = TempDir::new().unwrap();
    bin()
        .arg("audit-verify")
        .arg("--audit-dir")
        .arg(td.path().join("audit"))
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"ok\": true")
                .and(predicate::str::contains("\"lines\": 0"))
                .and(predicate::str::contains("GENESIS")),
        );
}

#[test]
fn guard_falls_back_locally_when_gateway_is_unreachable() {
    // nothing listens on port 9; transport fails fast
    bin()
        .args(["guard", "ls"])
        .env("SENTINEL_API_URL", "http://127.0.0.1:9/analyze")
        .env("SENTINEL_HTTP_TIMEOUT", "2")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("local fallback"));

    bin()
        .args(["guard", "rm -rf /"])
        .env("SENTINEL_API_URL", "http://127.0.0.1:9/analyze")
        .env("SENTINEL_HTTP_TIMEOUT", "2")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("deny"));
}

#[test]
fn enqueue_emits_a_signed_envelope_line() {
    bin()
        .args(["enqueue", "ops:incidents", r#"{"topic":"drill"}"#])
        .env("QUEUE_SIGNING_SECRET", "queue-secret")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("ops:incidents")
                .and(predicate::str::contains("sig"))
                .and(predicate::str::contains("payload")),
        );

    // unsigned mode passes the payload through untouched
    bin()
        .args(["enqueue", "ops:incidents", r#"{"topic":"drill"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{\"topic\":\"drill\"}"#));
}
