//! Exec packets run configured commands with the body on stdin.
#![cfg(unix)]

use crate::*;

use nncp_toss::tx::tx_exec;
use nncp_toss::{toss, TossOptions};

/// bob lets alice run `handle` as `/bin/sh -c script`.
fn bob_with_handle(net: &Net, handle: &str, script: &str) -> Context {
    net.ctx_with("bob", |n| {
        n.exec.insert(
            handle.to_string(),
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        );
        true
    })
}

#[test]
fn test_exec_feeds_body_and_environment() -> Result<()> {
    let net = Net::new("exec", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = bob_with_handle(
        &net,
        "sink",
        r#"cat > "$0"; printf '%s %s %s' "$NNCP_SELF" "$NNCP_SENDER" "$NNCP_NICE" > "$0.env""#,
    );
    let out = net.root.path().join("mail");

    let body = b"Subject: hi\n\nhello over uucp\n".repeat(50);
    tx_exec(
        &alice,
        &peer(&alice, &net.id("bob")),
        96,
        "sink",
        &[out.display().to_string()],
        &body[..],
        0,
    )?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!((report.processed, report.bad), (1, 0));
    assert_eq!(std::fs::read(&out)?, body);
    assert_eq!(
        read_to_string(&net.root.path().join("mail.env")),
        format!("{} {} 96", net.id("bob"), net.id("alice"))
    );
    Ok(())
}

#[test]
fn test_unknown_handle_is_bad() -> Result<()> {
    let net = Net::new("exechandle", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = bob_with_handle(&net, "sink", "cat > /dev/null");

    tx_exec(&alice, &peer(&alice, &net.id("bob")), 96, "rmail", &[], &b"x"[..], 0)?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    Ok(())
}

#[test]
fn test_failing_command_keeps_packet() -> Result<()> {
    let net = Net::new("execfail", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = bob_with_handle(&net, "fail", "cat > /dev/null; exit 3");

    tx_exec(&alice, &peer(&alice, &net.id("bob")), 96, "fail", &[], &b"x"[..], 0)?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!((report.processed, report.bad), (0, 1));
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    Ok(())
}

#[test]
fn test_exec_disabled_is_skipped() -> Result<()> {
    let net = Net::new("execoff", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let marker = net.root.path().join("ran");
    let bob = bob_with_handle(&net, "touch", &format!("cat > /dev/null; touch {}", marker.display()));

    tx_exec(&alice, &peer(&alice, &net.id("bob")), 96, "touch", &[], &b""[..], 0)?;
    deliver(&alice, &bob)?;

    let opts = TossOptions {
        no_exec: true,
        ..Default::default()
    };
    let report = toss(&bob, &net.id("alice"), &opts)?;
    assert_eq!(report.skipped, 1);
    assert!(!marker.exists());
    Ok(())
}

#[test]
fn test_empty_command_line_is_not_a_handle() -> Result<()> {
    let net = Net::new("execempty", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx_with("bob", |n| {
        n.exec.insert("hollow".to_string(), Vec::new());
        true
    });

    tx_exec(&alice, &peer(&alice, &net.id("bob")), 96, "hollow", &[], &b"x"[..], 0)?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!((report.processed, report.bad), (0, 1));
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    Ok(())
}
