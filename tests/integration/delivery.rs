//! File packets: placement, collisions, permissions and toss options.

use crate::*;

use nncp_toss::spool::SpoolError;
use nncp_toss::tx::tx_file;
use nncp_toss::{toss, TossOptions};

fn send(net: &Net, from: &Context, to: &str, nice: u8, dst: &str, data: &[u8]) -> Result<nncp_toss::spool::Stored> {
    let src = net.root.path().join(format!("src-{}", rand::random::<u32>()));
    write_file(&src, data);
    let stored = tx_file(from, &peer(from, &net.id(to)), nice, &src, dst, 0)?;
    Ok(stored)
}

#[test]
fn test_file_is_delivered_under_incoming() -> Result<()> {
    let net = Net::new("file", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    send(&net, &alice, "bob", 64, "reports/out.txt", b"hello")?;
    assert_eq!(deliver(&alice, &bob)?, 1);

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!((report.processed, report.skipped, report.bad), (1, 0, 0));
    assert_eq!(read_to_string(&net.incoming("bob").join("reports/out.txt")), "hello");
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 0);
    Ok(())
}

#[test]
fn test_existing_files_are_never_overwritten() -> Result<()> {
    let net = Net::new("collide", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    write_file(&net.incoming("bob").join("out.txt"), b"mine");

    send(&net, &alice, "bob", 64, "out.txt", b"theirs")?;
    deliver(&alice, &bob)?;
    toss(&bob, &net.id("alice"), &TossOptions::default())?;

    assert_eq!(read_to_string(&net.incoming("bob").join("out.txt")), "mine");
    assert_eq!(read_to_string(&net.incoming("bob").join("out.txt0")), "theirs");
    Ok(())
}

#[test]
fn test_seen_marker_refuses_redelivery() -> Result<()> {
    let net = Net::new("seen", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    let stored = send(&net, &alice, "bob", 64, "once.txt", b"x")?;
    deliver(&alice, &bob)?;
    let opts = TossOptions {
        do_seen: true,
        ..Default::default()
    };
    assert_eq!(toss(&bob, &net.id("alice"), &opts)?.processed, 1);

    let again = bob
        .spool
        .incoming(&net.id("alice"), Direction::Rx, stored.digest, stored.size);
    assert!(matches!(again, Err(SpoolError::AlreadySeen(_))));
    Ok(())
}

#[test]
fn test_absolute_destination_is_bad() -> Result<()> {
    let net = Net::new("abs", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    send(&net, &alice, "bob", 64, "/tmp/escaped", b"x")?;
    send(&net, &alice, "bob", 64, "../escaped", b"x")?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 2);
    assert!(!net.root.path().join("bob").join("escaped").exists());
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 2);
    Ok(())
}

#[test]
fn test_sender_without_incoming_is_refused() -> Result<()> {
    let net = Net::new("noincoming", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx_with("bob", |n| {
        n.incoming = None;
        true
    });

    send(&net, &alice, "bob", 64, "out.txt", b"x")?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert!(!net.incoming("bob").exists());
    Ok(())
}

#[test]
fn test_dry_run_has_no_side_effects() -> Result<()> {
    let net = Net::new("dry", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    send(&net, &alice, "bob", 64, "deep/out.txt", &[3u8; 10_000])?;
    deliver(&alice, &bob)?;

    let opts = TossOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = toss(&bob, &net.id("alice"), &opts)?;
    assert_eq!(report.processed, 1);
    assert!(!net.incoming("bob").exists());
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);

    toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(std::fs::read(net.incoming("bob").join("deep/out.txt"))?, vec![3u8; 10_000]);
    Ok(())
}

#[test]
fn test_nice_threshold_postpones_packets() -> Result<()> {
    let net = Net::new("nice", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    send(&net, &alice, "bob", 200, "bulk.txt", b"bulk")?;
    deliver(&alice, &bob)?;

    let urgent_only = TossOptions {
        nice: 100,
        ..Default::default()
    };
    let report = toss(&bob, &net.id("alice"), &urgent_only)?;
    assert_eq!((report.processed, report.skipped), (0, 1));
    assert!(!report.is_bad());
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);

    assert_eq!(toss(&bob, &net.id("alice"), &TossOptions::default())?.processed, 1);
    assert_eq!(read_to_string(&net.incoming("bob").join("bulk.txt")), "bulk");
    Ok(())
}

#[test]
fn test_disabled_type_is_left_queued() -> Result<()> {
    let net = Net::new("nofile", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    send(&net, &alice, "bob", 64, "out.txt", b"x")?;
    deliver(&alice, &bob)?;

    let opts = TossOptions {
        no_file: true,
        ..Default::default()
    };
    let report = toss(&bob, &net.id("alice"), &opts)?;
    assert_eq!((report.processed, report.skipped, report.bad), (0, 1, 0));
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    Ok(())
}

#[test]
fn test_lower_nice_is_tossed_first() -> Result<()> {
    let net = Net::new("order", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    send(&net, &alice, "bob", 200, "order.txt", b"late")?;
    send(&net, &alice, "bob", 10, "order.txt", b"early")?;
    deliver(&alice, &bob)?;
    toss(&bob, &net.id("alice"), &TossOptions::default())?;

    assert_eq!(read_to_string(&net.incoming("bob").join("order.txt")), "early");
    assert_eq!(read_to_string(&net.incoming("bob").join("order.txt0")), "late");
    Ok(())
}
