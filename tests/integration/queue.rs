//! Queue integrity, locking and resumed reception.

use crate::*;

use nncp_toss::toss::LOCK_PURPOSE;
use nncp_toss::tx::tx_file;
use nncp_toss::{check, toss, TossError, TossOptions};

fn queue_file(net: &Net, from: &Context, to: &str, dst: &str, data: &[u8]) -> Result<()> {
    let src = net.root.path().join(format!("src-{}", rand::random::<u32>()));
    write_file(&src, data);
    tx_file(from, &peer(from, &net.id(to)), 64, &src, dst, 0)?;
    Ok(())
}

#[test]
fn test_tampered_packet_is_bad_and_flagged() -> Result<()> {
    let net = Net::new("tamper", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    queue_file(&net, &alice, "bob", "out.txt", &[9u8; 4096])?;
    deliver(&alice, &bob)?;

    let job = bob
        .spool
        .jobs(&net.id("alice"), Direction::Rx)?
        .next()
        .context("queued")?;
    let mut data = std::fs::read(&job.path)?;
    let last = data.len() - 10;
    data[last] ^= 0x40;
    std::fs::write(&job.path, data)?;

    let checked = check(&bob, &net.id("alice"))?;
    assert_eq!(checked.bad, vec![job.path.clone()]);

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!((report.processed, report.bad), (0, 1));
    assert!(!net.incoming("bob").join("out.txt").exists());
    assert!(job.path.exists());
    Ok(())
}

#[test]
fn test_check_passes_clean_queues() -> Result<()> {
    let net = Net::new("checkclean", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    queue_file(&net, &alice, "bob", "a.txt", b"a")?;
    queue_file(&net, &alice, "bob", "b.txt", b"b")?;
    deliver(&alice, &bob)?;
    queue_file(&net, &alice, "bob", "c.txt", b"c")?;

    let report = check(&alice, &net.id("bob"))?;
    assert_eq!((report.checked, report.is_bad()), (1, false));
    let report = check(&bob, &net.id("alice"))?;
    assert_eq!((report.checked, report.is_bad()), (2, false));
    Ok(())
}

#[test]
fn test_busy_lock_refuses_second_tosser() -> Result<()> {
    let net = Net::new("lock", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    queue_file(&net, &alice, "bob", "out.txt", b"x")?;
    deliver(&alice, &bob)?;

    let held = bob.spool.lock(&net.id("alice"), LOCK_PURPOSE)?;
    match toss(&bob, &net.id("alice"), &TossOptions::default()) {
        Err(TossError::Lock(e)) => assert!(e.is_busy()),
        other => panic!("expected a busy lock, got {other:?}"),
    }
    assert!(matches!(check(&bob, &net.id("alice")), Err(TossError::Lock(_))));
    drop(held);

    assert_eq!(toss(&bob, &net.id("alice"), &TossOptions::default())?.processed, 1);
    Ok(())
}

#[test]
fn test_packet_for_someone_else_is_bad() -> Result<()> {
    let net = Net::new("misrouted", &["alice", "bob", "carol"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    queue_file(&net, &alice, "carol", "out.txt", b"for carol")?;

    let job = alice
        .spool
        .jobs(&net.id("carol"), Direction::Tx)?
        .next()
        .context("queued")?;
    bob.spool.enqueue(&net.id("alice"), Direction::Rx, job.open()?)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert!(!net.incoming("bob").exists());
    Ok(())
}

#[test]
fn test_unknown_sender_is_bad() -> Result<()> {
    let net = Net::new("stranger", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx_with("bob", |n| n.name != "alice");
    queue_file(&net, &alice, "bob", "out.txt", b"x")?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    Ok(())
}

#[test]
fn test_interrupted_reception_resumes() -> Result<()> {
    let net = Net::new("resume", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 256) as u8).collect();
    queue_file(&net, &alice, "bob", "big.bin", &data)?;

    deliver_interrupted(&alice, &bob, 70_000)?;
    assert_eq!(toss(&bob, &net.id("alice"), &TossOptions::default())?.processed, 1);
    assert_eq!(std::fs::read(net.incoming("bob").join("big.bin"))?, data);
    Ok(())
}

#[test]
fn test_min_size_padding_is_transparent() -> Result<()> {
    let net = Net::new("pad", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    let src = net.root.path().join("small");
    write_file(&src, b"tiny");

    let stored = tx_file(&alice, &peer(&alice, &net.id("bob")), 64, &src, "tiny.txt", 32 * 1024)?;
    assert!(stored.size >= 32 * 1024);
    deliver(&alice, &bob)?;

    assert_eq!(toss(&bob, &net.id("alice"), &TossOptions::default())?.processed, 1);
    assert_eq!(read_to_string(&net.incoming("bob").join("tiny.txt")), "tiny");
    Ok(())
}

#[test]
fn test_unreadable_envelope_is_bad_under_any_nice_limit() -> Result<()> {
    let net = Net::new("garbage", &["alice", "bob"]);
    let bob = net.ctx("bob");
    bob.spool
        .enqueue(&net.id("alice"), Direction::Rx, &b"definitely not an envelope"[..])?;

    let urgent_only = TossOptions {
        nice: 200,
        ..Default::default()
    };
    let report = toss(&bob, &net.id("alice"), &urgent_only)?;
    assert_eq!((report.processed, report.skipped, report.bad), (0, 0, 1));
    assert!(report.is_bad());
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    Ok(())
}
