//! File requests and chunked replies.

use crate::*;

use nncp_toss::chunked::{reassemble_all, ReassembleOptions};
use nncp_toss::tx::tx_freq;
use nncp_toss::{toss, TossOptions};

#[test]
fn test_freq_is_answered_with_the_file() -> Result<()> {
    let net = Net::new("freq", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    write_file(&net.public("bob").join("docs/a.txt"), b"public data");

    tx_freq(&alice, &peer(&alice, &net.id("bob")), 64, "docs/a.txt", "got/a.txt")?;
    deliver(&alice, &bob)?;
    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!((report.processed, report.bad), (1, 0));
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Tx), 1);

    deliver(&bob, &alice)?;
    toss(&alice, &net.id("bob"), &TossOptions::default())?;
    assert_eq!(read_to_string(&net.incoming("alice").join("got/a.txt")), "public data");
    Ok(())
}

#[test]
fn test_chunked_reply_reassembles() -> Result<()> {
    let net = Net::new("freqchunk", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx_with("bob", |n| {
        if let Some(freq) = n.freq.as_mut() {
            freq.chunked = Some(1024);
        }
        true
    });
    let data: Vec<u8> = (0..2560u32).map(|i| (i % 251) as u8).collect();
    write_file(&net.public("bob").join("big.bin"), &data);

    tx_freq(&alice, &peer(&alice, &net.id("bob")), 64, "big.bin", "big.bin")?;
    deliver(&alice, &bob)?;
    toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(deliver(&bob, &alice)?, 4);
    assert_eq!(toss(&alice, &net.id("bob"), &TossOptions::default())?.processed, 4);

    let incoming = net.incoming("alice");
    assert!(incoming.join("big.bin.nncp.meta").exists());
    let report = reassemble_all(&alice, ReassembleOptions::default());
    assert_eq!((report.complete, report.pending, report.bad), (1, 0, 0));
    assert_eq!(std::fs::read(incoming.join("big.bin"))?, data);
    assert!(!incoming.join("big.bin.nncp.meta").exists());
    assert!(!incoming.join("big.bin.nncp.part0").exists());
    Ok(())
}

#[test]
fn test_freq_without_permission_is_bad() -> Result<()> {
    let net = Net::new("freqdeny", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx_with("bob", |n| {
        n.freq = None;
        true
    });
    write_file(&net.public("bob").join("a.txt"), b"x");

    tx_freq(&alice, &peer(&alice, &net.id("bob")), 64, "a.txt", "a.txt")?;
    deliver(&alice, &bob)?;
    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Tx), 0);
    Ok(())
}

#[test]
fn test_freq_cannot_leave_its_root() -> Result<()> {
    let net = Net::new("freqescape", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");
    write_file(&net.root.path().join("bob").join("secret"), b"x");

    tx_freq(&alice, &peer(&alice, &net.id("bob")), 64, "../secret", "secret")?;
    deliver(&alice, &bob)?;
    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Tx), 0);
    Ok(())
}

#[test]
fn test_missing_requested_file_is_bad() -> Result<()> {
    let net = Net::new("freqmissing", &["alice", "bob"]);
    let alice = net.ctx("alice");
    let bob = net.ctx("bob");

    tx_freq(&alice, &peer(&alice, &net.id("bob")), 64, "nope.txt", "nope.txt")?;
    deliver(&alice, &bob)?;
    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    Ok(())
}
