//! Transit packets through an intermediate node.

use crate::*;

use nncp_toss::tx::tx_file;
use nncp_toss::{toss, TossOptions};

/// alice reaches carol only through bob.
fn alice_via_bob(net: &Net) -> Context {
    let bob = net.id("bob");
    net.ctx_with("alice", |n| {
        if n.name == "carol" {
            n.via = vec![bob];
        }
        true
    })
}

#[test]
fn test_file_is_relayed_to_final_node() -> Result<()> {
    let net = Net::new("relay", &["alice", "bob", "carol"]);
    let alice = alice_via_bob(&net);
    let bob = net.ctx("bob");
    let carol = net.ctx("carol");

    let src = net.root.path().join("letter");
    write_file(&src, b"through bob");
    tx_file(&alice, &peer(&alice, &net.id("carol")), 32, &src, "letter.txt", 0)?;
    assert_eq!(queued(&alice, &net.id("carol"), Direction::Tx), 0);
    assert_eq!(deliver(&alice, &bob)?, 1);

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!((report.processed, report.bad), (1, 0));
    assert!(!net.incoming("bob").join("letter.txt").exists());
    assert_eq!(deliver(&bob, &carol)?, 1);

    // The inner envelope is alice's, whoever carried it.
    let report = toss(&carol, &net.id("bob"), &TossOptions::default())?;
    assert_eq!((report.processed, report.bad), (1, 0));
    assert_eq!(read_to_string(&net.incoming("carol").join("letter.txt")), "through bob");
    Ok(())
}

#[test]
fn test_relay_keeps_nice() -> Result<()> {
    let net = Net::new("relaynice", &["alice", "bob", "carol"]);
    let alice = alice_via_bob(&net);
    let bob = net.ctx("bob");

    let src = net.root.path().join("letter");
    write_file(&src, b"x");
    tx_file(&alice, &peer(&alice, &net.id("carol")), 32, &src, "letter.txt", 0)?;
    deliver(&alice, &bob)?;
    toss(&bob, &net.id("alice"), &TossOptions::default())?;

    let relayed: Vec<_> = bob.spool.jobs(&net.id("carol"), Direction::Tx)?.collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].nice, 32);
    Ok(())
}

#[test]
fn test_unknown_transit_target_is_bad() -> Result<()> {
    let net = Net::new("relayunknown", &["alice", "bob", "carol"]);
    let alice = alice_via_bob(&net);
    let bob = net.ctx_with("bob", |n| n.name != "carol");

    let src = net.root.path().join("letter");
    write_file(&src, b"x");
    tx_file(&alice, &peer(&alice, &net.id("carol")), 32, &src, "letter.txt", 0)?;
    deliver(&alice, &bob)?;

    let report = toss(&bob, &net.id("alice"), &TossOptions::default())?;
    assert_eq!(report.bad, 1);
    assert_eq!(queued(&bob, &net.id("alice"), Direction::Rx), 1);
    assert_eq!(queued(&bob, &net.id("carol"), Direction::Tx), 0);
    Ok(())
}
