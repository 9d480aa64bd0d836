//! Multiplexing behaviour of one RemoteConnection over an in-memory socket.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

use common::{eventually, instance, spawn_remote, spawn_remote_on, within, BrokenSocket};
use protomux::engine::{Connection, MuxError, RemoteState};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatching_candidate_hands_off_to_survivor() {
    let first = instance(|conn: Connection| async move {
        let mut hello = [0u8; 5];
        conn.read_exact(&mut hello).await?;
        assert_eq!(&hello, b"HELO\n");

        let mut more = [0u8; 4];
        conn.read_exact(&mut more).await?;
        conn.write_all(b"ok:").await?;
        conn.write_all(&more).await
    });
    let second = instance(|conn: Connection| async move {
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await?;
        assert!(n > 0);
        Err(MuxError::Protocol("not mine".into()))
    });

    let (remote, mut client, reporter) = spawn_remote(vec![first, second]);
    client.write_all(b"HELO\n").await.unwrap();

    eventually(|| remote.live_count() == 1).await;
    assert_eq!(remote.state(), RemoteState::Solo);

    client.write_all(b"more").await.unwrap();
    let mut reply = Vec::new();
    within(client.read_to_end(&mut reply)).await.unwrap();
    assert_eq!(reply, b"ok:more");

    eventually(|| remote.is_finished()).await;
    assert_eq!(remote.state(), RemoteState::Closed);
    assert_eq!(reporter.normal_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_preamble_reaches_the_wire_once() {
    let candidates = (0..3u8)
        .map(|i| {
            instance(move |conn: Connection| async move {
                conn.write_all(&[0, 1, 2, 3]).await?;
                conn.write_all(&[b'a' + i]).await
            })
        })
        .collect();

    let (remote, mut client, _) = spawn_remote(candidates);

    let mut preamble = [0u8; 4];
    within(client.read_exact(&mut preamble)).await.unwrap();
    assert_eq!(preamble, [0, 1, 2, 3]);

    // Divergent bytes stay queued while all three are attached.
    let mut extra = [0u8; 1];
    let pending = tokio::time::timeout(Duration::from_millis(100), client.read(&mut extra)).await;
    assert!(pending.is_err());

    within(remote.close()).await;
    let mut rest = Vec::new();
    within(client.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
    assert!(remote.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergent_write_finishes_once_alone() {
    let keeper = instance(|conn: Connection| async move {
        conn.write(b"\x00\x01\x02\x03A").await?;
        Ok(())
    });
    let quitter = instance(|conn: Connection| async move {
        let queued =
            tokio::time::timeout(Duration::from_millis(100), conn.write(b"\x00\x01\x02\x03B")).await;
        assert!(queued.is_err());
        Err(MuxError::Protocol("gave up".into()))
    });

    let (_remote, mut client, _) = spawn_remote(vec![keeper, quitter]);

    let mut wire = Vec::new();
    within(client.read_to_end(&mut wire)).await.unwrap();
    assert_eq!(wire, b"\x00\x01\x02\x03A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_write_is_withdrawn() {
    let hesitant = instance(|conn: Connection| async move {
        let gave_up =
            tokio::time::timeout(Duration::from_millis(50), conn.write(b"SECRET")).await;
        assert!(gave_up.is_err());
        let mut buf = [0u8; 8];
        conn.read(&mut buf).await.map(|_| ())
    });
    let late = instance(|conn: Connection| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        conn.write(b"SECRET").await.map(|_| ())
    });

    let (remote, mut client, _) = spawn_remote(vec![hesitant, late]);

    let mut buf = [0u8; 6];
    let leaked = tokio::time::timeout(Duration::from_millis(400), client.read(&mut buf)).await;
    assert!(leaked.is_err(), "withdrawn write reached the peer: {:?}", leaked);

    within(remote.close()).await;
    let mut rest = Vec::new();
    within(client.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equal_priority_goes_to_first_claimant() {
    let (tx, mut results) = mpsc::unbounded_channel();
    let second_may_claim = Arc::new(Notify::new());

    let first = {
        let tx = tx.clone();
        instance(move |conn: Connection| {
            let tx = tx.clone();
            async move {
                let outcome = conn.require_exclusive(0).await;
                let _ = tx.send((0usize, outcome.is_ok()));
                outcome?;
                conn.write_all(b"win").await
            }
        })
    };
    let second = {
        let tx = tx.clone();
        let go = Arc::clone(&second_may_claim);
        instance(move |conn: Connection| {
            let tx = tx.clone();
            let go = Arc::clone(&go);
            async move {
                go.notified().await;
                let outcome = conn.require_exclusive(0).await;
                let _ = tx.send((1usize, outcome.is_ok()));
                let err = outcome.err().expect("second claimant must lose");
                assert!(err.is_closed());
                assert!(conn.is_closed());
                assert!(conn.write(b"late").await.unwrap_err().is_closed());
                Ok(())
            }
        })
    };

    let (remote, mut client, _) = spawn_remote(vec![first, second]);
    eventually(|| remote.state() == RemoteState::Resolving).await;
    second_may_claim.notify_one();

    let mut outcomes = vec![
        within(results.recv()).await.unwrap(),
        within(results.recv()).await.unwrap(),
    ];
    outcomes.sort();
    assert_eq!(outcomes, vec![(0, true), (1, false)]);

    let mut wire = Vec::new();
    within(client.read_to_end(&mut wire)).await.unwrap();
    assert_eq!(wire, b"win");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn highest_priority_wins() {
    let (tx, mut results) = mpsc::unbounded_channel();
    let priorities = [1u32, 5, 3];
    let candidates = priorities
        .iter()
        .enumerate()
        .map(|(index, &priority)| {
            let tx = tx.clone();
            instance(move |conn: Connection| {
                let tx = tx.clone();
                async move {
                    let outcome = conn.require_exclusive(priority).await;
                    let _ = tx.send((index, outcome.is_ok()));
                    outcome
                }
            })
        })
        .collect();

    let (remote, _client, _) = spawn_remote(candidates);

    let mut outcomes = Vec::new();
    for _ in 0..priorities.len() {
        outcomes.push(within(results.recv()).await.unwrap());
    }
    outcomes.sort();
    assert_eq!(outcomes, vec![(0, false), (1, true), (2, false)]);
    eventually(|| remote.is_finished()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_candidate_reads_identical_bytes() {
    const TOTAL: usize = 20_000;
    let (tx, mut results) = mpsc::unbounded_channel();
    let candidates = (0..3usize)
        .map(|index| {
            let tx = tx.clone();
            instance(move |conn: Connection| {
                let tx = tx.clone();
                async move {
                    let mut seen = Vec::new();
                    let mut buf = [0u8; 1000];
                    while seen.len() < TOTAL {
                        let n = conn.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        seen.extend_from_slice(&buf[..n]);
                    }
                    let _ = tx.send((index, seen));
                    Ok(())
                }
            })
        })
        .collect();

    let (remote, mut client, _) = spawn_remote(candidates);
    let data: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    for chunk in data.chunks(3000) {
        client.write_all(chunk).await.unwrap();
    }

    for _ in 0..3 {
        let (_, seen) = within(results.recv()).await.unwrap();
        assert_eq!(seen, data);
    }
    eventually(|| remote.is_finished()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_unblocks_every_waiter() {
    let (tx, mut results) = mpsc::unbounded_channel();
    let reader = {
        let tx = tx.clone();
        instance(move |conn: Connection| {
            let tx = tx.clone();
            async move {
                let mut buf = [0u8; 8];
                let _ = tx.send(("read", conn.read(&mut buf).await.map(|_| ())));
                Ok(())
            }
        })
    };
    let claimant = {
        let tx = tx.clone();
        instance(move |conn: Connection| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(("claim", conn.require_exclusive(0).await));
                Ok(())
            }
        })
    };
    let writer = {
        let tx = tx.clone();
        instance(move |conn: Connection| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(("write", conn.write(b"x").await.map(|_| ())));
                Ok(())
            }
        })
    };

    let (remote, _client, _) = spawn_remote(vec![reader, claimant, writer]);
    eventually(|| remote.state() == RemoteState::Resolving).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    within(remote.close()).await;
    for _ in 0..3 {
        let (what, outcome) = within(results.recv()).await.unwrap();
        assert!(
            outcome.as_ref().is_err_and(MuxError::is_closed),
            "{} returned {:?}",
            what,
            outcome
        );
    }
    assert_eq!(remote.live_count(), 0);
    assert!(remote.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_hangup_while_shared_closes_everyone() {
    let (tx, mut results) = mpsc::unbounded_channel();
    let candidates = (0..2)
        .map(|_| {
            let tx = tx.clone();
            instance(move |conn: Connection| {
                let tx = tx.clone();
                async move {
                    let mut buf = [0u8; 8];
                    let _ = tx.send(conn.read(&mut buf).await);
                    Ok(())
                }
            })
        })
        .collect();

    let (remote, client, _) = spawn_remote(candidates);
    drop(client);

    for _ in 0..2 {
        let outcome = within(results.recv()).await.unwrap();
        assert!(outcome.unwrap_err().is_closed());
    }
    eventually(|| remote.is_finished()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_error_closes_only_the_failing_connection() {
    let (tx, mut results) = mpsc::unbounded_channel();
    let candidates = (0..2)
        .map(|_| {
            let tx = tx.clone();
            instance(move |conn: Connection| {
                let tx = tx.clone();
                async move {
                    let mut buf = [0u8; 8];
                    let _ = tx.send(conn.read(&mut buf).await);
                    Ok(())
                }
            })
        })
        .collect();
    let echo = instance(|conn: Connection| async move {
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await?;
        conn.write_all(&buf).await
    });

    let (healthy, mut client, healthy_reporter) = spawn_remote(vec![echo]);
    let (broken, reporter) = spawn_remote_on(BrokenSocket::on_read(), candidates);

    for _ in 0..2 {
        let outcome = within(results.recv()).await.unwrap();
        assert!(outcome.unwrap_err().is_closed());
    }
    eventually(|| broken.is_finished()).await;
    assert_eq!(broken.state(), RemoteState::Closed);
    assert_eq!(reporter.normal_count(), 1);

    assert!(!healthy.is_closed());
    client.write_all(b"ok").await.unwrap();
    let mut reply = [0u8; 2];
    within(client.read_exact(&mut reply)).await.unwrap();
    assert_eq!(&reply, b"ok");
    assert_eq!(healthy_reporter.normal_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_error_closes_every_blocked_writer() {
    let (tx, mut results) = mpsc::unbounded_channel();
    let candidates = (0..3)
        .map(|_| {
            let tx = tx.clone();
            instance(move |conn: Connection| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(conn.write(b"banner").await);
                    Ok(())
                }
            })
        })
        .collect();

    let (remote, reporter) = spawn_remote_on(BrokenSocket::on_write(), candidates);

    for _ in 0..3 {
        let outcome = within(results.recv()).await.unwrap();
        assert!(outcome.unwrap_err().is_closed());
    }
    eventually(|| remote.is_finished()).await;
    assert_eq!(reporter.normal_count(), 1);
    assert_eq!(remote.live_count(), 0);
}

#[tokio::test]
async fn close_is_idempotent() {
    let conn_checks = instance(|conn: Connection| async move {
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        let mut buf = [0u8; 4];
        assert!(conn.read(&mut buf).await.unwrap_err().is_closed());
        Ok(())
    });
    let idle = instance(|conn: Connection| async move {
        let mut buf = [0u8; 4];
        conn.read(&mut buf).await.map(|_| ())
    });

    let (remote, _client, reporter) = spawn_remote(vec![conn_checks, idle]);
    eventually(|| remote.live_count() == 1).await;

    within(async {
        tokio::join!(remote.close(), remote.close());
        remote.close().await;
    })
    .await;
    assert!(remote.is_finished());
    assert_eq!(reporter.normal_count(), 0);
}

#[tokio::test]
async fn no_candidates_closes_immediately() {
    let (remote, mut client, _) = spawn_remote(Vec::new());
    let mut rest = Vec::new();
    within(client.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
    eventually(|| remote.is_finished()).await;
}

#[tokio::test]
async fn connection_metadata_and_deadlines() {
    let (tx, mut results) = mpsc::unbounded_channel();
    let inspect = instance(move |conn: Connection| {
        let tx = tx.clone();
        async move {
            let deadline = tokio::time::Instant::now();
            let rejected = [
                conn.set_deadline(deadline),
                conn.set_read_deadline(deadline),
                conn.set_write_deadline(deadline),
            ]
            .into_iter()
            .all(|r| matches!(r, Err(MuxError::DeadlinesNotSupported)));
            let _ = tx.send((
                conn.protocol_index(),
                conn.protocol().to_string(),
                conn.remote_name().to_string(),
                conn.peer_addr(),
                rejected,
            ));
            Ok(())
        }
    });

    let (_remote, _client, _) = spawn_remote(vec![inspect]);
    let (index, protocol, remote_name, peer, rejected) = within(results.recv()).await.unwrap();
    assert_eq!(index, 0);
    assert_eq!(protocol, "p0");
    assert_eq!(remote_name, "p0-remote");
    assert!(peer.is_none());
    assert!(rejected);
}
