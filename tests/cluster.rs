use rdsm::{Cluster, ClusterConfig, RdsmError, Role, SimFabric};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const HEAP: usize = 1 << 16;

/// Bootstrap `n` servers on one simulated fabric and wait until all are ready.
fn start_cluster(n: usize, tweak: impl Fn(&mut ClusterConfig)) -> Vec<Arc<Cluster<SimFabric>>> {
    let fabric = SimFabric::new();
    let mut config = ClusterConfig::local(n, HEAP);
    tweak(&mut config);
    let servers: Vec<_> = (0..n)
        .map(|i| Arc::new(Cluster::new(fabric.clone(), config.clone(), i).unwrap()))
        .collect();
    for server in &servers {
        server.spawn_server().unwrap();
    }
    for server in &servers {
        server.server_ready().unwrap();
    }
    servers
}

fn stop_cluster(servers: Vec<Arc<Cluster<SimFabric>>>) {
    for server in &servers {
        server.shutdown();
    }
}

fn global(peer: usize, offset: usize) -> usize {
    peer * HEAP + offset
}

// ============================================================================
// Bootstrap
// ============================================================================

fn check_mesh(n: usize) {
    let servers = start_cluster(n, |_| {});
    for (i, server) in servers.iter().enumerate() {
        assert!(server.is_ready());
        assert!(server.fault().is_none());
        assert_eq!(server.context_count(), n - 1);
        for j in (0..n).filter(|&j| j != i) {
            let mine = server.link_info(j).unwrap();
            let theirs = servers[j].link_info(i).unwrap();
            assert_eq!(mine.slot, if j < i { j } else { j - 1 });
            assert_eq!(mine.local_qp_num, theirs.peer_qp_num);
            assert_eq!(mine.peer_qp_num, theirs.local_qp_num);
            assert_eq!(mine.role == Role::Active, i < j);
            assert_ne!(mine.role, theirs.role);
        }
        assert!(matches!(
            server.link_info(i),
            Err(RdsmError::SelfDestination { .. })
        ));
    }
    stop_cluster(servers);
}

#[test]
fn test_mesh_of_two() {
    check_mesh(2);
}

#[test]
fn test_mesh_of_three() {
    check_mesh(3);
}

#[test]
fn test_mesh_of_eight() {
    check_mesh(8);
}

#[test]
fn test_server_ready_is_idempotent() {
    let servers = start_cluster(2, |_| {});
    servers[0].server_ready().unwrap();
    servers[1].server_ready().unwrap();
    stop_cluster(servers);
}

#[test]
fn test_operations_before_ready_fail() {
    let fabric = SimFabric::new();
    let server = Cluster::new(fabric, ClusterConfig::local(2, HEAP), 0).unwrap();
    assert!(matches!(server.write(0, HEAP, 8), Err(RdsmError::NotReady)));
    assert!(matches!(server.link_info(1), Err(RdsmError::NotReady)));
}

#[test]
fn test_start_server_twice_is_rejected() {
    let fabric = SimFabric::new();
    let server = Cluster::new(fabric, ClusterConfig::local(1, HEAP), 0).unwrap();
    server.start_server().unwrap();
    assert!(matches!(server.start_server(), Err(RdsmError::Config(_))));
}

#[test]
fn test_invalid_server_index() {
    let err = Cluster::new(SimFabric::new(), ClusterConfig::local(2, HEAP), 2).unwrap_err();
    assert!(matches!(
        err,
        RdsmError::InvalidServerIndex {
            index: 2,
            cluster_size: 2
        }
    ));
}

#[test]
fn test_missing_peer_times_out() {
    let fabric = SimFabric::new();
    let mut config = ClusterConfig::local(2, HEAP);
    config.dial_retry_window = Duration::from_millis(100);
    config.handshake_timeout = Duration::from_millis(100);
    let server = Arc::new(Cluster::new(fabric, config, 0).unwrap());
    server.spawn_server().unwrap();
    let err = server.server_ready().unwrap_err();
    assert!(
        matches!(err, RdsmError::Device { .. } | RdsmError::HandshakeTimeout { .. }),
        "{err}"
    );
    server.shutdown();
}

// ============================================================================
// Single server
// ============================================================================

#[test]
fn test_single_server_mode() {
    let servers = start_cluster(1, |_| {});
    let server = &servers[0];
    assert!(server.is_ready());
    server.write_local(0, b"solo").unwrap();
    let mut out = [0u8; 4];
    server.read_local(0, &mut out).unwrap();
    assert_eq!(&out, b"solo");
    assert!(matches!(
        server.write(0, 0, 4),
        Err(RdsmError::SelfDestination { peer: 0 })
    ));
    assert!(matches!(
        server.read_sync(0, 8, 4, 0),
        Err(RdsmError::SelfDestination { peer: 0 })
    ));
    stop_cluster(servers);
}

// ============================================================================
// Data operations
// ============================================================================

#[test]
fn test_write_read_round_trip() {
    let servers = start_cluster(2, |_| {});
    for (i, len) in [1usize, 4, 512, 1024].into_iter().enumerate() {
        let data: Vec<u8> = (0..len).map(|b| (b as u8).wrapping_mul(7).wrapping_add(i as u8)).collect();
        let src_off = 4096;
        let dst_off = 8192 * (i + 1);
        servers[0].write_local(src_off, &data).unwrap();
        let addr = servers[0]
            .write_sync(src_off, global(1, dst_off), len, i)
            .unwrap();
        assert_eq!(addr, servers[0].local_address(src_off).unwrap());

        let mut landed = vec![0u8; len];
        servers[1].read_local(dst_off, &mut landed).unwrap();
        assert_eq!(landed, data);

        let back_off = 32768;
        servers[0]
            .read_sync(back_off, global(1, dst_off), len, i)
            .unwrap();
        let mut back = vec![0u8; len];
        servers[0].read_local(back_off, &mut back).unwrap();
        assert_eq!(back, data);
    }
    stop_cluster(servers);
}

#[test]
fn test_heap_boundaries() {
    let servers = start_cluster(2, |_| {});
    let data = [0xabu8; 16];
    servers[1].write_local(0, &data).unwrap();

    // Last 16 bytes of the peer heap.
    servers[1]
        .write_sync(0, global(0, HEAP - 16), 16, 0)
        .unwrap();
    let mut out = [0u8; 16];
    servers[0].read_local(HEAP - 16, &mut out).unwrap();
    assert_eq!(out, data);

    assert!(matches!(
        servers[1].write(0, global(0, HEAP - 15), 16),
        Err(RdsmError::OutOfBounds { .. })
    ));
    assert!(matches!(
        servers[1].read(HEAP - 8, global(0, 0), 16),
        Err(RdsmError::OutOfBounds { .. })
    ));
    assert!(matches!(
        servers[1].write(0, global(2, 0), 8),
        Err(RdsmError::InvalidPeer { peer: 2, .. })
    ));
    assert!(servers[1].fault().is_none());
    stop_cluster(servers);
}

#[test]
fn test_plain_write_then_sync_read_observes_it() {
    let servers = start_cluster(3, |_| {});
    servers[2].write_local(0, b"unsynchronized").unwrap();
    servers[2].write(0, global(0, 100), 14).unwrap();
    // The sync read on the same link is ordered behind the write.
    servers[2].read_sync(200, global(0, 100), 14, 3).unwrap();
    let mut out = [0u8; 14];
    servers[2].read_local(200, &mut out).unwrap();
    assert_eq!(&out, b"unsynchronized");
    stop_cluster(servers);
}

#[test]
fn test_flag_out_of_range() {
    let servers = start_cluster(2, |c| c.max_flags = 16);
    assert!(matches!(
        servers[0].write_sync(0, global(1, 0), 8, 16),
        Err(RdsmError::FlagOutOfRange {
            flag: 16,
            max_flags: 16
        })
    ));
    servers[0].write_sync(0, global(1, 0), 8, 15).unwrap();
    // Local atomics only range-check their flag.
    assert!(matches!(
        servers[0].local_atomic_compare_exchange_sync(0, 8, 0, 1, 16),
        Err(RdsmError::FlagOutOfRange { flag: 16, .. })
    ));
    servers[0].local_atomic_compare_exchange_sync(0, 8, 0, 1, 15).unwrap();
    stop_cluster(servers);
}

#[test]
fn test_large_transfers_are_chunked() {
    let servers = start_cluster(2, |c| c.max_transfer_bytes = 1000);
    let len = 4096 + 17;
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    servers[1].write_local(0, &data).unwrap();
    servers[1]
        .write_large_sync(0, global(0, 16384), len, 1)
        .unwrap();
    let mut landed = vec![0u8; len];
    servers[0].read_local(16384, &mut landed).unwrap();
    assert_eq!(landed, data);

    let addr = servers[0]
        .read_large_sync(32768, global(1, 0), len, 2)
        .unwrap();
    assert_eq!(addr, servers[0].local_address(32768).unwrap());
    let mut back = vec![0u8; len];
    servers[0].read_local(32768, &mut back).unwrap();
    assert_eq!(back, data);
    stop_cluster(servers);
}

#[test]
fn test_copy_local_overlapping() {
    let servers = start_cluster(1, |_| {});
    let server = &servers[0];
    server.write_local(0, b"abcdefgh").unwrap();
    let addr = server.copy_local(0, 2, 8).unwrap();
    assert_eq!(addr, server.local_address(2).unwrap());
    let mut out = [0u8; 10];
    server.read_local(0, &mut out).unwrap();
    assert_eq!(&out, b"ababcdefgh");
    assert!(matches!(
        server.copy_local(HEAP - 4, 0, 8),
        Err(RdsmError::OutOfBounds { .. })
    ));
    stop_cluster(servers);
}

// ============================================================================
// Atomics
// ============================================================================

#[test]
fn test_compare_exchange_single_winner() {
    let servers = start_cluster(4, |_| {});
    let word = global(0, 64);
    let mut winners = Vec::new();
    for (i, server) in servers.iter().enumerate().skip(1) {
        server
            .atomic_compare_exchange_sync(0, word, 0, i as u64, 0)
            .unwrap();
        if server.read_local_u64(0).unwrap() == 0 {
            winners.push(i);
        }
    }
    assert_eq!(winners, vec![1]);
    assert_eq!(servers[0].read_local_u64(64).unwrap(), 1);
    stop_cluster(servers);
}

#[test]
fn test_compare_exchange_contended() {
    let servers = start_cluster(4, |_| {});
    let word = global(0, 128);
    let handles: Vec<_> = servers
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, server)| {
            let server = Arc::clone(server);
            std::thread::spawn(move || {
                server
                    .atomic_compare_exchange_sync(8, word, 0, i as u64, 1)
                    .unwrap();
                (i, server.read_local_u64(8).unwrap())
            })
        })
        .collect();
    let results: Vec<(usize, u64)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<usize> = results
        .iter()
        .filter(|(_, prior)| *prior == 0)
        .map(|(i, _)| *i)
        .collect();
    assert_eq!(winners.len(), 1);
    let stored = servers[0].read_local_u64(128).unwrap();
    assert_eq!(stored, winners[0] as u64);
    for (i, prior) in results {
        if i != winners[0] {
            assert_eq!(prior, stored);
        }
    }
    stop_cluster(servers);
}

#[test]
fn test_fetch_add_is_linearizable() {
    const ROUNDS: usize = 50;
    let servers = start_cluster(3, |_| {});
    let word = global(2, 256);
    let handles: Vec<_> = servers
        .iter()
        .map(|server| {
            let server = Arc::clone(server);
            std::thread::spawn(move || {
                (0..ROUNDS)
                    .map(|_| {
                        if server.self_index() == 2 {
                            // The owner reaches its own word through a peer link.
                            server
                                .local_atomic_compare_exchange_sync(16, word, 0, 0, 0)
                                .unwrap();
                            None
                        } else {
                            server.atomic_fetch_add_sync(16, word, 1, 0).unwrap();
                            Some(server.read_local_u64(16).unwrap())
                        }
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut seen = HashSet::new();
    for handle in handles {
        for prior in handle.join().unwrap().into_iter().flatten() {
            assert!(seen.insert(prior), "prior value {prior} returned twice");
        }
    }
    let total = (2 * ROUNDS) as u64;
    assert_eq!(seen, (0..total).collect::<HashSet<_>>());
    assert_eq!(servers[2].read_local_u64(256).unwrap(), total);
    stop_cluster(servers);
}

#[test]
fn test_plain_atomics_then_sync() {
    let servers = start_cluster(2, |_| {});
    let word = global(1, 512);
    servers[0].atomic_fetch_add(0, word, 5).unwrap();
    servers[0].atomic_compare_exchange(8, word, 5, 40).unwrap();
    servers[0].atomic_fetch_add_sync(16, word, 2, 0).unwrap();
    assert_eq!(servers[0].read_local_u64(0).unwrap(), 0);
    assert_eq!(servers[0].read_local_u64(8).unwrap(), 5);
    assert_eq!(servers[0].read_local_u64(16).unwrap(), 40);
    assert_eq!(servers[1].read_local_u64(512).unwrap(), 42);
    stop_cluster(servers);
}

#[test]
fn test_misaligned_atomic_rejected() {
    let servers = start_cluster(2, |_| {});
    assert!(matches!(
        servers[0].atomic_fetch_add(0, global(1, 12), 1),
        Err(RdsmError::Misaligned { offset: 12, .. })
    ));
    assert!(matches!(
        servers[0].local_atomic_compare_exchange_sync(0, 4, 0, 1, 0),
        Err(RdsmError::Misaligned { offset: 4, .. })
    ));
    assert!(servers[0].fault().is_none());
    stop_cluster(servers);
}

#[test]
fn test_local_compare_exchange() {
    let servers = start_cluster(2, |_| {});
    let server = &servers[1];
    server.write_local_u64(1024, 7).unwrap();

    // The peer part of the offset is ignored.
    let dst = global(0, 1024);
    server
        .local_atomic_compare_exchange_sync(0, dst, 7, 9, 5)
        .unwrap();
    assert_eq!(server.read_local_u64(0).unwrap(), 7);
    assert_eq!(server.read_local_u64(1024).unwrap(), 9);

    server
        .local_atomic_compare_exchange_sync(0, dst, 7, 11, 5)
        .unwrap();
    assert_eq!(server.read_local_u64(0).unwrap(), 9);
    assert_eq!(server.read_local_u64(1024).unwrap(), 9);

    // Server 0 never saw it.
    assert_eq!(servers[0].read_local_u64(1024).unwrap(), 0);
    stop_cluster(servers);
}

#[test]
fn test_local_compare_exchange_needs_a_peer() {
    let servers = start_cluster(1, |_| {});
    assert!(matches!(
        servers[0].local_atomic_compare_exchange_sync(0, 8, 0, 1, 0),
        Err(RdsmError::Config(_))
    ));
    stop_cluster(servers);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ready_async() {
    let fabric = SimFabric::new();
    let config = ClusterConfig::local(3, HEAP);
    let servers: Vec<_> = (0..3)
        .map(|i| Arc::new(Cluster::new(fabric.clone(), config.clone(), i).unwrap()))
        .collect();
    for server in &servers {
        server.spawn_server().unwrap();
    }
    for server in &servers {
        server.ready_async().await.unwrap();
    }
    servers[0].write_local(0, b"async").unwrap();
    servers[0].write_sync(0, global(2, 0), 5, 0).unwrap();
    let mut out = [0u8; 5];
    servers[2].read_local(0, &mut out).unwrap();
    assert_eq!(&out, b"async");
    stop_cluster(servers);
}

#[test]
fn test_shutdown_is_idempotent() {
    let servers = start_cluster(3, |_| {});
    servers[1].shutdown();
    servers[1].shutdown();
    assert!(servers[1].stop_signal().is_stopped());
    assert!(matches!(
        servers[1].write(0, global(0, 0), 8),
        Err(RdsmError::Cancelled)
    ));
    stop_cluster(servers);
}

#[test]
fn test_peer_disconnect_tears_down_link() {
    let fabric = SimFabric::new();
    let config = ClusterConfig::local(2, HEAP);
    let servers: Vec<_> = (0..2)
        .map(|i| Arc::new(Cluster::new(fabric.clone(), config.clone(), i).unwrap()))
        .collect();
    for server in &servers {
        server.spawn_server().unwrap();
    }
    for server in &servers {
        server.server_ready().unwrap();
    }
    // Heap region plus two control buffers on each end of the link.
    assert_eq!(fabric.registration_count(), 6);
    assert!(servers[0].is_linked(1).unwrap());

    servers[1].shutdown();
    for _ in 0..200 {
        if !servers[0].is_linked(1).unwrap() && fabric.registration_count() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!servers[0].is_linked(1).unwrap());
    assert_eq!(fabric.registration_count(), 0);
    assert!(servers[0].fault().is_none());
    assert!(matches!(
        servers[0].write(0, global(1, 0), 8),
        Err(RdsmError::PeerDisconnected { peer: 1 })
    ));
    assert!(matches!(
        servers[0].local_atomic_compare_exchange_sync(0, 0, 0, 1, 0),
        Err(RdsmError::PeerDisconnected { peer: 1 })
    ));
    stop_cluster(servers);
}
