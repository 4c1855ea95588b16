// End-to-end discovery tests over localhost UDP.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::UdpSocket;

use shardnet_common::crypto::NodeId;
use shardnet_common::serializer::Serializer;
use shardnet_network::config::DISCOVERY_PROTOCOL_VERSION;
use shardnet_network::discovery::message::Ping;
use shardnet_network::discovery::{DiscoveryMessage, Node, UdpTransport};

fn local_node(shard: u16) -> Node {
    // port 0: the transport patches in the OS-assigned port
    Node::new(NodeId::random(), IpAddr::V4(Ipv4Addr::LOCALHOST), 0, shard)
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test]
async fn test_bootstrap_ping_pong_populates_both_databases() {
    let _ = env_logger::builder().is_test(true).try_init();

    let b = UdpTransport::new(local_node(1), Vec::new(), None, None)
        .await
        .unwrap();
    b.clone().start().await;

    let a = UdpTransport::new(
        local_node(1),
        Vec::new(),
        Some(b.self_node().clone()),
        None,
    )
    .await
    .unwrap();
    a.clone().start().await;

    let a_id = a.self_node().id;
    let b_id = b.self_node().id;

    // one ping/pong round fills both databases
    assert!(
        wait_until(
            || a.db().contains(&b_id) && b.db().contains(&a_id),
            Duration::from_secs(5)
        )
        .await
    );

    // both tables now serve random snapshots containing the other node
    assert!(
        wait_until(
            || a.get_rand_nodes(16).iter().any(|n| n.id == b_id),
            Duration::from_secs(5)
        )
        .await
    );

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_find_node_learns_closer_nodes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let b = UdpTransport::new(local_node(1), Vec::new(), None, None)
        .await
        .unwrap();
    b.clone().start().await;

    // B knows a third node C of its own shard
    let c = Node::new(
        NodeId::random(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        39999,
        1,
    );
    b.add_node(c.clone());

    let a = UdpTransport::new(local_node(1), Vec::new(), None, None)
        .await
        .unwrap();
    a.clone().start().await;
    a.add_node(b.self_node().clone());

    // querying B for C's own coordinate must return C: its distance to
    // the target is zero, strictly closer than B itself
    a.find_node(c.sha(), b.self_node()).await;

    assert!(
        wait_until(|| a.db().contains(&c.id), Duration::from_secs(5)).await,
        "A never learned C from B's neighbors reply"
    );

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_hostile_datagrams_are_tolerated() {
    let _ = env_logger::builder().is_test(true).try_init();

    let b = UdpTransport::new(local_node(1), Vec::new(), None, None)
        .await
        .unwrap();
    b.clone().start().await;
    let addr = b.self_node().udp_addr();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // garbage bytes
    socket.send_to(&[0xde, 0xad, 0xbe, 0xef], addr).await.unwrap();
    // empty datagram
    socket.send_to(&[], addr).await.unwrap();
    // ping with a wrong protocol version
    let bad_ping = DiscoveryMessage::Ping(Ping {
        version: DISCOVERY_PROTOCOL_VERSION + 1,
        id: NodeId::random(),
        shard: 1,
    });
    socket.send_to(&bad_ping.to_bytes(), addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.node_count(), 0);

    // the transport is still alive: a valid ping gets through
    let good_id = NodeId::random();
    let good_ping = DiscoveryMessage::Ping(Ping {
        version: DISCOVERY_PROTOCOL_VERSION,
        id: good_id,
        shard: 1,
    });
    socket.send_to(&good_ping.to_bytes(), addr).await.unwrap();

    assert!(wait_until(|| b.db().contains(&good_id), Duration::from_secs(5)).await);

    b.stop();
}
