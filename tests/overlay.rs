mod common;

use std::{sync::Arc, time::Duration};

use common::{ipv4_packet, limiter, memory_bridge, take_far_end};
use libp2p::{identity::Keypair, multiaddr::Protocol, Multiaddr, PeerId};
use skypier::daemon::{
    actors::{
        overlay::{Overlay, OverlayConfig, OverlayMessage},
        peer_collection::{PeerCollection, PeerCollectionMessage},
        tunnel::{Tunnel, TunnelMessage},
        Actor, Addr,
    },
    addresses::PeerResolver,
    error::DaemonError,
    governor::{ConnectionGovernor, GovernorConfig},
    packet::Packet,
    role::Role,
};
use tokio::{io::AsyncWriteExt, sync::mpsc, time::timeout};

struct Node {
    peer_id: PeerId,
    overlay: Addr<OverlayMessage>,
    tunnel: Addr<TunnelMessage>,
    sessions: Addr<PeerCollectionMessage>,
}

fn start_node(role: Role) -> Node {
    let keypair = Keypair::generate_ed25519();
    let config = OverlayConfig {
        advertise_private_addresses: true,
        ..OverlayConfig::default()
    };
    let governor = ConnectionGovernor::shared(GovernorConfig::default());
    let overlay = Overlay::new(keypair, config, governor).unwrap();
    let peer_id = overlay.local_peer_id();
    let overlay_address = overlay.get_addr();

    let sessions = PeerCollection::new();
    let sessions_address = sessions.get_addr();
    let tunnel = Tunnel::new(
        overlay.stream_control(),
        Arc::new(overlay_address.clone()),
        limiter(16, 4),
        Arc::new(role),
        sessions_address.clone(),
    )
    .unwrap();
    let tunnel_address = tunnel.get_addr();

    tokio::spawn(overlay.run());
    tokio::spawn(sessions.run());
    tokio::spawn(tunnel.run());
    Node {
        peer_id,
        overlay: overlay_address,
        tunnel: tunnel_address,
        sessions: sessions_address,
    }
}

/// The node's loopback TCP address, once it is listening.
async fn loopback_address(node: &Node) -> Multiaddr {
    loop {
        let listening = node
            .overlay
            .request(OverlayMessage::ListenAddresses)
            .await
            .unwrap();
        let loopback = listening.into_iter().find(|addr| {
            let mut protocols = addr.iter();
            matches!(protocols.next(), Some(Protocol::Ip4(ip)) if ip.is_loopback())
                && matches!(protocols.next(), Some(Protocol::Tcp(_)))
        });
        if let Some(addr) = loopback {
            return addr.with(Protocol::P2p(node.peer_id));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn join_resolve_and_tunnel_between_two_nodes() {
    timeout(Duration::from_secs(60), async {
        let (bridge, far_end) = memory_bridge();
        let host = start_node(Role::host(bridge.clone()));
        let (sink, mut delivered) = mpsc::channel(16);
        let client = start_node(Role::client(Addr::new(sink)));

        let rendezvous = loopback_address(&host).await;
        let joined = client
            .overlay
            .request(|reply| OverlayMessage::Join(vec![rendezvous], reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined, 1);

        let addresses = client.overlay.resolve(host.peer_id).await.unwrap();
        assert_eq!(addresses.peer(), host.peer_id);
        assert!(!addresses.is_empty());
        assert!(addresses
            .ips()
            .contains(&std::net::IpAddr::from([127, 0, 0, 1])));

        client
            .tunnel
            .request(|reply| TunnelMessage::Open(host.peer_id, reply))
            .await
            .unwrap()
            .unwrap();

        // Wait for the host to register the accepted stream.
        loop {
            let peers = host
                .sessions
                .request(PeerCollectionMessage::Peers)
                .await
                .unwrap();
            if peers == vec![(client.peer_id, 1)] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The host sends what its interface produces down the tunnel.
        bridge.create().await.unwrap();
        let mut device = take_far_end(&far_end);
        let packet = ipv4_packet([1, 1, 1, 1], [10, 1, 1, 2], b"hello");
        device.write_all(&packet).await.unwrap();
        match delivered.recv().await {
            Some(Packet::Incoming(content)) => assert_eq!(&content[..], &packet[..]),
            other => panic!("unexpected {:?}", other),
        }

        let removed = client
            .sessions
            .request(|reply| PeerCollectionMessage::RemovePeer(host.peer_id, reply))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(client
            .overlay
            .request(|reply| OverlayMessage::Disconnect(host.peer_id, reply))
            .await
            .unwrap());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resolving_an_unknown_peer_fails() {
    timeout(Duration::from_secs(90), async {
        let (sink, _delivered) = mpsc::channel(1);
        let node = start_node(Role::client(Addr::new(sink)));
        let joined = node
            .overlay
            .request(|reply| OverlayMessage::Join(Vec::new(), reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined, 0);

        let stranger = PeerId::random();
        assert!(matches!(
            node.overlay.resolve(stranger).await,
            Err(DaemonError::PeerNotFound(peer)) if peer == stranger
        ));
        assert!(matches!(
            node.tunnel
                .request(|reply| TunnelMessage::Open(stranger, reply))
                .await
                .unwrap(),
            Err(DaemonError::PeerNotFound(_))
        ));
    })
    .await
    .expect("test timed out");
}
