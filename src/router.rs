use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec;
use crate::peer::Peer;
use crate::protocol::{BROADCAST_TARGET, ServerMessage};
use crate::registry::Registry;

/// Applies chat semantics on top of the registry: fan-out, directed sends and
/// online queries. A recipient that cannot take a frame is evicted and the
/// operation carries on with everyone else.
#[derive(Clone)]
pub struct Router {
    registry: Registry,
}

impl Router {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Delivers `message` to every registered peer. Returns how many took it.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        self.fan_out(message, None)
    }

    pub fn broadcast_except(&self, message: &ServerMessage, skip: &str) -> usize {
        self.fan_out(message, Some(skip))
    }

    /// Handles an inbound `message` envelope from `from`.
    pub fn send_chat(&self, from: &str, sender: &Peer, to: &str, body: String) {
        let chat = ServerMessage::chat(from, to, body);

        if to == BROADCAST_TARGET {
            self.broadcast(&chat);
            return;
        }

        let Some(target) = self.registry.lookup(to) else {
            debug!(from, to, "directed send to unknown user");
            self.reply(from, sender, &ServerMessage::system(format!("user '{to}' not found")));
            return;
        };

        let Some(frame) = encode(&chat) else { return };

        if target.id() == sender.id() {
            self.deliver(from, sender, frame);
            return;
        }

        if self.deliver(to, &target, frame.clone()) {
            self.deliver(from, sender, frame);
        } else {
            self.reply(from, sender, &ServerMessage::system(format!("failed to deliver to {to}")));
        }
    }

    /// Tells everyone who is online now. Called whenever that set changes.
    pub fn push_online_list(&self) -> usize {
        let users = self.registry.snapshot();
        self.broadcast(&ServerMessage::OnlineList { users })
    }

    pub fn send_online_list(&self, name: &str, peer: &Peer) {
        let users = self.registry.snapshot();
        self.reply(name, peer, &ServerMessage::OnlineList { users });
    }

    /// Sends `message` to one registered peer.
    pub fn reply(&self, name: &str, peer: &Peer, message: &ServerMessage) -> bool {
        match encode(message) {
            Some(frame) => self.deliver(name, peer, frame),
            None => false,
        }
    }

    fn fan_out(&self, message: &ServerMessage, skip: Option<&str>) -> usize {
        let Some(frame) = encode(message) else { return 0 };

        let mut delivered = 0;
        for (name, peer) in self.registry.targets() {
            if Some(name.as_str()) == skip {
                continue;
            }
            if self.deliver(&name, &peer, frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver(&self, name: &str, peer: &Peer, frame: Bytes) -> bool {
        match peer.send(frame) {
            Ok(()) => true,
            Err(err) => {
                warn!(name, peer = %peer.addr(), error = %err, "delivery failed, evicting");
                self.registry.unregister(name, peer.id());
                peer.close();
                false
            }
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Bytes> {
    match codec::encode(message) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(error = %err, "failed to encode outbound message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use tokio::time::timeout;

    use super::*;
    use crate::peer::Outbox;

    fn join(registry: &Registry, name: &str, capacity: usize) -> (Peer, Outbox) {
        let addr: SocketAddr = "127.0.0.1:5555".parse().expect("addr");
        let (peer, outbox) = Peer::new(addr, capacity);
        registry
            .register(name, peer.clone(), |_| {})
            .expect("register");
        (peer, outbox)
    }

    #[test]
    fn broadcast_reaches_everyone_including_sender() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (alice, mut a_rx) = join(&registry, "alice", 8);
        let (_bob, mut b_rx) = join(&registry, "bob", 8);
        let (_carol, mut c_rx) = join(&registry, "carol", 8);

        router.send_chat("alice", &alice, "all", "x".into());

        for outbox in [&mut a_rx, &mut b_rx, &mut c_rx] {
            let received = outbox.drain();
            assert_eq!(received.len(), 1);
            assert!(matches!(
                &received[0],
                ServerMessage::Message { from, to, msg, .. }
                    if from == "alice" && to == "all" && msg == "x"
            ));
        }
    }

    #[test]
    fn directed_send_reaches_target_and_echoes_to_sender_only() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (alice, mut a_rx) = join(&registry, "alice", 8);
        let (_bob, mut b_rx) = join(&registry, "bob", 8);
        let (_carol, mut c_rx) = join(&registry, "carol", 8);

        router.send_chat("alice", &alice, "bob", "y".into());

        let to_bob = b_rx.drain();
        let to_alice = a_rx.drain();
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob, to_alice);
        assert!(c_rx.drain().is_empty());
    }

    #[test]
    fn directed_send_to_self_is_delivered_once() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (alice, mut a_rx) = join(&registry, "alice", 8);

        router.send_chat("alice", &alice, "alice", "note".into());

        assert_eq!(a_rx.drain().len(), 1);
    }

    #[test]
    fn unknown_recipient_gets_a_system_notice() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (alice, mut a_rx) = join(&registry, "alice", 8);
        let (_bob, mut b_rx) = join(&registry, "bob", 8);

        router.send_chat("alice", &alice, "ghost", "z".into());

        let received = a_rx.drain();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            &received[0],
            ServerMessage::System { msg, .. } if msg.contains("ghost")
        ));
        assert!(b_rx.drain().is_empty());
    }

    #[tokio::test]
    async fn failed_recipient_is_evicted_and_broadcast_continues() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (alice, mut a_rx) = join(&registry, "alice", 8);
        let (stuck, _stuck_rx) = join(&registry, "stuck", 1);
        let (_bob, mut b_rx) = join(&registry, "bob", 8);

        stuck.send(Bytes::from_static(b"filler\n")).expect("fill outbox");

        router.send_chat("alice", &alice, "all", "hello".into());

        assert_eq!(a_rx.drain().len(), 1);
        assert_eq!(b_rx.drain().len(), 1);
        assert!(!registry.contains("stuck"));
        timeout(Duration::from_secs(1), stuck.closed())
            .await
            .expect("evicted peer should be told to close");
    }

    #[test]
    fn failed_directed_send_is_reported_to_sender() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (alice, mut a_rx) = join(&registry, "alice", 8);
        let (_bob, b_rx) = join(&registry, "bob", 8);
        drop(b_rx);

        router.send_chat("alice", &alice, "bob", "lost".into());

        let received = a_rx.drain();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            &received[0],
            ServerMessage::System { msg, .. } if msg == "failed to deliver to bob"
        ));
        assert_eq!(registry.snapshot(), vec!["alice".to_string()]);
    }

    #[test]
    fn online_list_and_broadcast_except() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (alice, mut a_rx) = join(&registry, "alice", 8);
        let (_bob, mut b_rx) = join(&registry, "bob", 8);

        assert_eq!(router.broadcast_except(&ServerMessage::system("bob joined"), "bob"), 1);
        assert_eq!(a_rx.drain().len(), 1);
        assert!(b_rx.drain().is_empty());

        router.send_online_list("alice", &alice);
        assert_eq!(
            a_rx.drain(),
            vec![ServerMessage::OnlineList {
                users: vec!["alice".into(), "bob".into()]
            }]
        );
    }

    #[test]
    fn online_list_push_reaches_everyone() {
        let registry = Registry::default();
        let router = Router::new(registry.clone());
        let (_alice, mut a_rx) = join(&registry, "alice", 8);
        let (_bob, mut b_rx) = join(&registry, "bob", 8);

        assert_eq!(router.push_online_list(), 2);

        let expected = vec![ServerMessage::OnlineList {
            users: vec!["alice".into(), "bob".into()],
        }];
        assert_eq!(a_rx.drain(), expected);
        assert_eq!(b_rx.drain(), expected);
    }
}
