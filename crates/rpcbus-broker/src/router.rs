//! Message router — the protocol state machine on the broker side.
//!
//! Every buffer a receive task reads is handed here synchronously. The
//! router resolves the sending node by connection id, interprets the
//! envelope kind against the registry, and enqueues forwarded or synthetic
//! envelopes on delivery queues. It never blocks: a saturated destination
//! queue fails that one message.
//!
//! `call` and `return` are forwarded as the raw received bytes; the broker
//! does not reinterpret arguments.

use crate::queue::QueueError;
use crate::registry::{ConnId, NodeEntry, NodeRegistry};
use rpcbus_proto::{Api, Envelope};
use tracing::{debug, error, info, warn};

/// What the receive loop should do after a message is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterVerdict {
    /// Keep reading.
    Continue,
    /// The node was destroyed; the receive loop must return. Its task is
    /// deliberately not aborted by the destroy path — it leaves on its own.
    Disconnect,
}

/// Routes inbound envelopes for all connections.
#[derive(Debug, Clone)]
pub struct Router {
    registry: NodeRegistry,
}

impl Router {
    pub fn new(registry: NodeRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Process one received buffer from `conn_id`.
    pub fn process(&self, conn_id: ConnId, raw: &[u8]) -> RouterVerdict {
        let env = match Envelope::decode(raw) {
            Ok(env) => env,
            Err(err) => {
                info!(conn_id, %err, "discarding undecodable message");
                return RouterVerdict::Continue;
            }
        };

        match env.api {
            Api::Register => {
                debug!(conn_id, snode = %env.snode, "received register");
                self.handle_register(conn_id, env);
                RouterVerdict::Continue
            }
            Api::Call => {
                debug!(conn_id, snode = %env.snode, "received call");
                self.handle_call(conn_id, &env, raw);
                RouterVerdict::Continue
            }
            Api::Return => {
                debug!(conn_id, snode = %env.snode, "received return");
                self.handle_return(conn_id, &env, raw);
                RouterVerdict::Continue
            }
            Api::Exit => {
                debug!(conn_id, snode = %env.snode, "received exit");
                self.handle_exit(conn_id)
            }
            Api::Ack => {
                // Only the broker originates acks.
                warn!(conn_id, "ignoring ack envelope from a node");
                RouterVerdict::Continue
            }
        }
    }

    /// Tear down a connection that hung up without sending exit.
    pub fn disconnect(&self, conn_id: ConnId) {
        if let Some(entry) = self.registry.remove(conn_id) {
            info!(conn_id, name = %entry.name, "connection closed, removing node");
            destroy_entry(entry, true);
        }
    }

    fn handle_register(&self, conn_id: ConnId, env: Envelope) {
        if self.registry.queue_of(conn_id).is_none() {
            error!(conn_id, "register from unknown connection");
            return;
        }
        let name = env.snode;

        // Last registration wins: evict a different connection already
        // holding this name.
        if let Some(stale) = self.registry.conn_by_name(&name) {
            if stale != conn_id {
                info!(conn_id = stale, %name, "evicting previous registration");
                if let Some(entry) = self.registry.remove(stale) {
                    destroy_entry(entry, false);
                }
            }
        }

        // Append descriptors as they parse; the first malformed one aborts
        // the rest but keeps what was already accepted.
        let mut accepted = Vec::new();
        let mut ok = true;
        for descriptor in env.interfaces.unwrap_or_default() {
            match descriptor.validate() {
                Ok(_) => accepted.push(descriptor),
                Err(err) => {
                    warn!(conn_id, %name, interface = %descriptor.name, %err,
                        "malformed interface descriptor, aborting registration");
                    ok = false;
                    break;
                }
            }
        }
        info!(conn_id, %name, interfaces = accepted.len(), "node registered");
        self.registry.set_identity(conn_id, &name, accepted);

        let status = if ok { 0 } else { -1 };
        self.enqueue_for_conn(conn_id, &Envelope::ack(&name, status));
    }

    fn handle_call(&self, conn_id: ConnId, env: &Envelope, raw: &[u8]) {
        let Some(sender_name) = self.registry.name_of(conn_id) else {
            error!(conn_id, "call from unknown connection");
            return;
        };
        let interface = env.interface.clone().unwrap_or_default();

        // Anti-spoofing: the envelope's snode must be the name this
        // connection registered.
        if env.snode != sender_name {
            warn!(conn_id, claimed = %env.snode, actual = %sender_name, "snode mismatch on call");
            self.enqueue_call_error(conn_id, &sender_name, &interface);
            return;
        }
        let Some(dnode) = env.dnode.as_deref() else {
            warn!(conn_id, "call without dnode");
            self.enqueue_call_error(conn_id, &sender_name, &interface);
            return;
        };
        let Some(dest) = self.registry.queue_by_name(dnode) else {
            warn!(conn_id, %dnode, "call to unknown node");
            self.enqueue_call_error(conn_id, &sender_name, &interface);
            return;
        };

        // Forward the received bytes untouched.
        if let Err(err) = dest.put(raw.to_vec()) {
            warn!(conn_id, %dnode, %err, "cannot deliver call");
            self.enqueue_call_error(conn_id, &sender_name, &interface);
        }
    }

    fn handle_return(&self, conn_id: ConnId, env: &Envelope, raw: &[u8]) {
        // Same validation as call, but every failure is a silent drop: the
        // protocol defines no error envelope for return routing.
        let Some(sender_name) = self.registry.name_of(conn_id) else {
            error!(conn_id, "return from unknown connection");
            return;
        };
        if env.snode != sender_name {
            warn!(conn_id, claimed = %env.snode, actual = %sender_name, "snode mismatch on return, dropping");
            return;
        }
        let Some(dnode) = env.dnode.as_deref() else {
            warn!(conn_id, "return without dnode, dropping");
            return;
        };
        let Some(dest) = self.registry.queue_by_name(dnode) else {
            warn!(conn_id, %dnode, "return to unknown node, dropping");
            return;
        };
        if let Err(err) = dest.put(raw.to_vec()) {
            warn!(conn_id, %dnode, %err, "cannot deliver return, dropping");
        }
    }

    fn handle_exit(&self, conn_id: ConnId) -> RouterVerdict {
        if let Some(entry) = self.registry.remove(conn_id) {
            info!(conn_id, name = %entry.name, "node exited");
            // keep_rx: this runs on the node's own receive task, which
            // terminates via the Disconnect verdict rather than aborting
            // itself mid-poll.
            destroy_entry(entry, true);
        } else {
            error!(conn_id, "exit from unknown connection");
        }
        RouterVerdict::Disconnect
    }

    /// Queue the broker's synthetic call failure back to the sender.
    fn enqueue_call_error(&self, conn_id: ConnId, sender_name: &str, interface: &str) {
        self.enqueue_for_conn(conn_id, &Envelope::call_error(sender_name, interface));
    }

    fn enqueue_for_conn(&self, conn_id: ConnId, env: &Envelope) {
        let bytes = match env.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(conn_id, %err, "cannot encode broker envelope");
                return;
            }
        };
        let Some(queue) = self.registry.queue_of(conn_id) else {
            warn!(conn_id, "connection gone before delivery");
            return;
        };
        match queue.put(bytes) {
            Ok(()) | Err(QueueError::Closed) => {}
            Err(err @ QueueError::Full) => {
                warn!(conn_id, %err, "dropping broker envelope");
            }
        }
    }
}

/// Release a removed node's resources. `keep_rx` is set when the caller is
/// the node's own receive task, which must not abort itself.
fn destroy_entry(entry: NodeEntry, keep_rx: bool) {
    let uptime = chrono::Utc::now() - entry.connected_at;
    debug!(conn_id = entry.conn_id, name = %entry.name, uptime_secs = uptime.num_seconds(),
        "destroying node");
    if let Some(tx) = entry.tx_task {
        // Dropping the transmit task releases the delivery receiver and the
        // socket write half; undelivered items go with it.
        tx.abort();
    }
    if !keep_rx {
        if let Some(rx) = entry.rx_task {
            rx.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{delivery_queue, DeliveryReceiver};
    use rpcbus_proto::{InterfaceDescriptor, Value};
    use std::time::Duration;

    fn setup() -> (Router, NodeRegistry) {
        let registry = NodeRegistry::new();
        (Router::new(registry.clone()), registry)
    }

    fn add_conn(registry: &NodeRegistry, conn_id: ConnId) -> DeliveryReceiver {
        let (queue, rx) = delivery_queue();
        registry.insert(conn_id, queue);
        rx
    }

    async fn next_envelope(rx: &mut DeliveryReceiver) -> Envelope {
        let bytes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("queue delivery timed out")
            .expect("queue closed");
        Envelope::decode(&bytes).unwrap()
    }

    async fn assert_nothing_queued(rx: &mut DeliveryReceiver) {
        let res = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(res.is_err(), "unexpected delivery: {res:?}");
    }

    fn register_bytes(name: &str, interfaces: Vec<InterfaceDescriptor>) -> Vec<u8> {
        Envelope::register(name, interfaces).encode().unwrap()
    }

    #[tokio::test]
    async fn test_register_acks_success() {
        let (router, registry) = setup();
        let mut rx = add_conn(&registry, 100);

        let raw = register_bytes("app_sum", vec![InterfaceDescriptor::new("add2", "%d%d", "%d")]);
        assert_eq!(router.process(100, &raw), RouterVerdict::Continue);

        let ack = next_envelope(&mut rx).await;
        assert_eq!(ack.api, Api::Ack);
        assert_eq!(ack.ret, Some(Value::Int(0)));
        assert_eq!(ack.dnode.as_deref(), Some("app_sum"));
        assert_eq!(registry.conn_by_name("app_sum"), Some(100));
        assert_eq!(registry.interfaces_of(100).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_malformed_keeps_prefix_and_acks_failure() {
        let (router, registry) = setup();
        let mut rx = add_conn(&registry, 100);

        let raw = register_bytes(
            "app_sum",
            vec![
                InterfaceDescriptor::new("add2", "%d%d", "%d"),
                InterfaceDescriptor::new("broken", "%x", "%d"),
                InterfaceDescriptor::new("add3", "%d%d%d", "%d"),
            ],
        );
        router.process(100, &raw);

        let ack = next_envelope(&mut rx).await;
        assert_eq!(ack.ret, Some(Value::Int(-1)));
        // Descriptors before the malformed one survive; later ones do not.
        let ifs = registry.interfaces_of(100).unwrap();
        assert_eq!(ifs.len(), 1);
        assert_eq!(ifs[0].name, "add2");
    }

    #[tokio::test]
    async fn test_reregister_replaces_interfaces() {
        let (router, registry) = setup();
        let mut rx = add_conn(&registry, 100);

        router.process(
            100,
            &register_bytes(
                "app_sum",
                vec![
                    InterfaceDescriptor::new("add2", "%d%d", "%d"),
                    InterfaceDescriptor::new("add3", "%d%d%d", "%d"),
                ],
            ),
        );
        next_envelope(&mut rx).await;

        router.process(
            100,
            &register_bytes("app_sum", vec![InterfaceDescriptor::new("getinfo", "", "%s")]),
        );
        next_envelope(&mut rx).await;

        let ifs = registry.interfaces_of(100).unwrap();
        assert_eq!(ifs.len(), 1);
        assert_eq!(ifs[0].name, "getinfo");
    }

    #[tokio::test]
    async fn test_duplicate_name_evicts_old_connection() {
        let (router, registry) = setup();
        let mut rx_old = add_conn(&registry, 100);
        let mut rx_new = add_conn(&registry, 101);

        router.process(100, &register_bytes("app_sum", vec![]));
        next_envelope(&mut rx_old).await;

        router.process(101, &register_bytes("app_sum", vec![]));
        let ack = next_envelope(&mut rx_new).await;
        assert_eq!(ack.ret, Some(Value::Int(0)));

        assert_eq!(registry.conn_by_name("app_sum"), Some(101));
        assert!(registry.name_of(100).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_call_forwards_raw_bytes() {
        let (router, registry) = setup();
        let mut rx_a = add_conn(&registry, 100);
        let mut rx_b = add_conn(&registry, 101);
        router.process(100, &register_bytes("app_avg", vec![]));
        router.process(101, &register_bytes("app_sum", vec![]));
        next_envelope(&mut rx_a).await;
        next_envelope(&mut rx_b).await;

        let call = Envelope::call(
            "app_avg",
            "app_sum",
            "add2",
            vec![Value::Int(108), Value::Int(27)],
        )
        .encode()
        .unwrap();
        router.process(100, &call);

        let forwarded = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, call, "broker must forward bytes untouched");
    }

    #[tokio::test]
    async fn test_call_unknown_dnode_synthesizes_failure() {
        let (router, registry) = setup();
        let mut rx = add_conn(&registry, 100);
        router.process(100, &register_bytes("app_avg", vec![]));
        next_envelope(&mut rx).await;

        let call = Envelope::call("app_avg", "nowhere", "add2", vec![Value::Int(1)])
            .encode()
            .unwrap();
        router.process(100, &call);

        let failure = next_envelope(&mut rx).await;
        assert!(failure.is_call_failure());
        assert_eq!(failure.ret, Some(Value::Int(-1)));
        assert_eq!(failure.interface.as_deref(), Some("add2"));
        // Exactly one synthetic envelope.
        assert_nothing_queued(&mut rx).await;
    }

    #[tokio::test]
    async fn test_call_spoofed_snode_rejected() {
        let (router, registry) = setup();
        let mut rx_a = add_conn(&registry, 100);
        let mut rx_b = add_conn(&registry, 101);
        router.process(100, &register_bytes("app_avg", vec![]));
        router.process(101, &register_bytes("app_sum", vec![]));
        next_envelope(&mut rx_a).await;
        next_envelope(&mut rx_b).await;

        let spoofed = Envelope::call("someone_else", "app_sum", "add2", vec![])
            .encode()
            .unwrap();
        router.process(100, &spoofed);

        let failure = next_envelope(&mut rx_a).await;
        assert!(failure.is_call_failure());
        assert_nothing_queued(&mut rx_b).await;
    }

    #[tokio::test]
    async fn test_return_failure_drops_silently() {
        let (router, registry) = setup();
        let mut rx = add_conn(&registry, 100);
        router.process(100, &register_bytes("app_sum", vec![]));
        next_envelope(&mut rx).await;

        let ret = Envelope::ret("app_sum", "nowhere", "add2", Value::Int(135))
            .encode()
            .unwrap();
        router.process(100, &ret);
        // Asymmetric with call: no synthetic error comes back.
        assert_nothing_queued(&mut rx).await;
    }

    #[tokio::test]
    async fn test_exit_destroys_node() {
        let (router, registry) = setup();
        let _rx = add_conn(&registry, 100);
        router.process(100, &register_bytes("app_sum", vec![]));

        let exit = Envelope::exit("app_sum").encode().unwrap();
        assert_eq!(router.process(100, &exit), RouterVerdict::Disconnect);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_is_discarded() {
        let (router, registry) = setup();
        let mut rx = add_conn(&registry, 100);
        assert_eq!(router.process(100, b"{broken"), RouterVerdict::Continue);
        assert_eq!(
            router.process(100, br#"{"api":"mystery","snode":"x"}"#),
            RouterVerdict::Continue
        );
        assert_nothing_queued(&mut rx).await;
        assert_eq!(registry.len(), 1);
    }
}
