//! End-to-end scenarios for publish-style follow-up broadcasts: a
//! closest-nodes discovery followed by one store instruction per
//! discovered node.

#[path = "common/mod.rs"]
mod common;

use common::near_id;
use sdht_coord::behaviour::{
    BroadcastBehaviour, BroadcastBehaviourEvent, BroadcastCommand, BroadcastUpdate, BroadcastWaiter,
};
use sdht_coord::error::NodeError;
use sdht_coord::pool::PoolConfig;
use sdht_coord::protocol::{Message, MessageType};
use sdht_coord::{derive_node_id, NodeId, QueryId};

fn broadcast_behaviour() -> BroadcastBehaviour<Message> {
    BroadcastBehaviour::new(derive_node_id(b"local-node"), PoolConfig::default())
        .expect("valid config")
}

fn drain(behaviour: &BroadcastBehaviour<Message>) -> Vec<BroadcastCommand<Message>> {
    let mut commands = Vec::new();
    for _ in 0..16 {
        if let Some(command) = behaviour.perform() {
            commands.push(command);
        }
    }
    commands
}

fn start_publish(
    behaviour: &BroadcastBehaviour<Message>,
    target: [u8; 32],
    seed: Vec<NodeId>,
) -> tokio::sync::mpsc::Receiver<BroadcastUpdate> {
    let (waiter, updates) = BroadcastWaiter::channel();
    let value = b"published-record".to_vec();
    behaviour.notify(BroadcastBehaviourEvent::StartBroadcast {
        query_id: QueryId(1),
        target,
        msg_fn: Box::new(move |key| Message::put_value(key, value.clone())),
        seed,
        waiter: Some(waiter),
    });
    updates
}

/// Answer every outstanding closest-nodes request with an empty closer
/// list, returning the other commands that surface, in emission order.
fn answer_lookups(
    behaviour: &BroadcastBehaviour<Message>,
    commands: Vec<BroadcastCommand<Message>>,
) -> Vec<BroadcastCommand<Message>> {
    let mut produced = Vec::new();
    let mut pending = std::collections::VecDeque::from(commands);
    while let Some(command) = pending.pop_front() {
        match command {
            BroadcastCommand::GetCloserNodes { query_id, node, .. } => {
                behaviour.notify(BroadcastBehaviourEvent::GetCloserNodesSuccess {
                    query_id,
                    node,
                    closer_nodes: vec![],
                });
                pending.extend(drain(behaviour));
            }
            other => produced.push(other),
        }
    }
    produced
}

#[test]
fn publish_stores_record_with_every_discovered_node() {
    let behaviour = broadcast_behaviour();
    let target = [0u8; 32];
    let (x, y, z) = (near_id(1), near_id(2), near_id(3));
    let mut updates = start_publish(&behaviour, target, vec![x]);

    // discovery phase: the seed reports two closer nodes
    let commands = drain(&behaviour);
    assert!(matches!(
        commands.as_slice(),
        [BroadcastCommand::GetCloserNodes { node, .. }] if *node == x
    ));
    behaviour.notify(BroadcastBehaviourEvent::GetCloserNodesSuccess {
        query_id: QueryId(1),
        node: x,
        closer_nodes: vec![y, z],
    });
    let commands = drain(&behaviour);
    let store_commands = answer_lookups(&behaviour, commands);

    // store phase: one instruction per closest node, in discovery order
    let mut stored = Vec::new();
    let mut pending = store_commands;
    pending.extend(drain(&behaviour));
    for command in pending {
        match command {
            BroadcastCommand::StoreRecord {
                query_id,
                node,
                message,
                ..
            } => {
                assert_eq!(query_id, QueryId(1));
                assert_eq!(message.message_type, MessageType::PutValue);
                // the record is stored under the broadcast target key
                let record = message.record.expect("store message carries the record");
                assert_eq!(record.key, target.to_vec());
                stored.push(node);
            }
            BroadcastCommand::AddNode { .. } => {}
            other => panic!("unexpected command {other:?}"),
        }
    }
    assert_eq!(stored, vec![x, y, z]);

    // mixed acknowledgements
    behaviour.notify(BroadcastBehaviourEvent::StoreRecordSuccess {
        query_id: QueryId(1),
        node: x,
    });
    behaviour.notify(BroadcastBehaviourEvent::StoreRecordFailure {
        query_id: QueryId(1),
        node: y,
        error: NodeError::RequestTimeout,
    });
    behaviour.notify(BroadcastBehaviourEvent::StoreRecordSuccess {
        query_id: QueryId(1),
        node: z,
    });
    drain(&behaviour);

    match updates.try_recv().expect("terminal update") {
        BroadcastUpdate::Finished {
            query_id,
            contacted,
            errors,
        } => {
            assert_eq!(query_id, QueryId(1));
            assert_eq!(contacted, vec![x, y, z]);
            assert_eq!(errors.len(), 1);
            assert_eq!(errors.get(&y), Some(&NodeError::RequestTimeout));
        }
        other => panic!("expected Finished, got {other:?}"),
    }
    assert!(updates.try_recv().is_err(), "waiter must be closed");
}

#[test]
fn stopping_a_broadcast_cancels_outstanding_stores() {
    let behaviour = broadcast_behaviour();
    let (x, y) = (near_id(1), near_id(2));
    let mut updates = start_publish(&behaviour, [0u8; 32], vec![x]);

    let commands = drain(&behaviour);
    assert_eq!(commands.len(), 1);
    behaviour.notify(BroadcastBehaviourEvent::GetCloserNodesSuccess {
        query_id: QueryId(1),
        node: x,
        closer_nodes: vec![y],
    });
    let commands = drain(&behaviour);
    let stores = answer_lookups(&behaviour, commands);
    // at least the first store is already on the wire
    assert!(stores
        .iter()
        .chain(drain(&behaviour).iter())
        .any(|command| matches!(command, BroadcastCommand::StoreRecord { .. })));

    behaviour.notify(BroadcastBehaviourEvent::StopBroadcast {
        query_id: QueryId(1),
    });
    drain(&behaviour);

    match updates.try_recv().expect("terminal update") {
        BroadcastUpdate::Finished {
            contacted, errors, ..
        } => {
            assert_eq!(contacted, vec![x, y]);
            assert_eq!(errors.get(&x), Some(&NodeError::Cancelled));
            assert_eq!(errors.get(&y), Some(&NodeError::Cancelled));
        }
        other => panic!("expected Finished, got {other:?}"),
    }
}

#[test]
fn empty_discovery_finishes_broadcast_with_nothing_contacted() {
    let behaviour = broadcast_behaviour();
    let mut updates = start_publish(&behaviour, [0u8; 32], vec![]);

    assert!(drain(&behaviour).is_empty());
    match updates.try_recv().expect("terminal update") {
        BroadcastUpdate::Finished {
            contacted, errors, ..
        } => {
            assert!(contacted.is_empty());
            assert!(errors.is_empty());
        }
        other => panic!("expected Finished, got {other:?}"),
    }
}

#[test]
fn duplicate_broadcast_id_is_rejected_on_the_new_waiter() {
    let behaviour = broadcast_behaviour();
    let _updates = start_publish(&behaviour, [0u8; 32], vec![near_id(1)]);
    drain(&behaviour);

    let (waiter, mut duplicate_updates) = BroadcastWaiter::channel();
    behaviour.notify(BroadcastBehaviourEvent::StartBroadcast {
        query_id: QueryId(1),
        target: [1u8; 32],
        msg_fn: Box::new(|key| Message::get_value(key)),
        seed: vec![near_id(9)],
        waiter: Some(waiter),
    });
    drain(&behaviour);

    assert!(matches!(
        duplicate_updates.try_recv().expect("rejection update"),
        BroadcastUpdate::Rejected { query_id, .. } if query_id == QueryId(1)
    ));
}
