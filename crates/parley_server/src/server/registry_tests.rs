#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ChatMessage, ConnectionId, RoomId, UserId};
use proptest::prelude::*;
use tokio::time::timeout;

use crate::server::registry::{ConnectionRegistry, RegistryConfig};

fn registry(capacity: usize) -> ConnectionRegistry {
	ConnectionRegistry::new(RegistryConfig {
		sink_queue_capacity: capacity,
		debug_logs: false,
	})
}

fn msg(room: RoomId, from: UserId, text: &str) -> Arc<ChatMessage> {
	Arc::new(ChatMessage {
		chat_id: room,
		user_id: from,
		login: format!("user{from}"),
		message: text.to_string(),
	})
}

#[tokio::test]
async fn deliver_skips_excluded_connection_only() {
	let reg = registry(16);
	let room = RoomId(1);

	let a = ConnectionId::new_v4();
	let (_ga, mut rx_a) = reg.attach(UserId(1), room, a);
	let (_gb, mut rx_b) = reg.attach(UserId(2), room, ConnectionId::new_v4());
	let (_gc, mut rx_c) = reg.attach(UserId(3), room, ConnectionId::new_v4());

	let delivered = reg.deliver(room, Some(a), msg(room, UserId(1), "hi"));
	assert_eq!(delivered, 2);

	for rx in [&mut rx_b, &mut rx_c] {
		let got = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected to receive within timeout")
			.expect("channel open");
		assert_eq!(got.message, "hi");
	}

	assert!(
		timeout(Duration::from_millis(50), rx_a.recv()).await.is_err(),
		"sender must not receive its own message"
	);
}

#[tokio::test]
async fn same_user_second_stream_still_receives() {
	let reg = registry(16);
	let room = RoomId(9);

	let first = ConnectionId::new_v4();
	let (_g1, _rx1) = reg.attach(UserId(1), room, first);
	let (_g2, mut rx2) = reg.attach(UserId(1), room, ConnectionId::new_v4());

	assert_eq!(reg.deliver(room, Some(first), msg(room, UserId(1), "echo?")), 1);
	let got = rx2.recv().await.expect("second stream receives");
	assert_eq!(got.message, "echo?");
}

#[tokio::test]
async fn deliver_is_scoped_to_room() {
	let reg = registry(16);
	let (_ga, mut rx_a) = reg.attach(UserId(1), RoomId(1), ConnectionId::new_v4());

	assert_eq!(reg.deliver(RoomId(2), None, msg(RoomId(2), UserId(2), "elsewhere")), 0);
	assert!(timeout(Duration::from_millis(50), rx_a.recv()).await.is_err());
}

#[tokio::test]
async fn full_sink_does_not_block_others() {
	let reg = registry(1);
	let room = RoomId(5);

	let (_slow_guard, mut slow_rx) = reg.attach(UserId(1), room, ConnectionId::new_v4());
	let (_fast_guard, mut fast_rx) = reg.attach(UserId(2), room, ConnectionId::new_v4());

	assert_eq!(reg.deliver(room, None, msg(room, UserId(3), "one")), 2);
	fast_rx.recv().await.expect("fast gets one");

	// slow never drained; only the fast sink has room
	assert_eq!(reg.deliver(room, None, msg(room, UserId(3), "two")), 1);
	assert_eq!(fast_rx.recv().await.expect("fast gets two").message, "two");
	assert_eq!(slow_rx.recv().await.expect("slow keeps first").message, "one");
}

#[tokio::test]
async fn closed_sink_is_skipped() {
	let reg = registry(4);
	let room = RoomId(2);

	let (_dead_guard, dead_rx) = reg.attach(UserId(1), room, ConnectionId::new_v4());
	drop(dead_rx);
	let (_live_guard, mut live_rx) = reg.attach(UserId(2), room, ConnectionId::new_v4());

	assert_eq!(reg.deliver(room, None, msg(room, UserId(3), "x")), 1);
	assert!(live_rx.recv().await.is_some());
}

#[test]
fn guard_drop_unregisters_and_removes_empty_room() {
	let reg = registry(4);
	let room = RoomId(3);

	let (guard, _rx) = reg.attach(UserId(7), room, ConnectionId::new_v4());
	assert_eq!(reg.room_connection_count(room), 1);
	assert_eq!(reg.rooms_for_user(UserId(7)), vec![room]);

	drop(guard);
	assert_eq!(reg.room_connection_count(room), 0);
	assert_eq!(reg.active_rooms(), 0);
	assert!(reg.rooms_for_user(UserId(7)).is_empty());
	reg.check_consistency().expect("consistent");
}

#[test]
fn unregister_twice_is_noop_and_spares_other_connections() {
	let reg = registry(4);
	let room = RoomId(1);

	let (tx1, _rx1) = tokio::sync::mpsc::channel(1);
	let (tx2, _rx2) = tokio::sync::mpsc::channel(1);
	let c1 = ConnectionId::new_v4();
	let c2 = ConnectionId::new_v4();

	let g1 = reg.register(UserId(1), room, c1, tx1);
	let _g2 = reg.register(UserId(1), RoomId(2), c2, tx2);

	reg.unregister(UserId(1), c1);
	reg.unregister(UserId(1), c1);

	assert_eq!(reg.room_connection_count(room), 0);
	assert_eq!(reg.room_connection_count(RoomId(2)), 1);
	assert_eq!(reg.rooms_for_user(UserId(1)), vec![RoomId(2)]);
	reg.check_consistency().expect("consistent");

	// guard drop after explicit unregister is harmless
	drop(g1);
	assert_eq!(reg.room_connection_count(RoomId(2)), 1);
}

#[derive(Debug, Clone)]
enum Op {
	Register { user: i64, room: i64 },
	Unregister { slot: usize },
	DropGuard { slot: usize },
}

fn op() -> impl Strategy<Value = Op> {
	prop_oneof![
		(1i64..4, 1i64..4).prop_map(|(user, room)| Op::Register { user, room }),
		(0usize..16).prop_map(|slot| Op::Unregister { slot }),
		(0usize..16).prop_map(|slot| Op::DropGuard { slot }),
	]
}

proptest! {
	#[test]
	fn maps_stay_consistent_under_churn(ops in proptest::collection::vec(op(), 1..64)) {
		let reg = registry(4);
		let mut live = Vec::new();
		let mut receivers = Vec::new();

		for op in ops {
			match op {
				Op::Register { user, room } => {
					let (guard, rx) = reg.attach(UserId(user), RoomId(room), ConnectionId::new_v4());
					live.push(guard);
					receivers.push(rx);
				}
				Op::Unregister { slot } => {
					if let Some(g) = live.get(slot % live.len().max(1)) {
						reg.unregister(g.user(), g.connection_id());
					}
				}
				Op::DropGuard { slot } => {
					if !live.is_empty() {
						let idx = slot % live.len();
						live.swap_remove(idx);
					}
				}
			}
			prop_assert!(reg.check_consistency().is_ok(), "{:?}", reg.check_consistency());
		}

		drop(live);
		prop_assert_eq!(reg.active_rooms(), 0);
		prop_assert!(reg.check_consistency().is_ok());
	}

	#[test]
	fn deliver_reaches_all_but_sender(n in 1usize..12, sender in 0usize..12) {
		let reg = registry(4);
		let room = RoomId(1);
		let sender = sender % n;

		let mut conns = Vec::new();
		for i in 0..n {
			let c = ConnectionId::new_v4();
			conns.push((reg.attach(UserId(i as i64), room, c), c));
		}

		let delivered = reg.deliver(room, Some(conns[sender].1), msg(room, UserId(sender as i64), "p"));
		prop_assert_eq!(delivered, n - 1);

		for (i, ((_, rx), _)) in conns.iter_mut().enumerate() {
			let got = rx.try_recv();
			prop_assert_eq!(got.is_ok(), i != sender);
		}
	}
}
