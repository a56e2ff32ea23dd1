// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod testutil;

use std::time::Duration;

use fabric_transport::{
    AdapterConfig, BindType, ClassOfService, DriverCaps, EventKind, PortError,
    RemotePortIdentity, RportAttrs, RportRoles, RportState, StackError,
    TargetId, Wwn,
};
use testutil::*;

#[tokio::test(start_paused = true)]
async fn flap_within_devloss_keeps_target() {
    let h = harness(config(30), DriverCaps::empty());
    let ids = target(0xa);

    let p = h.adapter.port_appeared(0, ids).await.unwrap();
    h.adapter.flush_scans().await;
    let addr = h.adapter.target_address(p).unwrap();
    assert_eq!(addr.target, TargetId(0));
    assert_eq!(addr.adapter, h.adapter.id());
    assert_eq!(h.stack.scans(), 1);

    h.adapter.port_disappeared(p).await;
    let info = h.adapter.rport(p).unwrap();
    assert_eq!(info.state, RportState::Blocked);
    assert!(info.dev_loss_armed);
    assert!(h.stack.calls().contains(&StackCall::Block(addr)));

    tokio::time::sleep(Duration::from_secs(10)).await;
    let again = h.adapter.port_appeared(0, ids).await.unwrap();
    assert_eq!(again, p);

    let info = h.adapter.rport(p).unwrap();
    assert_eq!(info.state, RportState::Online);
    assert_eq!(info.target_id, Some(TargetId(0)));
    assert!(!info.dev_loss_armed);
    assert_eq!(h.stack.calls().last(), Some(&StackCall::Unblock(addr)));

    // No rescan on reactivation, and the cancelled timer never fires.
    advance(&h.adapter, 60).await;
    assert_eq!(h.stack.scans(), 1);
    assert_eq!(h.stack.removals(), 0);
    assert_eq!(h.adapter.rport(p).unwrap().state, RportState::Online);
}

#[tokio::test(start_paused = true)]
async fn devloss_expiry_saves_binding() {
    let h = harness(config(30), DriverCaps::empty());
    let ids = target(0xa);

    let p = h.adapter.port_appeared(0, ids).await.unwrap();
    let addr = h.adapter.target_address(p).unwrap();
    h.adapter.flush_scans().await;
    h.adapter.port_disappeared(p).await;

    advance(&h.adapter, 29).await;
    assert_eq!(h.stack.removals(), 0);

    advance(&h.adapter, 2).await;
    assert_eq!(h.stack.removals(), 1);
    let unblock = h.stack.position(&StackCall::Unblock(addr)).unwrap();
    let remove = h.stack.position(&StackCall::Remove(addr)).unwrap();
    assert!(unblock < remove, "I/O is released before the target goes");

    let bindings = h.adapter.bindings();
    assert!(bindings.active.is_empty());
    assert_eq!(bindings.bound.len(), 1);
    let bound = &bindings.bound[0];
    assert_eq!(bound.state, RportState::NotPresent);
    assert_eq!(bound.target_id, Some(TargetId(0)));
    assert_eq!(bound.port_name, ids.port_name);
    assert_eq!(bound.node_name, Wwn::UNKNOWN);
    assert!(bound.roles.is_empty());
    assert!(!bound
        .flags
        .contains(fabric_transport::RportFlags::STGT_DELETE_PENDING));

    // Another endpoint shows up meanwhile and must not take id 0.
    let other = h.adapter.port_appeared(0, target(0xb)).await.unwrap();
    assert_eq!(h.adapter.target_address(other).unwrap().target, TargetId(1));

    let back = h.adapter.port_appeared(0, ids).await.unwrap();
    assert_eq!(back, p);
    let info = h.adapter.rport(back).unwrap();
    assert_eq!(info.state, RportState::Online);
    assert_eq!(info.target_id, Some(TargetId(0)));
    assert_eq!(info.node_name, ids.node_name);
    assert!(h.adapter.bindings().bound.is_empty());

    h.adapter.flush_scans().await;
    assert_eq!(h.stack.count(|c| *c == StackCall::Scan(addr)), 2);
}

#[tokio::test(start_paused = true)]
async fn identity_is_stable_across_flapping() {
    let h = harness(config(30), DriverCaps::empty());
    let ids = target(0xa);
    let p = h.adapter.port_appeared(0, ids).await.unwrap();
    let addr = h.adapter.target_address(p).unwrap();

    for round in 0..20u64 {
        h.adapter.port_disappeared(p).await;
        if round % 3 == 0 {
            // Unrelated discovery in between consumes ids of its own.
            h.adapter
                .port_appeared(0, target(0x100 + round))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(round % 7 + 1)).await;
        let again = h.adapter.port_appeared(0, ids).await.unwrap();
        assert_eq!(h.adapter.target_address(again), Some(addr));
    }
    advance(&h.adapter, 60).await;
    assert_eq!(h.stack.removals(), 0);
}

#[tokio::test(start_paused = true)]
async fn blocked_port_has_exactly_one_devloss_action() {
    let h = harness(config(30), DriverCaps::empty());
    let ids = target(0xa);
    let p = h.adapter.port_appeared(0, ids).await.unwrap();

    for _ in 0..5 {
        h.adapter.port_disappeared(p).await;
        // Duplicate loss notifications are ignored.
        h.adapter.port_disappeared(p).await;
        let blocks = h.stack.count(|c| matches!(c, StackCall::Block(_)));
        assert!(blocks >= 1);
        assert!(h.adapter.rport(p).unwrap().dev_loss_armed);
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.adapter.port_appeared(0, ids).await.unwrap();
        assert!(!h.adapter.rport(p).unwrap().dev_loss_armed);
    }
    assert_eq!(h.stack.count(|c| matches!(c, StackCall::Block(_))), 5);

    h.adapter.port_disappeared(p).await;
    h.adapter.port_disappeared(p).await;
    advance(&h.adapter, 120).await;
    assert_eq!(h.stack.removals(), 1);
}

#[tokio::test(start_paused = true)]
async fn appearance_waits_for_queued_teardown() {
    let h = harness(config(10), DriverCaps::empty());
    let ids = target(0xa);
    let p = h.adapter.port_appeared(0, ids).await.unwrap();
    let addr = h.adapter.target_address(p).unwrap();

    let release = h.stack.hold_next_removal();
    h.adapter.port_disappeared(p).await;
    tokio::time::sleep(Duration::from_secs(11)).await;
    h.adapter.flush_devloss().await;

    let adapter = h.adapter.clone();
    let appear =
        tokio::spawn(async move { adapter.port_appeared(0, ids).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!appear.is_finished(), "rediscovery must wait for teardown");
    assert_eq!(h.stack.removals(), 0);

    release.send(()).unwrap();
    let back = appear.await.unwrap().unwrap();
    assert_eq!(back, p);
    h.adapter.flush_scans().await;

    let remove = h.stack.position(&StackCall::Remove(addr)).unwrap();
    let calls = h.stack.calls();
    let rescan = calls
        .iter()
        .rposition(|c| *c == StackCall::Scan(addr))
        .unwrap();
    assert!(remove < rescan);
    assert_eq!(h.adapter.rports().len(), 1);
    assert!(h.adapter.bindings().bound.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_target_role_keeps_port_and_id() {
    let h = harness(config(30), DriverCaps::empty());
    let p = h.adapter.port_appeared(0, target(0xa)).await.unwrap();
    let addr = h.adapter.target_address(p).unwrap();

    h.adapter.port_role_changed(p, RportRoles::FCP_INITIATOR).await;
    h.adapter.flush_work().await;

    assert_eq!(h.stack.removals(), 1);
    assert!(h.stack.calls().contains(&StackCall::Remove(addr)));
    let info = h.adapter.rport(p).unwrap();
    assert_eq!(info.state, RportState::Online);
    assert_eq!(info.target_id, Some(TargetId(0)));
    assert_eq!(info.roles, RportRoles::FCP_INITIATOR);
    assert!(!info.dev_loss_armed);
    assert!(!h.stack.calls().iter().any(|c| matches!(c, StackCall::Block(_))));
}

#[tokio::test(start_paused = true)]
async fn gaining_target_role_allocates_and_scans() {
    let h = harness(config(30), DriverCaps::empty());
    let mut events = h.adapter.subscribe_events();

    let p = h.adapter.port_appeared(0, initiator(0xa)).await.unwrap();
    h.adapter.flush_scans().await;
    assert_eq!(h.adapter.target_address(p), None);
    assert_eq!(h.stack.scans(), 0);

    let roles = RportRoles::FCP_TARGET | RportRoles::FCP_INITIATOR;
    h.adapter.port_role_changed(p, roles).await;
    h.adapter.flush_scans().await;

    let addr = h.adapter.target_address(p).unwrap();
    assert_eq!(addr.target, TargetId(0));
    assert_eq!(h.stack.scans(), 1);
    assert_eq!(h.adapter.pending_scans(), 0);

    let event = events.recv().await.unwrap();
    assert_eq!(event.host, h.adapter.id());
    assert_eq!(
        event.kind,
        EventKind::NewTarget { address: addr, port_name: Wwn(0xa) }
    );
}

#[tokio::test(start_paused = true)]
async fn role_change_on_reappearance() {
    let h = harness(config(30), DriverCaps::empty());
    let p = h.adapter.port_appeared(0, initiator(0xa)).await.unwrap();

    // A duplicate appearance carrying new roles is treated as a role change.
    let again = h.adapter.port_appeared(0, target(0xa)).await.unwrap();
    assert_eq!(again, p);
    h.adapter.flush_scans().await;
    assert_eq!(h.adapter.target_address(p).unwrap().target, TargetId(0));
    assert_eq!(h.stack.scans(), 1);
    assert_eq!(h.adapter.rports().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reappearing_without_target_role_removes_target() {
    let h = harness(config(30), DriverCaps::empty());
    let p = h.adapter.port_appeared(0, target(0xa)).await.unwrap();
    let addr = h.adapter.target_address(p).unwrap();
    h.adapter.port_disappeared(p).await;

    let again = h.adapter.port_appeared(0, initiator(0xa)).await.unwrap();
    assert_eq!(again, p);
    h.adapter.flush_work().await;

    assert_eq!(h.stack.count(|c| *c == StackCall::Remove(addr)), 1);
    let info = h.adapter.rport(p).unwrap();
    assert_eq!(info.state, RportState::Online);
    assert_eq!(info.target_id, Some(TargetId(0)));
    assert!(!info.dev_loss_armed);

    advance(&h.adapter, 60).await;
    assert_eq!(h.stack.removals(), 1);
}

#[tokio::test(start_paused = true)]
async fn non_target_loss_deletes_immediately() {
    let h = harness(config(30), DriverCaps::empty());
    let p = h.adapter.port_appeared(0, initiator(0xa)).await.unwrap();
    let number = p.number();

    h.adapter.port_disappeared(p).await;
    h.adapter.flush_work().await;

    assert!(h.adapter.rport(p).is_none());
    assert!(h.adapter.rports().is_empty());
    assert!(h.stack.calls().contains(&StackCall::Removed(number)));
    assert!(!h.stack.calls().iter().any(|c| matches!(c, StackCall::Block(_))));

    // Loss of an unknown port is a no-op.
    h.adapter.port_disappeared(p).await;
}

#[tokio::test(start_paused = true)]
async fn explicit_removal_drops_binding() {
    let h = harness(config(30), DriverCaps::empty());
    let ids = target(0xa);
    let p = h.adapter.port_appeared(0, ids).await.unwrap();
    let addr = h.adapter.target_address(p).unwrap();

    h.adapter.remote_port_remove(p).await;
    h.adapter.flush_work().await;

    assert!(h.stack.calls().contains(&StackCall::Remove(addr)));
    assert!(h.stack.calls().contains(&StackCall::Removed(p.number())));
    let bindings = h.adapter.bindings();
    assert!(bindings.active.is_empty());
    assert!(bindings.bound.is_empty());

    let fresh = h.adapter.port_appeared(0, ids).await.unwrap();
    assert_ne!(fresh, p);
    assert_eq!(h.adapter.target_address(fresh).unwrap().target, TargetId(1));
}

#[tokio::test(start_paused = true)]
async fn registration_failure_unwinds() {
    let h = harness(config(30), DriverCaps::empty());
    h.stack.fail_next_add();

    let err = h.adapter.port_appeared(0, target(0xa)).await.unwrap_err();
    assert_eq!(err, PortError::Registration(StackError::NoMemory));
    assert!(h.adapter.rports().is_empty());

    let p = h.adapter.port_appeared(0, target(0xa)).await.unwrap();
    assert_eq!(h.adapter.target_address(p).unwrap().target, TargetId(0));
}

#[tokio::test(start_paused = true)]
async fn channels_are_separate_identities() {
    let h = harness(config(30), DriverCaps::empty());
    let a = h.adapter.port_appeared(0, target(0xa)).await.unwrap();
    let b = h.adapter.port_appeared(1, target(0xa)).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(h.adapter.target_address(b).unwrap().channel, 1);
    assert_eq!(h.adapter.find_rport(Wwn(0xa)), Some(a));
}

#[tokio::test(start_paused = true)]
async fn bind_by_node_name() {
    let cfg = AdapterConfig {
        bind_type: BindType::ByWwnn,
        dev_loss_tmo: 10,
        ..Default::default()
    };
    let h = harness(cfg, DriverCaps::empty());
    let ids = target(0xa);
    let p = h.adapter.port_appeared(0, ids).await.unwrap();
    h.adapter.port_disappeared(p).await;
    advance(&h.adapter, 11).await;

    // Same node behind a different port name.
    let mut moved = ids;
    moved.port_name = Wwn(0xb);
    let back = h.adapter.port_appeared(0, moved).await.unwrap();
    assert_eq!(back, p);
    assert_eq!(h.adapter.target_address(back).unwrap().target, TargetId(0));
}

#[tokio::test(start_paused = true)]
async fn ports_sharing_a_node_stay_separate() {
    let cfg = AdapterConfig {
        bind_type: BindType::ByWwnn,
        dev_loss_tmo: 10,
        ..Default::default()
    };
    let h = harness(cfg, DriverCaps::empty());
    let first = target(0xa);
    let second = RemotePortIdentity { port_name: Wwn(0xb), ..first };

    let pa = h.adapter.port_appeared(0, first).await.unwrap();
    let pb = h.adapter.port_appeared(0, second).await.unwrap();
    assert_ne!(pa, pb);

    let a = h.adapter.rport(pa).unwrap();
    let b = h.adapter.rport(pb).unwrap();
    assert_eq!(a.port_name, Wwn(0xa));
    assert_eq!(b.port_name, Wwn(0xb));
    assert_eq!(a.target_id, Some(TargetId(0)));
    assert_eq!(b.target_id, Some(TargetId(1)));
    assert_eq!(h.adapter.rports().len(), 2);

    // A repeated notification for either port is still a duplicate.
    assert_eq!(h.adapter.port_appeared(0, first).await.unwrap(), pa);
    assert_eq!(h.adapter.port_appeared(0, second).await.unwrap(), pb);
    assert_eq!(h.adapter.rports().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn port_attributes() {
    let h = harness(config(30), DriverCaps::empty());
    let p = h.adapter.port_appeared(0, target(0xa)).await.unwrap();

    h.adapter
        .set_rport_attrs(
            p,
            RportAttrs {
                maxframe_size: Some(2048),
                supported_classes: ClassOfService::CLASS_3,
            },
        )
        .unwrap();
    let info = h.adapter.rport(p).unwrap();
    assert_eq!(info.maxframe_size, Some(2048));
    assert_eq!(info.supported_classes, ClassOfService::CLASS_3);

    assert!(matches!(
        h.adapter.set_dev_loss_tmo(p, 0),
        Err(PortError::InvalidTimeout(_))
    ));
    assert!(matches!(
        h.adapter.set_dev_loss_tmo(p, 601),
        Err(PortError::InvalidTimeout(_))
    ));
    h.adapter.set_dev_loss_tmo(p, 20).unwrap();
    assert!(matches!(
        h.adapter.set_fast_io_fail_tmo(p, Some(20)),
        Err(PortError::InvalidTimeout(_))
    ));
    h.adapter.set_fast_io_fail_tmo(p, Some(5)).unwrap();
    assert!(matches!(
        h.adapter.set_dev_loss_tmo(p, 5),
        Err(PortError::InvalidTimeout(_))
    ));
    h.adapter.set_fast_io_fail_tmo(p, Some(-1)).unwrap();

    let info = h.adapter.rport(p).unwrap();
    assert_eq!(info.dev_loss_tmo, 20);
    assert_eq!(info.fast_io_fail_tmo, None);

    // Attributes are cleared once the port is only a binding.
    h.adapter.port_disappeared(p).await;
    advance(&h.adapter, 21).await;
    let bound = h.adapter.rport(p).unwrap();
    assert_eq!(bound.state, RportState::NotPresent);
    assert_eq!(bound.maxframe_size, None);
    assert!(bound.supported_classes.is_empty());
}
