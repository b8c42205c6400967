//! Registration, lookup, lease and attribute behaviour through the public
//! `Registry` surface.

mod common;

use common::*;
use lodestar_engine::{LeaseTarget, RegistryConfig, RegistryError};
use lodestar_types::{
    AttrValue, Entry, LeaseId, ListenerEndpoint, ServiceId, ServiceItem, ServiceTemplate,
    ServiceType, Transition, TransitionMask,
};
use std::time::Duration;

fn short_leases() -> RegistryConfig {
    let mut config = RegistryConfig::in_memory();
    config.lease.min_max_service_lease_ms = 60_000;
    config
}

fn in_building(building: &str) -> ServiceTemplate {
    ServiceTemplate::any().with_attribute(
        Entry::empty(location_class())
            .with("building", building)
            .unwrap(),
    )
}

#[tokio::test]
async fn expired_item_disappears_and_is_announced_once() {
    let mut h = Harness::open(short_leases()).await;
    let sub = h
        .registry
        .subscribe(
            ServiceTemplate::any(),
            TransitionMask::new(TransitionMask::MATCH_NOMATCH).unwrap(),
            ListenerEndpoint::new("tcp://watcher"),
            b"hb".to_vec(),
            secs(600),
        )
        .await
        .unwrap();

    let a = h.registry.register(printer("A", 1), secs(60)).await.unwrap();
    assert_eq!(a.lease.granted, secs(60));
    assert_eq!(
        h.registry.lookup(&in_building("A")).await,
        Some(b"proxy:A:1".to_vec())
    );

    h.clock.advance(secs(61));
    assert_eq!(h.registry.lookup(&in_building("A")).await, None);

    // the expiry daemon may already have swept; either way the item is gone once
    let swept = h.registry.expire_services().await.unwrap();
    assert!(swept <= 1);
    assert_eq!(h.registry.metrics().await.services, 0);

    let (endpoint, event) = h.next_event().await;
    assert_eq!(endpoint, ListenerEndpoint::new("tcp://watcher"));
    assert_eq!(event.event_id, sub.event_id);
    assert_eq!(event.service_id, a.service_id);
    assert_eq!(event.transition, Transition::MatchNoMatch);
    assert!(event.item.is_none());
    assert!(event.sequence > sub.sequence);
    assert_eq!(event.handback, b"hb".to_vec());
    h.assert_quiet().await;

    let b = h.registry.register(printer("B", 2), secs(60)).await.unwrap();
    let granted = h
        .registry
        .renew_service_lease(b.service_id, b.lease.lease_id, secs(1_000_000))
        .await
        .unwrap();
    assert_eq!(granted, secs(60));
}

#[tokio::test]
async fn register_assigns_ids_and_replaces_by_id() {
    let h = Harness::open(RegistryConfig::in_memory()).await;

    let first = h.registry.register(printer("A", 1), secs(30)).await.unwrap();
    let second = h.registry.register(printer("A", 1), secs(30)).await.unwrap();
    assert_ne!(first.service_id, second.service_id);

    let replacement = printer("C", 3).with_id(first.service_id);
    let again = h.registry.register(replacement, secs(30)).await.unwrap();
    assert_eq!(again.service_id, first.service_id);
    assert_ne!(again.lease.lease_id, first.lease.lease_id);

    let found = h
        .registry
        .lookup_matches(&ServiceTemplate::by_id(first.service_id), 10)
        .await;
    assert_eq!(found.total_matches, 1);
    assert_eq!(found.items[0].service, b"proxy:C:3".to_vec());
    assert_eq!(h.registry.metrics().await.services, 2);

    // the old lease no longer holds the replaced registration
    let stale = h
        .registry
        .renew_service_lease(first.service_id, first.lease.lease_id, secs(30))
        .await;
    assert!(matches!(stale, Err(RegistryError::UnknownLease)));
}

#[tokio::test]
async fn register_rejects_bad_arguments() {
    let h = Harness::open(RegistryConfig::in_memory()).await;

    let zero = h.registry.register(printer("A", 1), Duration::ZERO).await;
    assert!(matches!(zero, Err(RegistryError::InvalidArgument(_))));

    let reserved = printer("A", 1).with_id(h.registry.registrar_id().await);
    let taken = h.registry.register(reserved, secs(10)).await;
    assert!(matches!(taken, Err(RegistryError::InvalidArgument(_))));
}

#[tokio::test]
async fn duplicate_attributes_are_collapsed() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    let item = printer("A", 1).with_attribute(location("A", 1));
    let reg = h.registry.register(item, secs(30)).await.unwrap();

    let found = h
        .registry
        .lookup_matches(&ServiceTemplate::by_id(reg.service_id), 1)
        .await;
    assert_eq!(found.items[0].attributes.len(), 1);
}

#[tokio::test]
async fn lookup_matches_counts_beyond_the_limit() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    for floor in 0..5 {
        h.registry.register(printer("A", floor), secs(30)).await.unwrap();
    }
    h.registry.register(printer("B", 0), secs(30)).await.unwrap();

    let some = h.registry.lookup_matches(&in_building("A"), 2).await;
    assert_eq!(some.items.len(), 2);
    assert_eq!(some.total_matches, 5);

    let count_only = h
        .registry
        .lookup_matches(&ServiceTemplate::by_type(printer_type()), 0)
        .await;
    assert!(count_only.items.is_empty());
    assert_eq!(count_only.total_matches, 6);
}

#[tokio::test]
async fn unlimited_request_is_granted_the_ceiling() {
    let h = Harness::open(short_leases()).await;
    let reg = h
        .registry
        .register(printer("A", 1), Duration::MAX)
        .await
        .unwrap();
    assert_eq!(reg.lease.granted, secs(60));
    assert_eq!(reg.lease.expiration, T0 + 60_000);
}

#[tokio::test]
async fn renewal_never_shortens_a_granted_lease() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    let reg = h.registry.register(printer("A", 1), secs(240)).await.unwrap();

    h.registry
        .set_min_max_service_lease(secs(10))
        .await
        .unwrap();
    h.clock.advance(secs(40));

    let granted = h
        .registry
        .renew_service_lease(reg.service_id, reg.lease.lease_id, secs(500))
        .await
        .unwrap();
    assert_eq!(granted, secs(200));

    let short = h
        .registry
        .renew_service_lease(reg.service_id, reg.lease.lease_id, secs(5))
        .await
        .unwrap();
    assert_eq!(short, secs(5));
}

#[tokio::test]
async fn ceiling_grows_with_population() {
    let mut config = RegistryConfig::in_memory();
    config.lease.min_max_service_lease_ms = 1_000;
    config.lease.min_max_event_lease_ms = 2_000;
    config.lease.min_renewal_interval_ms = 100;
    let h = Harness::open(config).await;

    for floor in 0..15 {
        h.registry.register(printer("A", floor), secs(1)).await.unwrap();
    }
    let metrics = h.registry.metrics().await;
    assert_eq!(metrics.max_service_lease, Duration::from_millis(1_500));
    assert_eq!(metrics.max_event_lease, Duration::from_millis(3_000));

    let reg = h.registry.register(printer("B", 0), Duration::MAX).await.unwrap();
    assert_eq!(reg.lease.granted, Duration::from_millis(1_500));
}

#[tokio::test]
async fn cancelled_service_is_gone() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    let reg = h.registry.register(printer("A", 1), secs(30)).await.unwrap();

    h.registry
        .cancel_service_lease(reg.service_id, reg.lease.lease_id)
        .await
        .unwrap();
    assert_eq!(h.registry.lookup(&in_building("A")).await, None);

    let twice = h
        .registry
        .cancel_service_lease(reg.service_id, reg.lease.lease_id)
        .await;
    assert!(matches!(twice, Err(RegistryError::UnknownLease)));
}

#[tokio::test]
async fn batch_renewal_reports_each_lease() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    let a = h.registry.register(printer("A", 1), secs(30)).await.unwrap();
    let sub = h
        .registry
        .subscribe(
            ServiceTemplate::any(),
            TransitionMask::all(),
            ListenerEndpoint::new("tcp://watcher"),
            Vec::new(),
            secs(30),
        )
        .await
        .unwrap();

    let targets = [
        LeaseTarget::Service(a.service_id, a.lease.lease_id),
        LeaseTarget::Service(ServiceId::new(), LeaseId::new()),
        LeaseTarget::Event(sub.event_id, sub.lease.lease_id),
    ];
    let results = h
        .registry
        .renew_leases(&targets, &[secs(60), secs(60), secs(90)])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(*results[0].as_ref().unwrap(), secs(60));
    assert!(matches!(results[1], Err(RegistryError::UnknownLease)));
    assert_eq!(*results[2].as_ref().unwrap(), secs(90));

    let mismatched = h.registry.renew_leases(&targets, &[secs(1)]).await;
    assert!(matches!(mismatched, Err(RegistryError::InvalidArgument(_))));

    let cancelled = h.registry.cancel_leases(&targets).await.unwrap();
    assert!(cancelled[0].is_ok());
    assert!(cancelled[1].is_err());
    assert!(cancelled[2].is_ok());
    assert_eq!(h.registry.metrics().await.services, 0);
    assert_eq!(h.registry.metrics().await.events, 0);
}

#[tokio::test]
async fn attribute_edits_apply_in_place() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    let reg = h.registry.register(printer("A", 1), secs(30)).await.unwrap();
    let (id, lease) = (reg.service_id, reg.lease.lease_id);

    h.registry
        .add_attributes(id, lease, vec![location("A", 1), location("B", 7)])
        .await
        .unwrap();
    let item = &h.registry.lookup_matches(&ServiceTemplate::by_id(id), 1).await.items[0];
    assert_eq!(item.attributes.len(), 2);

    let template = Entry::empty(location_class()).with("building", "B").unwrap();
    let change = Entry::empty(location_class()).with("floor", 9).unwrap();
    h.registry
        .modify_attributes(id, lease, vec![template.clone()], vec![Some(change)])
        .await
        .unwrap();
    assert_eq!(h.registry.lookup(&in_building("B")).await, Some(b"proxy:A:1".to_vec()));
    let floors = h
        .registry
        .field_values(&in_building("B"), 0, "floor")
        .await
        .unwrap();
    assert_eq!(floors, vec![AttrValue::Int(9)]);

    h.registry
        .modify_attributes(id, lease, vec![template], vec![None])
        .await
        .unwrap();
    assert_eq!(h.registry.lookup(&in_building("B")).await, None);

    let mismatched = h
        .registry
        .modify_attributes(id, lease, vec![location("A", 1)], vec![])
        .await;
    assert!(matches!(mismatched, Err(RegistryError::InvalidArgument(_))));

    h.registry.set_attributes(id, lease, vec![]).await.unwrap();
    let item = &h.registry.lookup_matches(&ServiceTemplate::by_id(id), 1).await.items[0];
    assert!(item.attributes.is_empty());

    let wrong_lease = h.registry.set_attributes(id, LeaseId::new(), vec![]).await;
    assert!(matches!(wrong_lease, Err(RegistryError::UnknownLease)));
}

#[tokio::test]
async fn browsing_reports_most_specific_types() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    let color = ServiceType::new("ColorPrinter", Some(printer_type()), vec![]);
    h.registry.register(printer("A", 1), secs(30)).await.unwrap();
    h.registry
        .register(
            ServiceItem::new(color.clone(), b"color".to_vec()).with_attribute(location("A", 2)),
            secs(30),
        )
        .await
        .unwrap();

    let below_printer = h
        .registry
        .service_types(&ServiceTemplate::by_type(printer_type()), "")
        .await;
    assert_eq!(below_printer, vec![color.clone()]);

    let mut all: Vec<String> = h
        .registry
        .service_types(&ServiceTemplate::any(), "")
        .await
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    all.sort();
    assert_eq!(all, vec!["ColorPrinter", "Printer"]);

    let classes = h.registry.entry_classes(&ServiceTemplate::any()).await;
    assert_eq!(classes, vec![location_class()]);
    let none = h.registry.entry_classes(&in_building("A")).await;
    assert!(none.is_empty());

    let mut floors = h
        .registry
        .field_values(&in_building("A"), 0, "floor")
        .await
        .unwrap();
    floors.sort();
    assert_eq!(floors, vec![AttrValue::Int(1), AttrValue::Int(2)]);

    let unknown = h.registry.field_values(&in_building("A"), 0, "colour").await;
    assert!(matches!(unknown, Err(RegistryError::InvalidArgument(_))));
}

#[tokio::test]
async fn shutdown_rejects_further_writes() {
    let h = Harness::open(RegistryConfig::in_memory()).await;
    let reg = h.registry.register(printer("A", 1), secs(30)).await.unwrap();

    h.registry.shutdown().await.unwrap();
    h.registry.shutdown().await.unwrap();

    let late = h.registry.register(printer("B", 1), secs(30)).await;
    assert!(matches!(late, Err(RegistryError::ShuttingDown)));
    let renew = h
        .registry
        .renew_service_lease(reg.service_id, reg.lease.lease_id, secs(30))
        .await;
    assert!(matches!(renew, Err(RegistryError::ShuttingDown)));

    // reads still answer from memory
    assert!(h.registry.lookup(&in_building("A")).await.is_some());
}

#[tokio::test]
async fn admin_settings_round_trip_through_metrics() {
    let h = Harness::open(RegistryConfig::in_memory()).await;

    h.registry.set_min_max_event_lease(secs(120)).await.unwrap();
    h.registry.set_min_renewal_interval(Duration::from_millis(250)).await.unwrap();
    h.registry.set_snapshot_weight(2.5).await.unwrap();
    h.registry.set_log_to_snapshot_threshold(50).await.unwrap();

    assert_eq!(h.registry.min_max_event_lease().await, secs(120));
    assert_eq!(h.registry.min_renewal_interval().await, Duration::from_millis(250));
    assert_eq!(h.registry.snapshot_weight().await, 2.5);
    assert_eq!(h.registry.log_to_snapshot_threshold().await, 50);
    assert_eq!(h.registry.metrics().await.max_event_lease, secs(120));

    let invalid = h.registry.set_min_max_service_lease(Duration::ZERO).await;
    assert!(matches!(invalid, Err(RegistryError::InvalidArgument(_))));
    let negative = h.registry.set_snapshot_weight(-1.0).await;
    assert!(matches!(negative, Err(RegistryError::InvalidArgument(_))));
}
