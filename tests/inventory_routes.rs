use rmssh::auth::Secret;
use rmssh::error::ConnectError;
use rmssh::route::{HopKind, ProxyRouteResolver};
use rmssh::{ConnectOptions, ConnectionFactory, Inventory};

const INVENTORY_FIXTURE: &str = include_str!("fixtures/inventory.json");

fn load() -> Inventory {
    let mut inventory: Inventory = serde_json::from_str(INVENTORY_FIXTURE).expect("load fixture");
    inventory.merge_common();
    inventory
}

#[test]
fn fixture_inherits_common_defaults() {
    let inventory = load();
    let web2 = inventory.server("web2").expect("web2");

    assert_eq!(web2.user.as_deref(), Some("deploy"));
    assert_eq!(web2.port_or_default(), 2222);
    let password = Secret::parse(web2.password.as_deref().expect("password")).expect("decode");
    assert_eq!(password.reveal(), "hunter2");
    assert_eq!(password.to_stored(), "b64:aHVudGVyMg==");
}

#[test]
fn bastion_routes_are_outermost_first() {
    let inventory = load();
    let route = ProxyRouteResolver::new(&inventory).resolve("web2").expect("route");

    assert_eq!(route.path_description(), "bastion(ssh) -> web2(ssh)");
    assert_eq!(route.target().port, 2222);
    assert!(!route.is_direct());
}

#[test]
fn proxy_services_and_relays_start_the_route() {
    let inventory = load();
    let resolver = ProxyRouteResolver::new(&inventory);

    let db = resolver.resolve("db").expect("db route");
    assert_eq!(db.hops()[0].kind, HopKind::Socks5);
    assert_eq!(db.hops()[0].port, 1080);

    // The relay command wins over the bastion reference.
    let relay = resolver.resolve("relay").expect("relay route");
    assert_eq!(relay.hops().len(), 2);
    assert_eq!(relay.hops()[0].kind, HopKind::Command);
    assert_eq!(relay.hops()[0].name, "nc -X connect -x gw:3128 %h %p");
}

#[test]
fn proxy_cycles_are_rejected() {
    let inventory = load();
    let err = ProxyRouteResolver::new(&inventory)
        .resolve("loop-a")
        .expect_err("cycle");
    assert!(matches!(err, ConnectError::ProxyLoop { .. }));
}

#[tokio::test]
async fn preparing_a_target_resolves_its_bastion() {
    let factory = ConnectionFactory::new(load(), ConnectOptions::default());
    assert_eq!(factory.group("web").expect("group"), vec!["web1", "web2"]);

    let targets = vec!["web1".to_string(), "loop-a".to_string()];
    let (report, route_failures) = factory.prepare(&targets).await;

    assert!(report.resolved.contains(&"bastion".to_string()));
    assert!(report.resolved.contains(&"web1".to_string()));
    assert!(report.excluded.is_empty());
    assert_eq!(route_failures.len(), 1);
    assert_eq!(route_failures[0].0, "loop-a");
}
