// End-to-end allocation, key and rendering scenarios

use std::collections::HashSet;
use tempfile::TempDir;
use wg_provision::config::parse_config;
use wg_provision::error::ProvisionError;
use wg_provision::keystore::{KeyStore, NativeKeyGenerator};
use wg_provision::provision::{prepare, write_outputs, Prepared};
use wg_provision::types::Config;

fn config(dir: &TempDir, clients: &str, network: &str) -> Config {
    let text = format!(
        r#"
[general]
host = "vpn.example.org"
materials_dir = "{keys}"
output_dir = "{out}"
qr_codes = false

[network]
{network}

[roster]
clients = {clients}
"#,
        keys = dir.path().join("keys").display(),
        out = dir.path().join("out").display(),
        network = network,
        clients = clients
    );
    parse_config(&text).unwrap()
}

fn run(config: &Config) -> Result<Prepared, ProvisionError> {
    let mut keys = KeyStore::open(&config.general.materials_dir, NativeKeyGenerator).unwrap();
    prepare(config, config.network_block(), &mut keys)
}

/// Values of every `key = ...` line in a document
fn values<'a>(doc: &'a str, key: &str) -> Vec<&'a str> {
    doc.lines()
        .filter_map(|line| line.split_once(" = "))
        .filter(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .collect()
}

#[test]
fn test_skipped_slot_keeps_its_ordinal() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, r#"["alice", "", "bob"]"#, r#"ipv4 = "10.66.0.0/24""#);
    let prepared = run(&config).unwrap();

    let addresses: Vec<_> = prepared
        .clients
        .iter()
        .map(|c| (c.name.as_str(), c.ordinal(), c.allocation.ipv4_addr().to_string()))
        .collect();
    assert_eq!(
        addresses,
        vec![
            ("alice", 2, "10.66.0.2".to_string()),
            ("bob", 4, "10.66.0.4".to_string())
        ]
    );

    let server = prepared.server_config.as_str();
    assert_eq!(prepared.server_config.peer_count(), 2);
    assert_eq!(values(server, "AllowedIPs"), vec!["10.66.0.2/32", "10.66.0.4/32"]);
    assert_eq!(values(server, "ListenPort"), vec!["51820"]);
}

#[test]
fn test_dual_stack_client_document() {
    let dir = TempDir::new().unwrap();
    let config = config(
        &dir,
        r#"["alice", "", "bob"]"#,
        "ipv4 = \"10.66.0.0/24\"\nipv6 = \"fd00:1::/64\"",
    );
    let prepared = run(&config).unwrap();

    let alice = prepared.client_configs[0].as_str();
    let address = values(alice, "Address");
    assert_eq!(address.len(), 1);
    let parts: Vec<_> = address[0].split(", ").collect();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0], "10.66.0.2/24");
    assert!(parts[1].starts_with("fd00:1::") && parts[1].ends_with("/64"));

    assert_eq!(values(alice, "AllowedIPs"), vec!["0.0.0.0/0, ::/0"]);
}

#[test]
fn test_capacity_exceeded_before_any_key() {
    let dir = TempDir::new().unwrap();
    let config = config(
        &dir,
        r#"["alice", "bob", "carol"]"#,
        r#"ipv4 = "10.66.0.0/30""#,
    );

    let err = run(&config).unwrap_err();
    assert!(matches!(err, ProvisionError::Allocation { .. }));

    let written = std::fs::read_dir(&config.general.materials_dir)
        .unwrap()
        .count();
    assert_eq!(written, 0);
}

#[test]
fn test_rerun_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let config = config(
        &dir,
        r#"["alice", "", "bob"]"#,
        "ipv4 = \"10.66.0.0/24\"\nipv6 = \"fd00:1::/64\"",
    );

    let first = run(&config).unwrap();
    write_outputs(&config, &first, None).unwrap();
    let alice_on_disk = std::fs::read_to_string(config.general.output_dir.join("alice.conf")).unwrap();

    let second = run(&config).unwrap();
    write_outputs(&config, &second, None).unwrap();

    assert_eq!(first.server_config, second.server_config);
    assert_eq!(first.client_configs, second.client_configs);
    assert_eq!(first.interface_script, second.interface_script);
    assert_eq!(
        alice_on_disk,
        std::fs::read_to_string(config.general.output_dir.join("alice.conf")).unwrap()
    );
}

#[test]
fn test_removing_client_keeps_others_stable() {
    let dir = TempDir::new().unwrap();
    let before = config(&dir, r#"["alice", "carol", "bob"]"#, "");
    let after = config(&dir, r#"["alice", "", "bob"]"#, "");

    let full = run(&before).unwrap();
    let trimmed = run(&after).unwrap();

    let bob_before = full.clients.iter().find(|c| c.name == "bob").unwrap();
    let bob_after = trimmed.clients.iter().find(|c| c.name == "bob").unwrap();
    assert_eq!(bob_before, bob_after);
    assert_eq!(full.server_identity, trimmed.server_identity);
    assert!(!trimmed.server_config.as_str().contains(
        &full.clients.iter().find(|c| c.name == "carol").unwrap().identity.public_key
    ));
}

#[test]
fn test_client_addresses_match_server_host_routes() {
    let dir = TempDir::new().unwrap();
    let config = config(
        &dir,
        r#"["alice", "", "bob", "dave"]"#,
        "ipv4 = \"10.66.0.0/24\"\nipv6 = \"fd00:1::/64\"",
    );
    let prepared = run(&config).unwrap();
    let server = prepared.server_config.as_str();
    let server_routes = values(server, "AllowedIPs");
    let server_keys = values(server, "PublicKey");

    for (idx, doc) in prepared.client_configs.iter().enumerate() {
        let client = &prepared.clients[idx];
        assert_eq!(server_keys[idx], client.identity.public_key);

        let own: Vec<String> = values(doc.as_str(), "Address")[0]
            .split(", ")
            .map(|cidr| cidr.split('/').next().unwrap().to_string())
            .collect();
        let routes: Vec<String> = server_routes[idx]
            .split(", ")
            .map(|cidr| cidr.split('/').next().unwrap().to_string())
            .collect();
        assert_eq!(own, routes, "address mismatch for {}", doc.name());
    }
}

#[test]
fn test_addresses_and_keys_are_distinct() {
    let dir = TempDir::new().unwrap();
    let names: Vec<String> = (0..20).map(|i| format!("\"client{}\"", i)).collect();
    let config = config(
        &dir,
        &format!("[{}]", names.join(", ")),
        "ipv4 = \"10.66.0.0/24\"\nipv6 = \"fd00:1::/64\"",
    );
    let prepared = run(&config).unwrap();

    let mut v4 = HashSet::new();
    let mut v6 = HashSet::new();
    let mut keys = HashSet::new();
    assert!(keys.insert(prepared.server_identity.public_key.clone()));
    for client in &prepared.clients {
        assert!(v4.insert(client.allocation.ipv4_addr()));
        assert!(v6.insert(client.allocation.ipv6_addr().unwrap()));
        assert!(keys.insert(client.identity.public_key.clone()));
    }
    assert!(!v4.contains(&prepared.server_allocation.ipv4_addr()));
}
