//! Inventory loading from a directory tree of per-group YAML files,
//! including tagged values and group option inheritance.

use frog::prelude::*;

fn write_inventory(dir: &std::path::Path) {
    write_inventory_with_var(dir, "FROG_TEST_DB_PASSWORD");
}

/// The password variable is per-test: tests in one binary run in parallel
/// and must not race on the environment.
fn write_inventory_with_var(dir: &std::path::Path, password_var: &str) {
    std::fs::create_dir_all(dir.join("nested")).unwrap();
    let core = r#"
options:
  jump_via:
    host: bastion.iad1.example.com
    should_sudo: false
    connection_method:
      type: ssh
      options:
        hostname: bastion.iad1.example.com
hosts:
  - host: web-n01.iad1.example.com
    connection_method:
      type: ssh
      options:
        hostname: web-n01.iad1.example.com
        port: 2222
  - host: db-n01.iad1.example.com
    jump_via:
      host: dbgw.iad1.example.com
      should_sudo: false
    connection_method:
      type: ssh
      options:
        hostname: db-n01.iad1.example.com
        password: !env_or_prompt FROG_TEST_DB_PASSWORD
"#;
    std::fs::write(
        dir.join("core.yaml"),
        core.replace("FROG_TEST_DB_PASSWORD", password_var),
    )
    .unwrap();
    std::fs::write(
        dir.join("nested").join("edge.yaml"),
        r#"
hosts:
  - host: edge-n01.lhr.example.com
    should_sudo: false
    connection_method:
      type: docker
      options:
        container: edge
"#,
    )
    .unwrap();
}

#[test]
fn loads_groups_recursively_and_inherits_options() {
    let tmp = tempfile::tempdir().unwrap();
    write_inventory(tmp.path());

    let inventory = Inventory::load(&[tmp.path().to_owned()]).unwrap();
    assert_eq!(inventory.len(), 3);
    assert!(inventory.groups().contains_key("core"));
    assert!(inventory.groups().contains_key("edge"));

    let web = inventory
        .iter()
        .find(|h| h.host == "web-n01.iad1.example.com")
        .unwrap();
    // Group-level jump_via applies to hosts without their own.
    assert_eq!(
        web.jump_via.as_ref().unwrap().host,
        "bastion.iad1.example.com"
    );

    let db = inventory
        .iter()
        .find(|h| h.host == "db-n01.iad1.example.com")
        .unwrap();
    assert_eq!(db.jump_via.as_ref().unwrap().host, "dbgw.iad1.example.com");
}

#[test]
fn tagged_passwords_resolve_from_the_environment() {
    let tmp = tempfile::tempdir().unwrap();
    write_inventory_with_var(tmp.path(), "FROG_TEST_DB_PASSWORD_SET");
    std::env::set_var("FROG_TEST_DB_PASSWORD_SET", "shhh");

    let inventory = Inventory::load(&[tmp.path().to_owned()]).unwrap();
    let resolved = inventory
        .resolve_tags(&TagResolver::non_interactive())
        .unwrap();

    let db = resolved
        .iter()
        .find(|h| h.host == "db-n01.iad1.example.com")
        .unwrap();
    let method = db.connection_method().unwrap().unwrap();
    match method {
        frog::connection::ConnectionMethod::Ssh(opts) => {
            assert_eq!(opts.password.as_deref(), Some("shhh"));
        }
        other => panic!("unexpected method {other:?}"),
    }
}

#[test]
fn unresolved_prompt_fails_cleanly_when_not_interactive() {
    let tmp = tempfile::tempdir().unwrap();
    write_inventory_with_var(tmp.path(), "FROG_TEST_DB_PASSWORD_UNSET");
    std::env::remove_var("FROG_TEST_DB_PASSWORD_UNSET");

    let inventory = Inventory::load(&[tmp.path().to_owned()]).unwrap();
    assert!(inventory
        .resolve_tags(&TagResolver::non_interactive())
        .is_err());
}

#[test]
fn selection_survives_file_loading() {
    let tmp = tempfile::tempdir().unwrap();
    write_inventory(tmp.path());

    let inventory = Inventory::load(&[tmp.path().to_owned()]).unwrap();
    let subset = inventory.select("edge-n01.lhr.example.com");
    assert_eq!(subset.len(), 1);
    assert!(subset.iter().all(|h| h.host == "edge-n01.lhr.example.com"));
}
