use std::fs;

use berth_stage::{
    AuthMethod, ConfigError, Resolver, RuntimeConfig, Stage, StageDefinition, StageRegistry,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PRODUCTION2: &str = r#"
name = "production2"

[roles]
www = ["deployer@vpn.framsteg.de"]

[ssh_options]
port = 7047
keys_if_exist = ["config/deploy_id_rsa"]

[set]
deploy_to = "/var/www/pricewars-merchant2"
application = "pricewars-merchant"
api_token = "s3cr3t-token"

[[step]]
name = "check"
command = "test -d {deploy_to}"

[[step]]
name = "restart"
command = "touch tmp/restart.txt"
roles = ["www"]
within_deploy_to = true
"#;

fn project() -> (TempDir, StageRegistry) {
    let dir = TempDir::new().expect("tempdir");
    let stages = dir.path().join("config/deploy");
    fs::create_dir_all(&stages).expect("stages dir");
    fs::write(stages.join("production2.toml"), PRODUCTION2).expect("write stage");
    let config = RuntimeConfig::default()
        .with_stages_dir(&stages)
        .with_project_root(dir.path());
    let registry = StageRegistry::new(&config);
    (dir, registry)
}

// ---------------------------------------------------------------------------
// Round trip
// ---------------------------------------------------------------------------

#[test]
fn loaded_stage_serializes_back_to_an_equivalent_stage() {
    let (dir, registry) = project();
    let stage = registry.load_stage("production2").expect("load");

    let text = stage.to_toml().expect("serialize");
    let reparsed = StageDefinition::from_toml(&text).expect("reparse");
    let again = Stage::from_definition("production2", reparsed, dir.path()).expect("validate");

    assert_eq!(again.hosts(), stage.hosts());
    assert_eq!(again.roles(), stage.roles());
    assert_eq!(again.steps(), stage.steps());
    assert_eq!(again.ssh(), stage.ssh());
    assert_eq!(again.options(), stage.options());
    assert_eq!(again.digest(), stage.digest());
}

#[test]
fn digest_changes_when_definition_changes() {
    let (dir, registry) = project();
    let before = registry.load_stage("production2").expect("load");

    let edited = PRODUCTION2.replace("7047", "7048");
    fs::write(dir.path().join("config/deploy/production2.toml"), edited).expect("rewrite");
    let after = registry.load_stage("production2").expect("reload");

    assert_ne!(before.digest(), after.digest());
}

// ---------------------------------------------------------------------------
// production2 end to end through the resolver
// ---------------------------------------------------------------------------

#[test]
fn production2_resolves_to_a_single_www_target() {
    let (dir, registry) = project();
    let stage = registry.load_stage("production2").expect("load");

    assert_eq!(stage.options().deploy_to(), Some("/var/www/pricewars-merchant2"));
    assert_eq!(
        stage.options().secret("api_token").map(|s| s.expose()),
        Some("s3cr3t-token")
    );

    let resolver = Resolver::new(&RuntimeConfig::default().with_project_root(dir.path()));
    let targets = resolver
        .resolve_targets(&stage, &["www".to_string()])
        .expect("resolve");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].to_string(), "deployer@vpn.framsteg.de:7047");
    // The optional key file does not exist, so the agent is used.
    assert_eq!(targets[0].endpoint.auth, AuthMethod::Agent);
}

#[test]
fn production2_uses_key_file_when_present() {
    let (dir, registry) = project();
    fs::write(dir.path().join("config/deploy_id_rsa"), "KEY").expect("write key");
    let stage = registry.load_stage("production2").expect("load");

    let targets = Resolver::new(&RuntimeConfig::default())
        .resolve_targets(&stage, &[])
        .expect("resolve");
    assert_eq!(
        targets[0].endpoint.auth,
        AuthMethod::KeyFile(dir.path().join("config/deploy_id_rsa"))
    );
}

#[test]
fn secrets_never_show_in_debug_output() {
    let (_dir, registry) = project();
    let stage = registry.load_stage("production2").expect("load");

    let debug = format!("{stage:?}");
    assert!(!debug.contains("s3cr3t-token"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn name_mismatch_is_rejected() {
    let (dir, registry) = project();
    fs::write(
        dir.path().join("config/deploy/staging.toml"),
        "name = \"production\"\n[roles]\nwww = [\"web1\"]\n",
    )
    .expect("write");

    let err = registry.load_stage("staging").unwrap_err();
    assert!(matches!(err, ConfigError::NameMismatch { .. }));
}
