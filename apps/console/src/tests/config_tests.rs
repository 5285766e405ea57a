use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_settings_file(contents: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("territory_console_{suffix}.toml"));
    fs::write(&path, contents).expect("write settings");
    path
}

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn missing_file_yields_defaults() {
    let settings = load_settings_with(Path::new("/nonexistent/console.toml"), no_env);
    assert_eq!(settings, Settings::default());
}

#[test]
fn file_values_override_defaults() {
    let path = temp_settings_file(
        r#"
server_url = "https://game.example"
room = "alpha"
heartbeat_ms = 0
"#,
    );

    let settings = load_settings_with(&path, no_env);

    assert_eq!(settings.server_url, "https://game.example");
    assert_eq!(settings.room, "alpha");
    assert_eq!(settings.heartbeat_ms, 0);
    assert_eq!(settings.reconnect_delay_ms, 5000);
    fs::remove_file(path).expect("cleanup");
}

#[test]
fn environment_overrides_file() {
    let path = temp_settings_file("room = \"alpha\"\nmax_defense_bonus = 5\n");
    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__ROOM", "beta"),
        ("APP__TOKEN", "tok"),
        ("APP__MAX_DEFENSE_BONUS", "not-a-number"),
    ]);

    let settings = load_settings_with(&path, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.room, "beta");
    assert_eq!(settings.token.as_deref(), Some("tok"));
    assert_eq!(settings.max_defense_bonus, 5);
    fs::remove_file(path).expect("cleanup");
}

#[test]
fn unparsable_file_is_ignored() {
    let path = temp_settings_file("room = [not toml");
    let settings = load_settings_with(&path, no_env);
    assert_eq!(settings.room, "default");
    fs::remove_file(path).expect("cleanup");
}

#[test]
fn sync_config_carries_timings_and_realtime_override() {
    let settings = Settings {
        realtime_url: Some("wss://push.example/socket".into()),
        reconnect_delay_ms: 250,
        heartbeat_ms: 0,
        ..Settings::default()
    };

    let config = settings.sync_config().expect("config");

    assert_eq!(config.reconnect_delay, Duration::from_millis(250));
    assert!(config.heartbeat_incoming.is_zero());
    assert_eq!(
        config.resolved_realtime_url().expect("url").as_str(),
        "wss://push.example/socket"
    );
}

#[test]
fn sockjs_suffix_can_be_turned_off() {
    let path = temp_settings_file("server_url = \"http://game.example\"\nsockjs = false\n");

    let settings = load_settings_with(&path, no_env);
    let config = settings.sync_config().expect("config");

    assert!(!settings.sockjs);
    assert_eq!(
        config.resolved_realtime_url().expect("url").as_str(),
        "ws://game.example/ws"
    );
    fs::remove_file(path).expect("cleanup");
}

#[test]
fn rejects_non_http_server_url() {
    let settings = Settings {
        server_url: "ftp://game.example".into(),
        ..Settings::default()
    };
    assert!(settings.sync_config().is_err());
}
