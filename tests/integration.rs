use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

use atlas_sd::config::{Config, Options};
use atlas_sd::registry::Registry;
use atlas_sd::service::Service;

const WAIT: Duration = Duration::from_secs(10);

/// Serves a single-page device listing on loopback, like a NetBox instance.
async fn fake_netbox() -> SocketAddr {
    async fn devices() -> Json<Value> {
        Json(json!({
            "count": 2,
            "next": null,
            "results": [
                {
                    "id": 7,
                    "name": "node007-bb091",
                    "display": "node007-bb091",
                    "device_type": {"manufacturer": {"id": 1, "name": "Dell"}, "model": "R640"},
                    "role": {"id": 2, "slug": "server"},
                    "status": {"value": "active", "label": "Active"},
                    "serial": "SN007",
                    "primary_ip": {"id": 70, "address": "10.0.0.7/24"}
                },
                {
                    "id": 8,
                    "name": "node008-bb091",
                    "status": {"value": "planned", "label": "Planned"},
                    "serial": "SN008",
                    "primary_ip": {"id": 80, "address": "10.0.0.8/24"}
                }
            ]
        }))
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/api/dcim/devices/", get(devices));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn netbox_config(netbox: SocketAddr) -> Config {
    let yaml = format!(
        r#"discoveries:
  netbox:
    netbox_host: http://{netbox}
    netbox_api_token: secret
    refresh_interval: 1
    targets_file_name: netbox.json
    dcim:
      devices:
        - role: server
          metrics_label: baremetal
          custom_labels:
            region: "{{{{ .Region }}}}"
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

fn options(dir: &Path) -> Options {
    Options {
        version: "test".to_string(),
        output_dir: dir.to_path_buf(),
        ..Options::default()
    }
}

async fn wait_for_file(path: &Path) -> String {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            if !content.is_empty() {
                return content;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "{} never written", path.display());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_status(url: &str, expected: u16) {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Ok(resp) = client.get(url).send().await {
            if resp.status().as_u16() == expected {
                return;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "{url} never returned {expected}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_netbox_pipeline_writes_file_and_reports_health() {
    let netbox = fake_netbox().await;
    let out = TempDir::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = listener.local_addr().unwrap();
    let service = Service::new(options(out.path()), netbox_config(netbox), Registry::with_builtins());
    let running = tokio::spawn(service.run(listener));

    let content = wait_for_file(&out.path().join("netbox.json")).await;
    let entries: Vec<Value> = serde_json::from_str(&content).unwrap();
    assert_eq!(entries.len(), 1, "planned device must not be published: {content}");
    assert_eq!(entries[0]["targets"], json!(["10.0.0.7"]));
    assert_eq!(entries[0]["labels"]["manufacturer"], "Dell");
    assert_eq!(entries[0]["labels"]["server_id"], "7");
    assert_eq!(entries[0]["labels"]["region"], "qa-de-1");
    assert_eq!(entries[0]["labels"]["metrics_label"], "baremetal");

    wait_for_status(&format!("http://{http}/healthz"), 200).await;

    let client = reqwest::Client::new();
    let metrics = client
        .get(format!("http://{http}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains(r#"atlas_sd_up{discovery="netbox",version="test"} 1"#), "{metrics}");
    assert!(metrics.contains(r#"atlas_targets{module="baremetal"} 1"#), "{metrics}");

    let reload = client.post(format!("http://{http}/-/reload")).send().await.unwrap();
    assert_eq!(reload.status().as_u16(), 200);

    let result = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_no_sources_is_unhealthy() {
    let out = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = listener.local_addr().unwrap();

    let config: Config = serde_yaml::from_str("discoveries:\n  vcenter:\n    targets_file_name: v.json\n").unwrap();
    let service = Service::new(options(out.path()), config, Registry::with_builtins());
    let token = service.shutdown_token();
    let running = tokio::spawn(service.run(listener));

    wait_for_status(&format!("http://{http}/healthz"), 503).await;

    token.cancel();
    let result = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_unreachable_backend_marks_source_down_and_keeps_output() {
    let out = TempDir::new().unwrap();
    let previous = r#"[{"targets":["10.9.9.9"],"labels":{}}]"#;
    fs::write(out.path().join("netbox.json"), previous).unwrap();

    // Bind and drop to get a port nothing listens on.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = listener.local_addr().unwrap();

    let service = Service::new(options(out.path()), netbox_config(dead), Registry::with_builtins());
    let token = service.shutdown_token();
    let running = tokio::spawn(service.run(listener));

    wait_for_status(&format!("http://{http}/healthz"), 503).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(fs::read_to_string(out.path().join("netbox.json")).unwrap(), previous);

    token.cancel();
    tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
}

fn atlas_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_atlas"))
}

#[test]
fn test_sources_command_lists_discoveries() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("config.yaml");
    fs::write(
        &config,
        "discoveries:\n  ironic:\n    targets_file_name: i.json\n  switches:\n    type: switch\n  vcenter: {}\n",
    )
    .unwrap();

    let output = Command::new(atlas_binary())
        .args(["--config-file", config.to_str().unwrap(), "sources"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines.iter().any(|l| l.starts_with("ironic") && l.ends_with("ok")));
    assert!(lines.iter().any(|l| l.starts_with("switches") && l.contains("switch") && l.ends_with("ok")));
    assert!(lines.iter().any(|l| l.starts_with("vcenter") && l.ends_with("unknown type")));
}

#[test]
fn test_missing_config_file_fails() {
    let output = Command::new(atlas_binary())
        .args(["--config-file", "/nonexistent/config.yaml", "sources"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
