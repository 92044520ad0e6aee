//! Integration tests for the hostrpc-server binary.
//!
//! Each test spawns the binary on an auto-assigned port, reads the
//! `RPC_PORT=` line it prints, and drives it with the library client.

use hostrpc::{RpcClient, RpcSettings};
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

fn client(port: u16) -> RpcClient {
    RpcClient::with_settings(port, &RpcSettings::default()).expect("Failed to build client")
}

/// Wait for server to answer `is_running`.
async fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let client = client(port);
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if client.is_running().await.unwrap_or(false) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

struct ServerProcess {
    child: tokio::process::Child,
    port: u16,
}

impl ServerProcess {
    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.child.wait()).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

fn binary() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_hostrpc-server") {
        return Ok(PathBuf::from(path));
    }
    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target directory for fallback".to_string())?;
    let mut fallback = target_dir.join("hostrpc-server");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_hostrpc-server not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

/// Start the binary and wait until it answers.
async fn start_server(extra_args: &[&str]) -> Result<ServerProcess, String> {
    let mut child = tokio::process::Command::new(binary()?)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .args(extra_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn hostrpc-server: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read hostrpc-server stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port = discovered_port
        .ok_or_else(|| "RPC_PORT line not emitted by hostrpc-server".to_string())?;
    if !wait_for_server(port, 15).await {
        return Err(format!("hostrpc-server not running on port {port}"));
    }
    Ok(ServerProcess { child, port })
}

#[tokio::test]
async fn test_register_and_call_headless() {
    let mut server = start_server(&[]).await.expect("server should start");
    let client = client(server.port);

    let confirmation = client
        .add_new_callable(
            "add",
            "function add(a, b) {\n    return a + b;\n}",
            &[],
            &Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(confirmation, "'add' was added to the server");
    assert_eq!(client.call("add", vec![json!(2), json!(3)]).await.unwrap(), json!(5));

    assert!(client.list_methods().await.unwrap().contains(&"add".to_string()));

    assert!(client.kill().await.unwrap());
    assert!(server.wait_exit(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_blender_host_drains_queue() {
    let mut server = start_server(&["--host-kind", "blender"])
        .await
        .expect("server should start");
    let client = client(server.port);

    client
        .add_new_callable(
            "shout",
            "function shout(text) { return text.toUpperCase() + \"!\"; }",
            &[],
            &Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        client.call("shout", vec![json!("cube")]).await.unwrap(),
        json!("CUBE!")
    );

    assert!(client.kill().await.unwrap());
    assert!(server.wait_exit(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_unreal_host_reports_script_errors() {
    let server = start_server(&["--host-kind", "unreal"])
        .await
        .expect("server should start");
    let client = client(server.port);

    client
        .add_new_callable(
            "fail",
            "function fail() { throw new RangeError(\"out of bounds\"); }",
            &[],
            &Default::default(),
        )
        .await
        .unwrap();
    let err = client.call("fail", vec![]).await.unwrap_err();
    let remote = err.as_remote().expect("fault should be rebuilt");
    assert_eq!(remote.kind().name(), "RangeError");
    assert_eq!(remote.message(), "out of bounds");
}

#[tokio::test]
async fn test_blocking_server_stops_on_kill() {
    let mut server = start_server(&["--blocking"]).await.expect("server should start");
    let client = client(server.port);

    client.set_env("HOSTRPC_TEST_VALUE", "42").await.unwrap();
    client
        .add_new_callable(
            "read_env",
            "function read_env(name) { return process.env[name]; }",
            &[],
            &Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        client.call("read_env", vec![json!("HOSTRPC_TEST_VALUE")]).await.unwrap(),
        json!("42")
    );

    assert!(client.kill().await.unwrap());
    assert!(server.wait_exit(Duration::from_secs(10)).await);
}
